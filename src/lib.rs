pub mod cia402;
pub mod cmd_header;
pub mod config;
pub mod constant;
pub mod data_type;
pub mod emergency;
pub mod error;
pub mod network;
pub mod nmt;
pub mod node;
pub mod object_dictionary;
pub mod pdo;
pub mod remote_node;
pub mod sdo_client;
pub mod sdo_server;
pub mod sync;
pub mod util;
pub mod value;
pub mod variable;

mod prelude;

pub use cia402::{Cia402Node, HomingStatus, OperationMode, State402};
pub use config::{Cia402Config, NmtConfig, NodeConfig, PdoMappingLayout, SdoConfig};
pub use data_type::DataType;
pub use emergency::{EmcyConsumer, EmcyError, EmcyProducer};
pub use error::{AbortCode, Error, Result, TransportError};
pub use network::{CanBus, Network, PeriodicTask, SubscriptionId, Transport};
pub use nmt::{NmtCommand, NmtMaster, NmtSlave, NmtState};
pub use node::LocalNode;
pub use object_dictionary::{Array, DictionaryAccess, ObjectDictionary, ObjectType, Record};
pub use pdo::{PdoDirection, PdoMap, PdoMaps};
pub use remote_node::RemoteNode;
pub use sdo_client::SdoClient;
pub use sdo_server::SdoServer;
pub use sync::SyncProducer;
pub use value::Value;
pub use variable::{AccessType, Variable};
