use std::sync::Arc;

use crate::config::NodeConfig;
use crate::constant::{REG_RESTORE_DEFAULT_PARAMETERS, REG_STORE_PARAMETERS, RESET_MAGIC_CODE, STORE_MAGIC_CODE};
use crate::emergency::EmcyConsumer;
use crate::error::Result;
use crate::network::Network;
use crate::nmt::NmtMaster;
use crate::object_dictionary::{DictionaryAccess, ObjectDictionary};
use crate::pdo::{PdoDirection, PdoMaps};
use crate::sdo_client::SdoClient;
use crate::value::Value;
use crate::{info, warn};

/// A node on the bus, accessed over SDO, NMT, EMCY and PDO.
///
/// `tpdo` holds the PDOs the node transmits, `rpdo` the ones it receives.
pub struct RemoteNode {
    node_id: u8,
    od: Arc<ObjectDictionary>,
    network: Arc<Network>,
    config: NodeConfig,
    sdo: SdoClient,
    nmt: Arc<NmtMaster>,
    emcy: Arc<EmcyConsumer>,
    tpdo: PdoMaps,
    rpdo: PdoMaps,
}

impl RemoteNode {
    pub fn new(node_id: u8, od: Arc<ObjectDictionary>, network: Arc<Network>) -> Self {
        Self::with_config(node_id, od, network, NodeConfig::default())
    }

    pub fn with_config(node_id: u8, od: Arc<ObjectDictionary>, network: Arc<Network>, config: NodeConfig) -> Self {
        let sdo = SdoClient::with_config(node_id, od.clone(), network.clone(), config.sdo);
        let nmt = NmtMaster::with_config(node_id, network.clone(), config.nmt);
        let emcy = EmcyConsumer::new(node_id, network.clone());
        let tpdo = PdoMaps::new(PdoDirection::Tx, od.clone(), network.clone(), config.pdo_layout);
        let rpdo = PdoMaps::new(PdoDirection::Rx, od.clone(), network.clone(), config.pdo_layout);
        RemoteNode { node_id, od, network, config, sdo, nmt, emcy, tpdo, rpdo }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }
    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
    pub fn sdo(&self) -> &SdoClient {
        &self.sdo
    }
    pub fn nmt(&self) -> &Arc<NmtMaster> {
        &self.nmt
    }
    pub fn emcy(&self) -> &Arc<EmcyConsumer> {
        &self.emcy
    }
    pub fn tpdo(&self) -> &PdoMaps {
        &self.tpdo
    }
    pub fn rpdo(&self) -> &PdoMaps {
        &self.rpdo
    }

    /// Read the PDO configuration of the node over SDO.
    pub fn read_pdo_configuration(&self) -> Result<()> {
        self.tpdo.read(&self.sdo)?;
        self.rpdo.read(&self.sdo)
    }

    /// Write the local PDO configuration to the node over SDO.
    pub fn save_pdo_configuration(&self) -> Result<()> {
        self.tpdo.save(&self.sdo)?;
        self.rpdo.save(&self.sdo)
    }

    /// Write every writable entry that has a configured parameter value.
    ///
    /// Failures are logged and skipped. The PDO configuration is read back
    /// afterwards.
    pub fn load_configuration(&self) -> Result<()> {
        let node_id = Some(self.node_id);
        for obj in self.od.iter() {
            for var in obj.members() {
                if !var.is_writable() || var.parameter_value().is_none() {
                    continue;
                }
                let Some(value) = var.value_for_node(node_id) else { continue };
                info!("Configuring {:#06x}:{:02x} ({}) of node {} to {}", var.index(), var.sub_index(),
                    var.name(), self.node_id, value);
                if let Err(e) = self.sdo.write_value(var.index(), var.sub_index(), value) {
                    warn!("Failed to set {:#06x}:{:02x} of node {}: {}", var.index(), var.sub_index(), self.node_id, e);
                }
            }
        }
        self.read_pdo_configuration()
    }

    /// Make the node save its parameters to non-volatile memory.
    ///
    /// Subindex 1 saves all parameters.
    pub fn store(&self, sub_index: u8) -> Result<()> {
        self.sdo.write_value(REG_STORE_PARAMETERS, sub_index, Value::Unsigned(STORE_MAGIC_CODE as u64))
    }

    /// Make the node restore its default parameters on the next reset.
    pub fn restore(&self, sub_index: u8) -> Result<()> {
        self.sdo.write_value(REG_RESTORE_DEFAULT_PARAMETERS, sub_index, Value::Unsigned(RESET_MAGIC_CODE as u64))
    }
}

impl DictionaryAccess for RemoteNode {
    fn dictionary(&self) -> &ObjectDictionary {
        &self.od
    }

    fn read_raw(&self, index: u16, sub_index: u8) -> Result<Vec<u8>> {
        self.sdo.read_raw(index, sub_index)
    }

    fn write_raw(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<()> {
        self.sdo.write_raw(index, sub_index, data)
    }
}

impl core::fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RemoteNode")
            .field("node_id", &self.node_id)
            .field("nmt", &self.nmt.state())
            .finish()
    }
}
