#![allow(dead_code)]

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use canopen_engine::data_type::DataType;
use canopen_engine::error::TransportError;
use canopen_engine::network::{Network, Transport};
use canopen_engine::object_dictionary::{Array, ObjectDictionary, Record};
use canopen_engine::variable::{AccessType, Variable};
use crossbeam::channel::{self, Receiver};

pub const LOCAL_NODE_ID: u8 = 2;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
    pub cob_id: u32,
    pub data: Vec<u8>,
    pub remote: bool,
}

/// In-memory CAN bus. Every frame is delivered synchronously to all other
/// attached networks, never back to its sender.
#[derive(Default)]
pub struct VirtualBus {
    networks: Mutex<Vec<Weak<Network>>>,
    log: Mutex<Vec<BusFrame>>,
}

struct BusPort {
    bus: Arc<VirtualBus>,
    port: usize,
}

impl Transport for BusPort {
    fn send(&self, cob_id: u32, data: &[u8], is_remote: bool) -> Result<(), TransportError> {
        if data.len() > 8 {
            return Err(TransportError::PayloadTooLong(data.len()));
        }
        self.bus.log.lock().unwrap().push(BusFrame { cob_id, data: data.to_vec(), remote: is_remote });
        let peers: Vec<Arc<Network>> = {
            let networks = self.bus.networks.lock().unwrap();
            networks
                .iter()
                .enumerate()
                .filter(|(port, _)| *port != self.port)
                .filter_map(|(_, n)| n.upgrade())
                .collect()
        };
        let payload: &[u8] = if is_remote { &[] } else { data };
        let now = Instant::now();
        for peer in peers {
            peer.dispatch(cob_id, payload, now);
        }
        Ok(())
    }
}

impl VirtualBus {
    pub fn new() -> Arc<Self> {
        Arc::new(VirtualBus::default())
    }

    /// Attach a new network to the bus.
    pub fn attach(self: &Arc<Self>) -> Arc<Network> {
        let mut networks = self.networks.lock().unwrap();
        let network = Network::new(Arc::new(BusPort { bus: self.clone(), port: networks.len() }));
        networks.push(Arc::downgrade(&network));
        network
    }

    pub fn frames(&self) -> Vec<BusFrame> {
        self.log.lock().unwrap().clone()
    }

    pub fn frames_on(&self, cob_id: u32) -> Vec<Vec<u8>> {
        self.frames().into_iter().filter(|f| f.cob_id == cob_id).map(|f| f.data).collect()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

/// Raw access to the bus, like a socket on a virtual CAN interface.
pub struct Probe {
    network: Arc<Network>,
    received: Receiver<(u32, Vec<u8>)>,
}

impl Probe {
    pub fn new(bus: &Arc<VirtualBus>, cob_ids: &[u32]) -> Self {
        let network = bus.attach();
        let (tx, received) = channel::unbounded();
        for &cob_id in cob_ids {
            let tx = tx.clone();
            network.subscribe(cob_id, move |cob_id, data, _| {
                let _ = tx.send((cob_id, data.to_vec()));
            });
        }
        Probe { network, received }
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn send(&self, cob_id: u32, data: &[u8]) {
        self.network.send_message(cob_id, data).expect("Failed to send request frame");
    }

    /// Wait for the expected frame, skipping others.
    pub fn exp(&self, cob_id: u32, data: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.received.recv_timeout(left) {
                Ok((id, frame)) if id == cob_id && frame == data => return,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        panic!("Timeout in getting response {:#x} {:02x?}", cob_id, data);
    }

    pub fn drain(&self) -> Vec<(u32, Vec<u8>)> {
        self.received.try_iter().collect()
    }
}

fn record(name: &str, index: u16, members: Vec<Variable>) -> Record {
    members.into_iter().fold(Record::new(name, index), |r, v| r.with_member(v))
}

fn var(name: &str, sub: u8, data_type: DataType) -> Variable {
    Variable::new(name, 0, sub, data_type)
}

/// Communication profile objects shared by all fixtures.
fn communication_objects(od: &mut ObjectDictionary) {
    od.add_object(
        Variable::new("Device type", 0x1000, 0, DataType::Unsigned32)
            .with_access(AccessType::ReadOnly)
            .with_default(0x000F_0191u32),
    )
    .unwrap();
    od.add_object(
        Variable::new("Error register", 0x1001, 0, DataType::Unsigned8)
            .with_access(AccessType::ReadOnly)
            .with_default(0u8),
    )
    .unwrap();
    od.add_object(
        Array::new("Pre-defined error field", 0x1003)
            .with_member(var("Number of errors", 0, DataType::Unsigned8).with_default(0u8))
            .with_member(var("Standard error field", 1, DataType::Unsigned32).with_access(AccessType::ReadOnly))
            .with_member(var("Standard error field", 2, DataType::Unsigned32).with_access(AccessType::ReadOnly)),
    )
    .unwrap();
    od.add_object(
        Variable::new("Manufacturer device name", 0x1008, 0, DataType::VisibleString)
            .with_access(AccessType::Const)
            .with_default("canopen engine demo device"),
    )
    .unwrap();
    od.add_object(
        Array::new("Store parameters", 0x1010)
            .with_member(var("Highest sub-index supported", 0, DataType::Unsigned8)
                .with_access(AccessType::ReadOnly).with_default(1u8))
            .with_member(var("Save all parameters", 1, DataType::Unsigned32).with_default(1u32)),
    )
    .unwrap();
    od.add_object(
        Array::new("Restore default parameters", 0x1011)
            .with_member(var("Highest sub-index supported", 0, DataType::Unsigned8)
                .with_access(AccessType::ReadOnly).with_default(1u8))
            .with_member(var("Restore all default parameters", 1, DataType::Unsigned32).with_default(1u32)),
    )
    .unwrap();
    od.add_object(Variable::new("Producer heartbeat time", 0x1017, 0, DataType::Unsigned16).with_default(0u16))
        .unwrap();
    od.add_object(
        Record::new("Identity object", 0x1018)
            .with_member(var("Number of entries", 0, DataType::Unsigned8).with_access(AccessType::Const).with_default(1u8))
            .with_member(var("Vendor-ID", 1, DataType::Unsigned32).with_access(AccessType::ReadOnly).with_default(0x0000_0360u32)),
    )
    .unwrap();
}

/// PDO communication record. Transmission type and event timer are
/// writable, sub 1 holds the node-relative COB-ID.
fn pdo_communication(name: &str, index: u16, cob_base: u32, trans_type: u8, event_timer: u16) -> Record {
    record(
        name,
        index,
        vec![
            var("Highest sub-index supported", 0, DataType::Unsigned8).with_access(AccessType::Const).with_default(5u8),
            var("COB-ID used by PDO", 1, DataType::Unsigned32).with_default(cob_base).with_relative(true),
            var("Transmission type", 2, DataType::Unsigned8).with_default(trans_type),
            var("Inhibit time", 3, DataType::Unsigned16).with_default(0u16),
            var("Event timer", 5, DataType::Unsigned16).with_default(event_timer),
        ],
    )
}

fn pdo_mapping(name: &str, index: u16, entries: &[u32]) -> Record {
    let mut members = vec![var("Number of mapped objects", 0, DataType::Unsigned8).with_default(entries.len() as u8)];
    for sub in 1..=4u8 {
        let value = entries.get(sub as usize - 1).copied().unwrap_or(0);
        members.push(var(&format!("Mapped object {}", sub), sub, DataType::Unsigned32).with_default(value));
    }
    record(name, index, members)
}

/// Generic device: communication objects, one RPDO, one TPDO and a few
/// manufacturer specific entries.
pub fn demo_dictionary() -> ObjectDictionary {
    let mut od = ObjectDictionary::new().with_node_id(LOCAL_NODE_ID);
    communication_objects(&mut od);
    od.add_object(pdo_communication("RPDO1 communication parameter", 0x1400, 0x200, 0xFF, 0)).unwrap();
    od.add_object(pdo_mapping("RPDO1 mapping parameter", 0x1600, &[0x2001_0010, 0x2003_0008])).unwrap();
    od.add_object(pdo_communication("TPDO1 communication parameter", 0x1800, 0x180, 1, 0)).unwrap();
    od.add_object(pdo_mapping("TPDO1 mapping parameter", 0x1A00, &[0x2002_0020])).unwrap();
    od.add_object(Variable::new("Firmware blob", 0x2000, 0, DataType::Domain)).unwrap();
    od.add_object(
        Variable::new("Setpoint", 0x2001, 0, DataType::Integer16).with_default(0i16).with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Counter", 0x2002, 0, DataType::Unsigned32)
            .with_access(AccessType::ReadOnly)
            .with_default(0x1234_5678u32)
            .with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Mode flags", 0x2003, 0, DataType::Unsigned8)
            .with_default(0u8)
            .with_pdo_mappable(true)
            .with_parameter_value(0x5Au8),
    )
    .unwrap();
    od.add_object(
        Variable::new("Gain", 0x2004, 0, DataType::Real32).with_default(1.5f32).with_parameter_value(2.5f32),
    )
    .unwrap();
    od
}

/// CiA-402 drive. With `pdos` the Controlword and Modes of operation travel
/// in an asynchronous RPDO and the Statusword in a synchronous TPDO.
pub fn drive_dictionary(pdos: bool) -> ObjectDictionary {
    let mut od = ObjectDictionary::new().with_node_id(LOCAL_NODE_ID);
    communication_objects(&mut od);
    if pdos {
        od.add_object(pdo_communication("RPDO1 communication parameter", 0x1400, 0x200, 0xFF, 0)).unwrap();
        od.add_object(pdo_mapping("RPDO1 mapping parameter", 0x1600, &[0x6040_0010])).unwrap();
        od.add_object(pdo_communication("TPDO1 communication parameter", 0x1800, 0x180, 1, 0)).unwrap();
        od.add_object(pdo_mapping("TPDO1 mapping parameter", 0x1A00, &[0x6041_0010])).unwrap();
    }
    od.add_object(
        Variable::new("Controlword", 0x6040, 0, DataType::Unsigned16).with_default(0u16).with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Statusword", 0x6041, 0, DataType::Unsigned16)
            .with_access(AccessType::ReadOnly)
            .with_default(0x0250u16)
            .with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Modes of operation", 0x6060, 0, DataType::Integer8).with_default(1i8).with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Modes of operation display", 0x6061, 0, DataType::Integer8)
            .with_access(AccessType::ReadOnly)
            .with_default(1i8)
            .with_pdo_mappable(true),
    )
    .unwrap();
    od.add_object(
        Variable::new("Supported drive modes", 0x6502, 0, DataType::Unsigned32)
            .with_access(AccessType::ReadOnly)
            .with_default(0x0000_0025u32),
    )
    .unwrap();
    od
}
