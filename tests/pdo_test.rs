#[macro_use]
extern crate lazy_static;
mod testing;

use std::sync::Arc;
use std::time::Duration;

use canopen_engine::nmt::{NmtCommand, NmtState};
use canopen_engine::node::LocalNode;
use canopen_engine::object_dictionary::{DictionaryAccess, ObjectDictionary};
use canopen_engine::remote_node::RemoteNode;
use canopen_engine::sync::SyncProducer;
use canopen_engine::value::Value;
use testing::util::{self as tu, VirtualBus};

lazy_static! {
    static ref DEMO_OD: Arc<ObjectDictionary> = Arc::new(tu::demo_dictionary());
}

fn setup() -> (Arc<VirtualBus>, Arc<LocalNode>, RemoteNode) {
    tu::init_logger();
    let bus = VirtualBus::new();
    let node = LocalNode::new(tu::LOCAL_NODE_ID, DEMO_OD.clone(), bus.attach()).unwrap();
    node.boot().unwrap();
    let remote = RemoteNode::new(tu::LOCAL_NODE_ID, DEMO_OD.clone(), bus.attach());
    (bus, node, remote)
}

#[test]
fn test_read_pdo_configuration() {
    let (_bus, _node, remote) = setup();
    remote.read_pdo_configuration().unwrap();

    let rpdo = remote.rpdo().get(1).unwrap();
    assert_eq!(rpdo.cob_id(), 0x202);
    assert!(rpdo.enabled());
    assert_eq!(rpdo.trans_type(), Some(0xFF));
    assert_eq!(rpdo.length(), 24);
    assert!(!rpdo.is_periodic());

    let tpdo = remote.tpdo().get(1).unwrap();
    assert_eq!(tpdo.cob_id(), 0x182);
    assert_eq!(tpdo.trans_type(), Some(1));
    assert!(tpdo.contains(0x2002, 0));
    assert!(tpdo.is_periodic());
    assert_eq!(remote.tpdo().containing(0x2002, 0).len(), 1);
}

#[test]
fn test_rpdo_only_in_operational() {
    let (_bus, node, remote) = setup();
    remote.read_pdo_configuration().unwrap();
    let rpdo = remote.rpdo().get(1).unwrap();
    rpdo.set_value(0x2001, 0, Value::Integer(-2)).unwrap();
    rpdo.set_value_by_name("Mode flags", Value::Unsigned(7)).unwrap();
    assert_eq!(rpdo.data(), vec![0xFE, 0xFF, 0x07]);

    rpdo.transmit().unwrap();
    assert_eq!(node.read_value(0x2001, 0).unwrap(), Value::Integer(0));

    remote.nmt().send_command(NmtCommand::Start).unwrap();
    assert_eq!(node.nmt().state(), NmtState::Operational);
    rpdo.transmit().unwrap();
    assert_eq!(node.read_value(0x2001, 0).unwrap(), Value::Integer(-2));
    assert_eq!(node.read_value(0x2003, 0).unwrap(), Value::Unsigned(7));
}

#[test]
fn test_tpdo_on_sync() {
    let (bus, _node, remote) = setup();
    remote.read_pdo_configuration().unwrap();
    let tpdo = remote.tpdo().get(1).unwrap().clone();
    let sync = SyncProducer::new(bus.attach());

    sync.transmit(None).unwrap();
    assert!(bus.frames_on(0x182).is_empty());

    remote.nmt().send_command(NmtCommand::Start).unwrap();
    sync.transmit(None).unwrap();
    assert_eq!(bus.frames_on(0x182), vec![vec![0x78, 0x56, 0x34, 0x12]]);
    assert_eq!(tpdo.value(0x2002, 0).unwrap(), Value::Unsigned(0x1234_5678));
    assert_eq!(remote.tpdo().value(0x2002, 0), Some(Value::Unsigned(0x1234_5678)));

    sync.start(Some(Duration::from_millis(5))).unwrap();
    assert!(tpdo.wait_for_reception(Duration::from_secs(1)).is_some());
    sync.stop();
}

#[test]
fn test_save_event_driven_tpdo() {
    let (bus, node, remote) = setup();
    remote.read_pdo_configuration().unwrap();
    let tpdo = remote.tpdo().get(1).unwrap().clone();
    tpdo.set_trans_type(0xFE);
    tpdo.set_event_timer(10);
    remote.save_pdo_configuration().unwrap();

    let local = node.tpdo().get(1).unwrap();
    assert_eq!(local.trans_type(), Some(0xFE));
    assert_eq!(local.event_timer(), Some(10));
    assert!(local.enabled());
    assert_eq!(node.read_value(0x1A00, 1).unwrap(), Value::Unsigned(0x2002_0020));

    remote.nmt().send_command(NmtCommand::Start).unwrap();
    assert!(tpdo.wait_for_reception(Duration::from_secs(1)).is_some());
    assert_eq!(tpdo.value(0x2002, 0).unwrap(), Value::Unsigned(0x1234_5678));

    remote.nmt().send_command(NmtCommand::EnterPreOperational).unwrap();
    let sent = bus.frames_on(0x182).len();
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(bus.frames_on(0x182).len(), sent);
}

#[test]
fn test_rpdo_length_mismatch() {
    let (bus, node, remote) = setup();
    let probe = tu::Probe::new(&bus, &[]);
    remote.nmt().send_command(NmtCommand::Start).unwrap();

    probe.send(0x202, &[1, 2]);
    assert_eq!(bus.frames_on(0x82), vec![vec![0x10, 0x82, 0x01, 0x02, 0x02, 0, 0, 0]]);
    assert_eq!(node.read_value(0x2001, 0).unwrap(), Value::Integer(0));
    let active = remote.emcy().active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].code, 0x8210);
    assert_eq!(node.read_value(0x1003, 1).unwrap(), Value::Unsigned(0x0202_8210));
}
