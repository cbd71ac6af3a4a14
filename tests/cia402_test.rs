#[macro_use]
extern crate lazy_static;
mod testing;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopen_engine::cia402::{Cia402Node, OperationMode, State402};
use canopen_engine::config::Cia402Config;
use canopen_engine::error::Error;
use canopen_engine::nmt::NmtCommand;
use canopen_engine::node::LocalNode;
use canopen_engine::object_dictionary::ObjectDictionary;
use canopen_engine::remote_node::RemoteNode;
use canopen_engine::sync::SyncProducer;
use testing::util::{self as tu, VirtualBus};

lazy_static! {
    static ref DRIVE_OD: Arc<ObjectDictionary> = Arc::new(tu::drive_dictionary(false));
    static ref DRIVE_PDO_OD: Arc<ObjectDictionary> = Arc::new(tu::drive_dictionary(true));
}

const SW_SWITCH_ON_DISABLED: u16 = 0x0250;
const SW_READY_TO_SWITCH_ON: u16 = 0x0221;
const SW_SWITCHED_ON: u16 = 0x0233;
const SW_OPERATION_ENABLED: u16 = 0x0237;
const SW_QUICK_STOP_ACTIVE: u16 = 0x0217;
const SW_FAULT: u16 = 0x0218;
const SW_HOMED: u16 = 0x1637;

fn statusword_of(state: State402) -> u16 {
    match state {
        State402::SwitchOnDisabled => SW_SWITCH_ON_DISABLED,
        State402::ReadyToSwitchOn => SW_READY_TO_SWITCH_ON,
        State402::SwitchedOn => SW_SWITCHED_ON,
        State402::OperationEnabled => SW_OPERATION_ENABLED,
        State402::QuickStopActive => SW_QUICK_STOP_ACTIVE,
        _ => SW_FAULT,
    }
}

/// Device side of the power state machine.
fn next_state(state: State402, cw: u16) -> State402 {
    use State402::*;
    match state {
        Fault | FaultReactionActive => {
            if cw & 0x80 != 0 {
                SwitchOnDisabled
            } else {
                state
            }
        }
        _ if cw & 0x02 == 0 => SwitchOnDisabled,
        _ if cw & 0x06 == 0x02 => {
            if matches!(state, OperationEnabled | QuickStopActive) {
                QuickStopActive
            } else {
                SwitchOnDisabled
            }
        }
        QuickStopActive => {
            if cw & 0x0F == 0x0F {
                OperationEnabled
            } else {
                state
            }
        }
        _ => match cw & 0x0F {
            0x06 | 0x0E if matches!(state, SwitchOnDisabled | SwitchedOn | OperationEnabled) => ReadyToSwitchOn,
            0x07 if matches!(state, ReadyToSwitchOn | OperationEnabled) => SwitchedOn,
            0x0F if matches!(state, SwitchedOn | OperationEnabled) => OperationEnabled,
            _ => state,
        },
    }
}

fn read_u16(node: &LocalNode, index: u16) -> u16 {
    let raw = node.get_data(index, 0, false).unwrap();
    u16::from_le_bytes([raw[0], raw[1]])
}

fn set_statusword(node: &LocalNode, statusword: u16) {
    node.set_data(0x6041, 0, &statusword.to_le_bytes(), false).unwrap();
}

struct TestContext {
    bus: Arc<VirtualBus>,
    node: Arc<LocalNode>,
    controlwords: Arc<Mutex<Vec<u16>>>,
    drive: Cia402Node,
}

impl TestContext {
    fn new(od: &Arc<ObjectDictionary>, config: Cia402Config, simulate: bool) -> Self {
        tu::init_logger();
        let bus = VirtualBus::new();
        let node = LocalNode::new(tu::LOCAL_NODE_ID, od.clone(), bus.attach()).unwrap();
        let controlwords = Arc::new(Mutex::new(Vec::new()));
        let recorded = controlwords.clone();
        node.add_write_callback(move |node, var, data| {
            match var.index() {
                0x6040 => {
                    let cw = u16::from_le_bytes([data[0], data[1]]);
                    recorded.lock().unwrap().push(cw);
                    if !simulate {
                        return Ok(());
                    }
                    let state = next_state(State402::from_statusword(read_u16(node, 0x6041)), cw);
                    let homing = node.get_data(0x6061, 0, false)?[0] as i8 == OperationMode::Homing.code();
                    let sw = if state == State402::OperationEnabled && homing && cw & 0x10 != 0 {
                        SW_HOMED
                    } else {
                        statusword_of(state)
                    };
                    node.set_data(0x6041, 0, &sw.to_le_bytes(), false)
                }
                0x6060 if simulate => node.set_data(0x6061, 0, data, false),
                _ => Ok(()),
            }
        });
        node.boot().unwrap();
        let remote = Arc::new(RemoteNode::new(tu::LOCAL_NODE_ID, od.clone(), bus.attach()));
        TestContext { bus, node, controlwords, drive: Cia402Node::with_config(remote, config) }
    }

    fn simulated() -> Self {
        Self::new(&DRIVE_OD, Cia402Config::default(), true)
    }

    fn controlwords(&self) -> Vec<u16> {
        std::mem::take(&mut *self.controlwords.lock().unwrap())
    }
}

#[test]
fn test_enable_from_switch_on_disabled() {
    let context = TestContext::simulated();
    assert_eq!(context.drive.state().unwrap(), State402::SwitchOnDisabled);

    context.drive.set_state(State402::OperationEnabled).unwrap();
    assert_eq!(context.controlwords(), vec![0x0006, 0x0007, 0x000F]);
    assert_eq!(context.drive.state().unwrap(), State402::OperationEnabled);

    context.drive.set_state(State402::SwitchOnDisabled).unwrap();
    assert_eq!(context.controlwords(), vec![0x0000]);
}

#[test]
fn test_switched_on_to_enabled() {
    let context = TestContext::simulated();
    set_statusword(&context.node, SW_SWITCHED_ON);

    context.drive.set_state(State402::OperationEnabled).unwrap();
    assert_eq!(context.controlwords(), vec![0x000F]);
}

#[test]
fn test_quick_stop_to_ready() {
    let context = TestContext::simulated();
    set_statusword(&context.node, SW_QUICK_STOP_ACTIVE);

    context.drive.set_state(State402::ReadyToSwitchOn).unwrap();
    assert_eq!(context.controlwords(), vec![0x0000, 0x0006]);
    assert_eq!(context.drive.state().unwrap(), State402::ReadyToSwitchOn);
}

#[test]
fn test_quick_stop_from_enabled() {
    let context = TestContext::simulated();
    set_statusword(&context.node, SW_OPERATION_ENABLED);

    context.drive.set_state(State402::QuickStopActive).unwrap();
    assert_eq!(context.controlwords(), vec![0x0002]);
    context.drive.set_state(State402::OperationEnabled).unwrap();
    assert_eq!(context.controlwords(), vec![0x000F]);
}

#[test]
fn test_illegal_targets() {
    let context = TestContext::simulated();
    for target in [State402::Fault, State402::FaultReactionActive, State402::NotReadyToSwitchOn] {
        assert_eq!(context.drive.set_state(target), Err(Error::IllegalTarget(target)));
    }
    assert!(context.controlwords().is_empty());
}

#[test]
fn test_state_change_timeout() {
    let config = Cia402Config::default()
        .with_switch_state_single(Duration::from_millis(20))
        .with_switch_state_final(Duration::from_millis(60));
    let context = TestContext::new(&DRIVE_OD, config, false);

    let err = context.drive.set_state(State402::OperationEnabled).unwrap_err();
    assert_eq!(err, Error::StateChangeTimeout(State402::OperationEnabled));
    assert!(context.controlwords().iter().all(|&cw| cw == 0x0006));
}

#[test]
fn test_reset_from_fault() {
    let context = TestContext::simulated();
    set_statusword(&context.node, SW_FAULT);
    assert!(context.drive.is_faulted().unwrap());
    assert_eq!(context.drive.state().unwrap(), State402::Fault);

    context.drive.reset_from_fault().unwrap();
    assert!(!context.drive.is_faulted().unwrap());
    assert_eq!(context.controlwords(), vec![0x0000, 0x0080, 0x0006, 0x0007, 0x000F]);
    assert_eq!(context.drive.state().unwrap(), State402::OperationEnabled);
}

#[test]
fn test_operation_modes() {
    let context = TestContext::simulated();
    assert_eq!(context.drive.op_mode().unwrap(), OperationMode::ProfiledPosition);
    assert!(context.drive.is_op_mode_supported(OperationMode::ProfiledVelocity).unwrap());
    assert!(context.drive.is_op_mode_supported(OperationMode::NoMode).unwrap());

    context.drive.set_op_mode(OperationMode::ProfiledVelocity).unwrap();
    assert_eq!(context.drive.op_mode().unwrap(), OperationMode::ProfiledVelocity);

    let err = context.drive.set_op_mode(OperationMode::CyclicSynchronousTorque).unwrap_err();
    assert_eq!(err, Error::UnsupportedMode(OperationMode::CyclicSynchronousTorque));
}

#[test]
fn test_homing() {
    let context = TestContext::simulated();
    context.drive.homing(None, true).unwrap();
    assert_eq!(context.controlwords(), vec![0x0006, 0x0007, 0x000F, 0x001F]);
    assert_eq!(context.drive.op_mode().unwrap(), OperationMode::ProfiledPosition);

    assert!(context.drive.is_homed(true).unwrap());
    assert_eq!(context.drive.op_mode().unwrap(), OperationMode::ProfiledPosition);
}

#[test]
fn test_homing_timeout() {
    let config = Cia402Config::default().with_homing(Duration::from_millis(30));
    let context = TestContext::new(&DRIVE_OD, config, false);
    set_statusword(&context.node, SW_OPERATION_ENABLED);
    context.node.set_data(0x6061, 0, &[6], false).unwrap();

    assert_eq!(context.drive.homing(None, false), Err(Error::HomingTimeout));
    assert_eq!(context.controlwords(), vec![0x001F]);
}

#[test]
fn test_state_machine_over_pdo() {
    let config = Cia402Config::default()
        .with_switch_state_single(Duration::from_millis(500))
        .with_switch_state_final(Duration::from_secs(2));
    let context = TestContext::new(&DRIVE_PDO_OD, config, true);
    let remote = context.drive.node().clone();
    remote.read_pdo_configuration().unwrap();
    remote.nmt().send_command(NmtCommand::Start).unwrap();
    context.drive.setup(false).unwrap();

    let sync = SyncProducer::new(context.bus.attach());
    sync.start(Some(Duration::from_millis(5))).unwrap();
    let tpdo = remote.tpdo().get(1).unwrap().clone();
    assert!(tpdo.wait_for_reception(Duration::from_secs(1)).is_some());
    assert_eq!(context.drive.state().unwrap(), State402::SwitchOnDisabled);

    context.drive.set_state(State402::OperationEnabled).unwrap();
    sync.stop();
    assert_eq!(context.controlwords(), vec![0x0006, 0x0007, 0x000F]);
    assert_eq!(context.bus.frames_on(0x202).last(), Some(&vec![0x0F, 0x00]));
}

#[test]
fn test_event_driven_statusword_pdo() {
    let context = TestContext::new(&DRIVE_PDO_OD, Cia402Config::default(), false);
    let remote = context.drive.node().clone();
    remote.read_pdo_configuration().unwrap();
    let tpdo = remote.tpdo().get(1).unwrap().clone();
    tpdo.set_trans_type(0xFF);
    assert!(tpdo.enabled());
    assert!(!tpdo.is_periodic());

    // Nothing received yet, the Statusword comes over SDO.
    assert_eq!(context.drive.state().unwrap(), State402::SwitchOnDisabled);

    let s = tu::Probe::new(&context.bus, &[]);
    s.send(0x182, &[0x37, 0x02]);
    assert_eq!(context.drive.statusword().unwrap(), SW_OPERATION_ENABLED);
    assert_eq!(context.drive.state().unwrap(), State402::OperationEnabled);
    assert!(!context.drive.is_faulted().unwrap());
}

#[test]
fn test_homing_waits_for_fresh_statusword() {
    let config = Cia402Config::default().with_homing(Duration::from_millis(100));
    let context = TestContext::new(&DRIVE_PDO_OD, config, false);
    let remote = context.drive.node().clone();
    remote.read_pdo_configuration().unwrap();
    context.node.set_data(0x6061, 0, &[6], false).unwrap();

    // Attained bits left over from an earlier run, and no SYNC to refresh them.
    let s = tu::Probe::new(&context.bus, &[]);
    s.send(0x182, &SW_HOMED.to_le_bytes());
    assert_eq!(context.drive.state().unwrap(), State402::OperationEnabled);

    assert!(matches!(context.drive.homing(None, false), Err(Error::Pdo(_))));
}
