//! CiA-402 drive profile state machine on top of a [`RemoteNode`].
//!
//! The Statusword (0x6041) and Controlword (0x6040) are exchanged over PDO
//! when mapped and over SDO otherwise.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Cia402Config;
use crate::error::{Error, Result};
use crate::object_dictionary::DictionaryAccess;
use crate::pdo::PdoMap;
use crate::remote_node::RemoteNode;
use crate::value::Value;
use crate::{debug, info, warn};

pub const CONTROLWORD: u16 = 0x6040;
pub const STATUSWORD: u16 = 0x6041;
pub const MODES_OF_OPERATION: u16 = 0x6060;
pub const MODES_OF_OPERATION_DISPLAY: u16 = 0x6061;
pub const SUPPORTED_DRIVE_MODES: u16 = 0x6502;

pub const CW_DISABLE_VOLTAGE: u16 = 0x0000;
pub const CW_QUICK_STOP: u16 = 0x0002;
pub const CW_SHUTDOWN: u16 = 0x0006;
pub const CW_SWITCH_ON: u16 = 0x0007;
pub const CW_OPERATION_ENABLED: u16 = 0x000F;
pub const CW_SWITCH_ON_DISABLED: u16 = 0x0080;
pub const CW_HOMING_START: u16 = 0x0010;

const SW_MASK_HOMING: u16 = 0x3400;
const SW_FAULT: u16 = 0x0008;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State402 {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    Fault,
    FaultReactionActive,
    QuickStopActive,
    Unknown,
}

/// (state, mask, value) matched against the Statusword in order.
const SW_MASK: [(State402, u16, u16); 8] = [
    (State402::NotReadyToSwitchOn, 0x4F, 0x00),
    (State402::SwitchOnDisabled, 0x4F, 0x40),
    (State402::ReadyToSwitchOn, 0x6F, 0x21),
    (State402::SwitchedOn, 0x6F, 0x23),
    (State402::OperationEnabled, 0x6F, 0x27),
    (State402::Fault, 0x4F, 0x08),
    (State402::FaultReactionActive, 0x4F, 0x0F),
    (State402::QuickStopActive, 0x6F, 0x07),
];

impl State402 {
    pub fn from_statusword(statusword: u16) -> Self {
        SW_MASK
            .iter()
            .find(|(_, mask, value)| statusword & mask == *value)
            .map_or(State402::Unknown, |(state, _, _)| *state)
    }

    /// Controlword of the direct transition from `self` to `to`, if any.
    pub fn transition(&self, to: State402) -> Option<u16> {
        use State402::*;
        let command = match (*self, to) {
            (ReadyToSwitchOn, SwitchOnDisabled)
            | (OperationEnabled, SwitchOnDisabled)
            | (SwitchedOn, SwitchOnDisabled)
            | (QuickStopActive, SwitchOnDisabled) => CW_DISABLE_VOLTAGE,
            (NotReadyToSwitchOn, SwitchOnDisabled) | (FaultReactionActive, Fault) => 0x0000,
            (SwitchOnDisabled, ReadyToSwitchOn) | (SwitchedOn, ReadyToSwitchOn) | (OperationEnabled, ReadyToSwitchOn) => {
                CW_SHUTDOWN
            }
            (ReadyToSwitchOn, SwitchedOn) | (OperationEnabled, SwitchedOn) => CW_SWITCH_ON,
            (SwitchedOn, OperationEnabled) | (QuickStopActive, OperationEnabled) => CW_OPERATION_ENABLED,
            (ReadyToSwitchOn, QuickStopActive) | (SwitchedOn, QuickStopActive) | (OperationEnabled, QuickStopActive) => {
                CW_QUICK_STOP
            }
            (Fault, SwitchOnDisabled) => CW_SWITCH_ON_DISABLED,
            _ => return None,
        };
        Some(command)
    }

    /// Next hop on the way toward OPERATION ENABLED.
    pub fn next_state_for_enabling(&self) -> State402 {
        use State402::*;
        match self {
            Unknown => NotReadyToSwitchOn,
            Fault | NotReadyToSwitchOn | QuickStopActive => SwitchOnDisabled,
            SwitchOnDisabled => ReadyToSwitchOn,
            ReadyToSwitchOn => SwitchedOn,
            SwitchedOn | OperationEnabled => OperationEnabled,
            FaultReactionActive => Fault,
        }
    }

    /// States the drive enters on its own and cannot be commanded into.
    pub fn is_illegal_target(&self) -> bool {
        matches!(
            self,
            State402::NotReadyToSwitchOn | State402::Fault | State402::FaultReactionActive | State402::Unknown
        )
    }
}

impl fmt::Display for State402 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State402::NotReadyToSwitchOn => "NOT READY TO SWITCH ON",
            State402::SwitchOnDisabled => "SWITCH ON DISABLED",
            State402::ReadyToSwitchOn => "READY TO SWITCH ON",
            State402::SwitchedOn => "SWITCHED ON",
            State402::OperationEnabled => "OPERATION ENABLED",
            State402::Fault => "FAULT",
            State402::FaultReactionActive => "FAULT REACTION ACTIVE",
            State402::QuickStopActive => "QUICK STOP ACTIVE",
            State402::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    NoMode,
    ProfiledPosition,
    Velocity,
    ProfiledVelocity,
    ProfiledTorque,
    Homing,
    InterpolatedPosition,
    CyclicSynchronousPosition,
    CyclicSynchronousVelocity,
    CyclicSynchronousTorque,
    OpenLoopScalarMode,
    OpenLoopVectorMode,
}

impl OperationMode {
    pub fn code(&self) -> i8 {
        match self {
            OperationMode::NoMode => 0,
            OperationMode::ProfiledPosition => 1,
            OperationMode::Velocity => 2,
            OperationMode::ProfiledVelocity => 3,
            OperationMode::ProfiledTorque => 4,
            OperationMode::Homing => 6,
            OperationMode::InterpolatedPosition => 7,
            OperationMode::CyclicSynchronousPosition => 8,
            OperationMode::CyclicSynchronousVelocity => 9,
            OperationMode::CyclicSynchronousTorque => 10,
            OperationMode::OpenLoopScalarMode => -1,
            OperationMode::OpenLoopVectorMode => -2,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        let mode = match code {
            0 => OperationMode::NoMode,
            1 => OperationMode::ProfiledPosition,
            2 => OperationMode::Velocity,
            3 => OperationMode::ProfiledVelocity,
            4 => OperationMode::ProfiledTorque,
            6 => OperationMode::Homing,
            7 => OperationMode::InterpolatedPosition,
            8 => OperationMode::CyclicSynchronousPosition,
            9 => OperationMode::CyclicSynchronousVelocity,
            10 => OperationMode::CyclicSynchronousTorque,
            -1 => OperationMode::OpenLoopScalarMode,
            -2 => OperationMode::OpenLoopVectorMode,
            _ => return None,
        };
        Some(mode)
    }

    /// Bit of the mode in the supported drive modes object (0x6502).
    pub fn supported_bit(&self) -> u32 {
        match self {
            OperationMode::NoMode => 0,
            OperationMode::ProfiledPosition => 0x1,
            OperationMode::Velocity => 0x2,
            OperationMode::ProfiledVelocity => 0x4,
            OperationMode::ProfiledTorque => 0x8,
            OperationMode::Homing => 0x20,
            OperationMode::InterpolatedPosition => 0x40,
            OperationMode::CyclicSynchronousPosition => 0x80,
            OperationMode::CyclicSynchronousVelocity => 0x100,
            OperationMode::CyclicSynchronousTorque => 0x200,
            OperationMode::OpenLoopScalarMode => 0x1_0000,
            OperationMode::OpenLoopVectorMode => 0x2_0000,
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationMode::NoMode => "NO MODE",
            OperationMode::ProfiledPosition => "PROFILED POSITION",
            OperationMode::Velocity => "VELOCITY",
            OperationMode::ProfiledVelocity => "PROFILED VELOCITY",
            OperationMode::ProfiledTorque => "PROFILED TORQUE",
            OperationMode::Homing => "HOMING",
            OperationMode::InterpolatedPosition => "INTERPOLATED POSITION",
            OperationMode::CyclicSynchronousPosition => "CYCLIC SYNCHRONOUS POSITION",
            OperationMode::CyclicSynchronousVelocity => "CYCLIC SYNCHRONOUS VELOCITY",
            OperationMode::CyclicSynchronousTorque => "CYCLIC SYNCHRONOUS TORQUE",
            OperationMode::OpenLoopScalarMode => "OPEN LOOP SCALAR MODE",
            OperationMode::OpenLoopVectorMode => "OPEN LOOP VECTOR MODE",
        };
        f.write_str(name)
    }
}

/// Homing progress decoded from Statusword bits 13, 12 and 10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HomingStatus {
    InProgress,
    Interrupted,
    Attained,
    TargetReached,
    ErrorVelocityIsNotZero,
    ErrorVelocityIsZero,
    Unknown,
}

impl HomingStatus {
    pub fn from_statusword(statusword: u16) -> Self {
        match statusword & SW_MASK_HOMING {
            0x0000 => HomingStatus::InProgress,
            0x0400 => HomingStatus::Interrupted,
            0x1000 => HomingStatus::Attained,
            0x1400 => HomingStatus::TargetReached,
            0x2000 => HomingStatus::ErrorVelocityIsNotZero,
            0x2400 => HomingStatus::ErrorVelocityIsZero,
            _ => HomingStatus::Unknown,
        }
    }

    pub fn is_homed(&self) -> bool {
        matches!(self, HomingStatus::Attained | HomingStatus::TargetReached)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HomingStatus::Interrupted | HomingStatus::ErrorVelocityIsNotZero | HomingStatus::ErrorVelocityIsZero
        )
    }
}

impl fmt::Display for HomingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HomingStatus::InProgress => "IN PROGRESS",
            HomingStatus::Interrupted => "INTERRUPTED",
            HomingStatus::Attained => "ATTAINED",
            HomingStatus::TargetReached => "TARGET REACHED",
            HomingStatus::ErrorVelocityIsNotZero => "ERROR VELOCITY IS NOT ZERO",
            HomingStatus::ErrorVelocityIsZero => "ERROR VELOCITY IS ZERO",
            HomingStatus::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A CiA-402 drive.
pub struct Cia402Node {
    node: Arc<RemoteNode>,
    config: Cia402Config,
    supported_modes: OnceLock<u32>,
}

impl Cia402Node {
    pub fn new(node: Arc<RemoteNode>) -> Self {
        Self::with_config(node, Cia402Config::default())
    }

    pub fn with_config(node: Arc<RemoteNode>, config: Cia402Config) -> Self {
        Cia402Node { node, config, supported_modes: OnceLock::new() }
    }

    pub fn node(&self) -> &Arc<RemoteNode> {
        &self.node
    }

    pub fn config(&self) -> &Cia402Config {
        &self.config
    }

    /// Optionally read the PDO configuration and report what is not mapped.
    pub fn setup(&self, read_pdos: bool) -> Result<()> {
        if read_pdos {
            self.node.read_pdo_configuration()?;
        }
        if self.rpdo_for(CONTROLWORD).is_none() {
            warn!("Controlword of node {} is not mapped to an RPDO, using SDO", self.node.node_id());
        }
        if self.tpdo_for(STATUSWORD).is_none() {
            warn!("Statusword of node {} is not mapped to a TPDO, using SDO", self.node.node_id());
        }
        Ok(())
    }

    fn tpdo_for(&self, index: u16) -> Option<Arc<PdoMap>> {
        self.node.tpdo().containing(index, 0).into_iter().find(|m| m.enabled())
    }

    fn rpdo_for(&self, index: u16) -> Option<Arc<PdoMap>> {
        self.node.rpdo().containing(index, 0).into_iter().find(|m| m.enabled())
    }

    fn read_u64(&self, index: u16) -> Result<u64> {
        let value = self.node.sdo().read_value(index, 0)?;
        value.as_u64().ok_or_else(|| Error::InvalidValue(format!("{} is not an unsigned integer", value)))
    }

    fn read_i64(&self, index: u16) -> Result<i64> {
        let value = self.node.sdo().read_value(index, 0)?;
        value.as_i64().ok_or_else(|| Error::InvalidValue(format!("{} is not an integer", value)))
    }

    /// Last known Statusword: the TPDO value when mapped and received,
    /// else an SDO read.
    pub fn statusword(&self) -> Result<u16> {
        if let Some(map) = self.tpdo_for(STATUSWORD).filter(|m| m.timestamp().is_some()) {
            if let Some(v) = map.value(STATUSWORD, 0)?.as_u64() {
                return Ok(v as u16);
            }
        }
        debug!("Reading Statusword of node {} over SDO", self.node.node_id());
        Ok(self.read_u64(STATUSWORD)? as u16)
    }

    /// Wait for a fresh Statusword when it arrives on a periodic TPDO.
    pub fn check_statusword(&self) -> Result<u16> {
        if let Some(map) = self.tpdo_for(STATUSWORD).filter(|m| m.is_periodic()) {
            if map.wait_for_reception(self.config.check_tpdo).is_none() {
                return Err(Error::Pdo(format!("timeout waiting for the Statusword of node {}", self.node.node_id())));
            }
            if let Some(v) = map.value(STATUSWORD, 0)?.as_u64() {
                return Ok(v as u16);
            }
        }
        Ok(self.read_u64(STATUSWORD)? as u16)
    }

    /// Write the Controlword through its RPDO, else over SDO.
    pub fn set_controlword(&self, value: u16) -> Result<()> {
        debug!("Controlword of node {} = {:#06x}", self.node.node_id(), value);
        match self.rpdo_for(CONTROLWORD) {
            Some(map) => {
                map.set_value(CONTROLWORD, 0, Value::Unsigned(value as u64))?;
                if !map.is_periodic() {
                    map.transmit()?;
                }
                Ok(())
            }
            None => self.node.sdo().write_value(CONTROLWORD, 0, Value::Unsigned(value as u64)),
        }
    }

    pub fn state(&self) -> Result<State402> {
        Ok(State402::from_statusword(self.statusword()?))
    }

    pub fn is_faulted(&self) -> Result<bool> {
        Ok(self.statusword()? & SW_FAULT == SW_FAULT)
    }

    fn next_state(&self, current: State402, target: State402) -> Result<State402> {
        if target.is_illegal_target() {
            return Err(Error::IllegalTarget(target));
        }
        if current.transition(target).is_some() {
            Ok(target)
        } else {
            Ok(current.next_state_for_enabling())
        }
    }

    /// Drive the state machine to `target`, one transition at a time.
    pub fn set_state(&self, target: State402) -> Result<()> {
        if target.is_illegal_target() {
            return Err(Error::IllegalTarget(target));
        }
        let deadline = Instant::now() + self.config.switch_state_final;
        let mut current = self.state()?;
        while current != target {
            let next = self.next_state(current, target)?;
            if self.change_state(current, next)? {
                current = next;
                continue;
            }
            if Instant::now() > deadline {
                return Err(Error::StateChangeTimeout(target));
            }
            current = State402::from_statusword(self.check_statusword()?);
        }
        info!("Node {} is in state {}", self.node.node_id(), target);
        Ok(())
    }

    /// Single transition. `Ok(false)` when the drive did not follow in time.
    fn change_state(&self, current: State402, next: State402) -> Result<bool> {
        let Some(command) = current.transition(next) else {
            // Automatic transitions of the drive itself.
            debug!("Waiting for node {} to leave {}", self.node.node_id(), current);
            thread::sleep(self.config.poll_interval);
            return Ok(false);
        };
        self.set_controlword(command)?;
        let deadline = Instant::now() + self.config.switch_state_single;
        loop {
            if self.state()? == next {
                return Ok(true);
            }
            if Instant::now() > deadline {
                return Ok(false);
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Clear a fault with a rising edge on the fault reset bit, then
    /// re-enable operation.
    pub fn reset_from_fault(&self) -> Result<()> {
        if self.state()? != State402::Fault {
            return Ok(());
        }
        self.set_controlword(CW_DISABLE_VOLTAGE)?;
        self.set_controlword(CW_SWITCH_ON_DISABLED)?;
        let deadline = Instant::now() + self.config.reset_fault;
        while self.is_faulted()? {
            if Instant::now() > deadline {
                return Err(Error::StateChangeTimeout(State402::SwitchOnDisabled));
            }
            thread::sleep(self.config.poll_interval);
        }
        self.set_state(State402::OperationEnabled)
    }

    /// Supported drive modes, read once from 0x6502.
    pub fn supported_modes(&self) -> Result<u32> {
        if let Some(bits) = self.supported_modes.get() {
            return Ok(*bits);
        }
        let bits = self.read_u64(SUPPORTED_DRIVE_MODES)? as u32;
        Ok(*self.supported_modes.get_or_init(|| bits))
    }

    pub fn is_op_mode_supported(&self, mode: OperationMode) -> Result<bool> {
        let bit = mode.supported_bit();
        Ok(self.supported_modes()? & bit == bit)
    }

    /// Current mode from the modes of operation display.
    pub fn op_mode(&self) -> Result<OperationMode> {
        let code = match self.tpdo_for(MODES_OF_OPERATION_DISPLAY).filter(|m| m.is_periodic()) {
            Some(map) => {
                if map.wait_for_reception(self.config.check_tpdo).is_none() {
                    return Err(Error::Pdo(format!(
                        "timeout getting the mode of operation of node {}",
                        self.node.node_id()
                    )));
                }
                map.value(MODES_OF_OPERATION_DISPLAY, 0)?.as_i64().unwrap_or(0)
            }
            None => self.read_i64(MODES_OF_OPERATION_DISPLAY)?,
        };
        OperationMode::from_code(code as i8)
            .ok_or_else(|| Error::InvalidValue(format!("unknown mode of operation {}", code)))
    }

    pub fn set_op_mode(&self, mode: OperationMode) -> Result<()> {
        if !self.is_op_mode_supported(mode)? {
            return Err(Error::UnsupportedMode(mode));
        }
        let code = Value::Integer(mode.code() as i64);
        match self.rpdo_for(MODES_OF_OPERATION) {
            Some(map) => {
                map.set_value(MODES_OF_OPERATION, 0, code)?;
                if !map.is_periodic() {
                    map.transmit()?;
                }
            }
            None => self.node.sdo().write_value(MODES_OF_OPERATION, 0, code)?,
        }
        let deadline = Instant::now() + self.config.switch_op_mode;
        while self.op_mode()? != mode {
            if Instant::now() > deadline {
                return Err(Error::OperationModeTimeout(mode));
            }
            thread::sleep(self.config.poll_interval);
        }
        info!("Set node {} operation mode to {}", self.node.node_id(), mode);
        Ok(())
    }

    fn homing_status(&self) -> Result<HomingStatus> {
        Ok(HomingStatus::from_statusword(self.statusword()?))
    }

    /// Run the homing procedure and wait for its outcome.
    ///
    /// With `restore_op_mode` the previous mode is set again afterwards,
    /// whatever the outcome.
    pub fn homing(&self, timeout: Option<Duration>, restore_op_mode: bool) -> Result<()> {
        let previous = if restore_op_mode { Some(self.op_mode()?) } else { None };
        let result = self.run_homing(timeout.unwrap_or(self.config.homing));
        if let Some(mode) = previous {
            self.set_op_mode(mode)?;
        }
        result
    }

    fn run_homing(&self, timeout: Duration) -> Result<()> {
        self.set_state(State402::OperationEnabled)?;
        self.set_op_mode(OperationMode::Homing)?;
        self.set_controlword(CW_OPERATION_ENABLED | CW_HOMING_START)?;
        self.check_statusword()?;
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.homing_status()?;
            if status.is_homed() {
                info!("Node {} homed ({})", self.node.node_id(), status);
                return Ok(());
            }
            if status.is_failure() {
                return Err(Error::HomingFailed(status));
            }
            if Instant::now() > deadline {
                return Err(Error::HomingTimeout);
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Whether the drive reports a completed homing. Switches to HOMING
    /// mode to read it.
    pub fn is_homed(&self, restore_op_mode: bool) -> Result<bool> {
        let previous = self.op_mode()?;
        if previous != OperationMode::Homing {
            info!("Switching node {} to HOMING from {}", self.node.node_id(), previous);
            self.set_op_mode(OperationMode::Homing)?;
        }
        let homed = self.homing_status()?.is_homed();
        if restore_op_mode && previous != OperationMode::Homing {
            self.set_op_mode(previous)?;
        }
        Ok(homed)
    }
}
