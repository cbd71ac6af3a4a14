use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::constant::{COB_FUNC_EMCY, REG_ERROR, REG_PRE_DEFINED_ERROR};
use crate::error::Result;
use crate::network::{Network, SubscriptionId};
use crate::object_dictionary::DictionaryAccess;
use crate::prelude::*;
use crate::value::Value;
use crate::{debug, info, warn};

/// Error code classes, matched as (code, mask).
const ERROR_CLASSES: [(u16, u16, &str); 12] = [
    (0x0000, 0xFF00, "Error Reset / No Error"),
    (0x1000, 0xFF00, "Generic Error"),
    (0x2000, 0xF000, "Current"),
    (0x3000, 0xF000, "Voltage"),
    (0x4000, 0xF000, "Temperature"),
    (0x5000, 0xFF00, "Device Hardware"),
    (0x6000, 0xF000, "Device Software"),
    (0x7000, 0xFF00, "Additional Modules"),
    (0x8000, 0xF000, "Monitoring"),
    (0x9000, 0xFF00, "External Error"),
    (0xF000, 0xFF00, "Additional Functions"),
    (0xFF00, 0xFF00, "Device Specific"),
];

/// Bits of the error register (0x1001).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorRegister {
    GenericError,
    Current,
    Voltage,
    Temperature,
    CommunicationError,
    DeviceProfileSpecific,
    Reserved,
    ManufacturerSpecific,
}

impl ErrorRegister {
    pub fn bit(&self) -> u8 {
        let position = match *self {
            ErrorRegister::GenericError => 0,
            ErrorRegister::Current => 1,
            ErrorRegister::Voltage => 2,
            ErrorRegister::Temperature => 3,
            ErrorRegister::CommunicationError => 4,
            ErrorRegister::DeviceProfileSpecific => 5,
            ErrorRegister::Reserved => 6,
            ErrorRegister::ManufacturerSpecific => 7,
        };
        1 << position
    }

    /// Register byte with the given bits set. The generic bit is always set
    /// when any other bit is.
    pub fn combine(bits: &[ErrorRegister]) -> u8 {
        let value = bits.iter().fold(0u8, |acc, b| acc | b.bit());
        if value != 0 {
            value | ErrorRegister::GenericError.bit()
        } else {
            0
        }
    }
}

/// One emergency message.
#[derive(Debug, Clone, PartialEq)]
pub struct EmcyError {
    pub code: u16,
    pub register: u8,
    pub data: [u8; 5],
    pub timestamp: Instant,
}

impl EmcyError {
    pub fn new(code: u16, register: u8, data: &[u8], timestamp: Instant) -> Self {
        let mut vendor = [0u8; 5];
        for (dst, src) in vendor.iter_mut().zip(data) {
            *dst = *src;
        }
        EmcyError { code, register, data: vendor, timestamp }
    }

    /// Parse the frame payload: u16 code (LE), u8 register, 5 vendor bytes.
    pub fn from_frame(data: &[u8], timestamp: Instant) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }
        let code = u16::from_le_bytes([data[0], data[1]]);
        Some(EmcyError::new(code, data[2], &data[3..], timestamp))
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let code = self.code.to_le_bytes();
        let d = self.data;
        [code[0], code[1], self.register, d[0], d[1], d[2], d[3], d[4]]
    }

    /// Codes of the 0x00xx class clear the active errors.
    pub fn is_reset(&self) -> bool {
        self.code & 0xFF00 == 0
    }

    pub fn description(&self) -> &'static str {
        ERROR_CLASSES
            .iter()
            .find(|(code, mask, _)| self.code & *mask == *code)
            .map_or("", |(_, _, text)| *text)
    }
}

impl fmt::Display for EmcyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code {:#06x}", self.code)?;
        let description = self.description();
        if !description.is_empty() {
            write!(f, ", {}", description)?;
        }
        Ok(())
    }
}

pub type EmcyCallback = Arc<dyn Fn(&EmcyError) + Send + Sync>;

#[derive(Debug, Default)]
struct EmcyLog {
    active: Vec<EmcyError>,
    log: Vec<EmcyError>,
}

/// Collects the emergency messages of one remote node.
pub struct EmcyConsumer {
    node_id: u8,
    network: Arc<Network>,
    state: Mutex<EmcyLog>,
    received: Condvar,
    callbacks: Mutex<Vec<EmcyCallback>>,
    subscription: SubscriptionId,
}

impl EmcyConsumer {
    pub fn new(node_id: u8, network: Arc<Network>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<EmcyConsumer>| {
            let me = me.clone();
            let subscription = network.subscribe(COB_FUNC_EMCY + node_id as u32, move |_, data, ts| {
                if let Some(consumer) = me.upgrade() {
                    consumer.on_emcy(data, ts);
                }
            });
            EmcyConsumer {
                node_id,
                network: network.clone(),
                state: Mutex::new(EmcyLog::default()),
                received: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
                subscription,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, EmcyLog> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_emcy(&self, data: &[u8], timestamp: Instant) {
        let Some(entry) = EmcyError::from_frame(data, timestamp) else {
            warn!("Dropping malformed EMCY frame {:02x?} from node {}", data, self.node_id);
            return;
        };
        {
            let mut state = self.lock();
            if entry.is_reset() {
                info!("Node {} reset its errors", self.node_id);
                state.active.clear();
            } else {
                warn!("EMCY from node {}: {}", self.node_id, entry);
                state.active.push(entry.clone());
            }
            state.log.push(entry.clone());
            self.received.notify_all();
        }
        let callbacks: Vec<EmcyCallback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(&entry);
        }
    }

    /// Errors reported since the last reset message.
    pub fn active(&self) -> Vec<EmcyError> {
        self.lock().active.clone()
    }

    /// Every message received, resets included.
    pub fn log(&self) -> Vec<EmcyError> {
        self.lock().log.clone()
    }

    /// Forget all received messages.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.active.clear();
        state.log.clear();
    }

    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&EmcyError) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Wait for the next message, optionally with a specific code.
    pub fn wait(&self, code: Option<u16>, timeout: Duration) -> Option<EmcyError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let mut seen = state.log.len();
        loop {
            if let Some(entry) = state.log[seen..].iter().find(|e| code.map_or(true, |c| e.code == c)) {
                return Some(entry.clone());
            }
            seen = state.log.len();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self.received.wait_timeout(state, remaining).unwrap_or_else(|e| e.into_inner()).0;
        }
    }
}

impl Drop for EmcyConsumer {
    fn drop(&mut self) {
        self.network.unsubscribe(COB_FUNC_EMCY + self.node_id as u32, self.subscription);
    }
}

/// Sends emergency messages for a local node.
#[derive(Clone)]
pub struct EmcyProducer {
    cob_id: u32,
    network: Arc<Network>,
}

impl EmcyProducer {
    pub fn new(node_id: u8, network: Arc<Network>) -> Self {
        EmcyProducer { cob_id: COB_FUNC_EMCY + node_id as u32, network }
    }

    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    pub fn send(&self, code: u16, register: u8, data: &[u8]) -> Result<()> {
        let entry = EmcyError::new(code, register, data, Instant::now());
        debug!("Sending EMCY {} on {:#x}", entry, self.cob_id);
        self.network.send_message(self.cob_id, &entry.to_bytes())
    }

    /// Signal that all errors are gone.
    pub fn reset(&self, register: u8, data: &[u8]) -> Result<()> {
        self.send(0, register, data)
    }
}

/// Record an error in the error register and the pre-defined error field.
///
/// The newest error is stored at subindex 1 and older entries move up, up to
/// the depth of the error field. Objects missing from the dictionary are
/// skipped.
pub fn record_error(access: &dyn DictionaryAccess, code: u16, register: u8, data: &[u8]) -> Result<()> {
    let od = access.dictionary();
    if od.contains(REG_ERROR) {
        access.write_value(REG_ERROR, 0, Value::Unsigned(register as u64))?;
    }
    let Some(field) = od.get(REG_PRE_DEFINED_ERROR) else { return Ok(()) };
    let depth = field.members().iter().map(|v| v.sub_index()).max().unwrap_or(0);
    if depth == 0 {
        return Ok(());
    }
    let count = access.read_value(REG_PRE_DEFINED_ERROR, 0)?.as_u64().unwrap_or(0) as u8;
    let count = count.min(depth);
    for sub in (1..count.min(depth - 1) + 1).rev() {
        let older = access.read_raw(REG_PRE_DEFINED_ERROR, sub)?;
        access.write_raw(REG_PRE_DEFINED_ERROR, sub + 1, &older)?;
    }
    let info = u16::from_le_bytes([data.first().copied().unwrap_or(0), data.get(1).copied().unwrap_or(0)]);
    let entry = (info as u32) << 16 | code as u32;
    access.write_value(REG_PRE_DEFINED_ERROR, 1, Value::Unsigned(entry as u64))?;
    access.write_value(REG_PRE_DEFINED_ERROR, 0, Value::Unsigned((count as u64 + 1).min(depth as u64)))
}

/// Clear the error register and the error history.
pub fn clear_errors(access: &dyn DictionaryAccess) -> Result<()> {
    let od = access.dictionary();
    if od.contains(REG_ERROR) {
        access.write_value(REG_ERROR, 0, Value::Unsigned(0))?;
    }
    if od.contains(REG_PRE_DEFINED_ERROR) {
        access.write_value(REG_PRE_DEFINED_ERROR, 0, Value::Unsigned(0))?;
    }
    Ok(())
}
