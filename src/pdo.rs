use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::config::PdoMappingLayout;
use crate::constant::{
    COB_FUNC_RPDO_0, COB_FUNC_TPDO_0, COB_ID_MASK, DUMMY_OBJECTS_RANGE, MAX_PDO_COUNT,
    MAX_PDO_MAPPING_LENGTH, PDO_NOT_VALID, REG_RPDO_COMMUNICATION, REG_RPDO_MAPPING,
    REG_TPDO_COMMUNICATION, REG_TPDO_MAPPING, RTR_NOT_ALLOWED,
};
use crate::data_type::DataType;
use crate::error::{AbortCode, Error, Result};
use crate::network::{Network, PeriodicTask, SubscriptionId};
use crate::object_dictionary::{DictionaryAccess, Object, ObjectDictionary};
use crate::prelude::*;
use crate::util::{get_bits, le_bytes_to_u64, set_bits, sign_extend};
use crate::value::Value;
use crate::variable::Variable;
use crate::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoDirection {
    /// Received by the node owning the dictionary (RPDO).
    Rx,
    /// Transmitted by the node owning the dictionary (TPDO).
    Tx,
}

/// One dictionary entry placed into a PDO.
#[derive(Debug, Clone, PartialEq)]
pub struct PdoEntry {
    pub variable: Variable,
    /// Bit offset inside the PDO data.
    pub offset: usize,
    /// Bit length of the slot.
    pub length: usize,
}

impl PdoEntry {
    pub fn index(&self) -> u16 {
        self.variable.index()
    }

    pub fn sub_index(&self) -> u8 {
        self.variable.sub_index()
    }

    fn is_dummy(&self) -> bool {
        DUMMY_OBJECTS_RANGE.contains(&self.index())
    }

    /// The slot as little-endian bytes in the entry's own type width.
    fn raw_bytes(&self, data: &[u8]) -> Vec<u8> {
        let mut raw = get_bits(data, self.offset, self.length);
        let data_type = self.variable.data_type();
        if data_type.is_signed() && self.length < data_type.bit_length() {
            raw = sign_extend(raw, self.length) as u64;
        }
        let size = data_type.size().unwrap_or((self.length + 7) / 8).min(8);
        raw.to_le_bytes()[..size].to_vec()
    }

    fn decode(&self, data: &[u8]) -> Result<Value> {
        self.variable.decode_raw(&self.raw_bytes(data))
    }

    fn store(&self, data: &mut [u8], bytes: &[u8]) {
        set_bits(data, self.offset, self.length, le_bytes_to_u64(bytes));
    }
}

pub type PdoCallback = Arc<dyn Fn(&PdoMap) + Send + Sync>;

#[derive(Debug)]
struct PdoState {
    enabled: bool,
    cob_id: u32,
    rtr_allowed: bool,
    trans_type: Option<u8>,
    inhibit_time: Option<u16>,
    event_timer: Option<u16>,
    sync_start_value: Option<u8>,
    entries: Vec<PdoEntry>,
    length: usize,
    data: Vec<u8>,
    timestamp: Option<Instant>,
    period: Option<Duration>,
    is_received: bool,
    task: Option<PeriodicTask>,
    subscription: Option<(u32, SubscriptionId)>,
}

/// One PDO: communication parameters, mapping and current data.
///
/// A map either receives frames or periodically transmits them. Frames on
/// its COB-ID are ignored while its own periodic task runs.
pub struct PdoMap {
    me: Weak<PdoMap>,
    direction: PdoDirection,
    number: u16,
    com_index: u16,
    map_index: u16,
    predefined_cob_id: u32,
    layout: PdoMappingLayout,
    od: Arc<ObjectDictionary>,
    network: Arc<Network>,
    state: Mutex<PdoState>,
    reception: Condvar,
    callbacks: Mutex<Vec<PdoCallback>>,
}

impl PdoMap {
    /// Map number `number` (from 1) of the given direction.
    pub fn new(
        direction: PdoDirection,
        number: u16,
        od: Arc<ObjectDictionary>,
        network: Arc<Network>,
        layout: PdoMappingLayout,
    ) -> Arc<Self> {
        let n = number.saturating_sub(1);
        let (com_index, map_index, function) = match direction {
            PdoDirection::Rx => (REG_RPDO_COMMUNICATION + n, REG_RPDO_MAPPING + n, COB_FUNC_RPDO_0),
            PdoDirection::Tx => (REG_TPDO_COMMUNICATION + n, REG_TPDO_MAPPING + n, COB_FUNC_TPDO_0),
        };
        let node_id = od.node_id().unwrap_or(0) as u32;
        let predefined_cob_id = if n < 4 { function + n as u32 * 0x100 + node_id } else { 0 };
        Arc::new_cyclic(|me| PdoMap {
            me: me.clone(),
            direction,
            number,
            com_index,
            map_index,
            predefined_cob_id,
            layout,
            od,
            network,
            state: Mutex::new(PdoState {
                enabled: false,
                cob_id: predefined_cob_id,
                rtr_allowed: true,
                trans_type: None,
                inhibit_time: None,
                event_timer: None,
                sync_start_value: None,
                entries: Vec::new(),
                length: 0,
                data: Vec::new(),
                timestamp: None,
                period: None,
                is_received: false,
                task: None,
                subscription: None,
            }),
            reception: Condvar::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PdoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// "RxPDO1" / "TxPDO3" style name.
    pub fn name(&self) -> String {
        let direction = match self.direction {
            PdoDirection::Rx => "Rx",
            PdoDirection::Tx => "Tx",
        };
        format!("{}PDO{}", direction, self.number)
    }

    pub fn direction(&self) -> PdoDirection {
        self.direction
    }
    pub fn number(&self) -> u16 {
        self.number
    }
    pub fn com_index(&self) -> u16 {
        self.com_index
    }
    pub fn map_index(&self) -> u16 {
        self.map_index
    }
    pub fn cob_id(&self) -> u32 {
        self.lock().cob_id
    }
    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }
    pub fn rtr_allowed(&self) -> bool {
        self.lock().rtr_allowed
    }
    pub fn trans_type(&self) -> Option<u8> {
        self.lock().trans_type
    }
    pub fn inhibit_time(&self) -> Option<u16> {
        self.lock().inhibit_time
    }
    pub fn event_timer(&self) -> Option<u16> {
        self.lock().event_timer
    }
    pub fn sync_start_value(&self) -> Option<u8> {
        self.lock().sync_start_value
    }
    pub fn entries(&self) -> Vec<PdoEntry> {
        self.lock().entries.clone()
    }
    /// Total mapped length in bits.
    pub fn length(&self) -> usize {
        self.lock().length
    }
    pub fn data(&self) -> Vec<u8> {
        self.lock().data.clone()
    }
    pub fn timestamp(&self) -> Option<Instant> {
        self.lock().timestamp
    }
    /// Transmission period, set by `start` or measured between receptions.
    pub fn period(&self) -> Option<Duration> {
        self.lock().period
    }

    pub fn set_cob_id(&self, cob_id: u32) {
        self.lock().cob_id = cob_id & COB_ID_MASK;
    }
    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }
    pub fn set_rtr_allowed(&self, allowed: bool) {
        self.lock().rtr_allowed = allowed;
    }
    pub fn set_trans_type(&self, trans_type: u8) {
        self.lock().trans_type = Some(trans_type);
    }
    pub fn set_inhibit_time(&self, inhibit_time: u16) {
        self.lock().inhibit_time = Some(inhibit_time);
    }
    pub fn set_event_timer(&self, event_timer: u16) {
        self.lock().event_timer = Some(event_timer);
    }
    pub fn set_sync_start_value(&self, value: u8) {
        self.lock().sync_start_value = Some(value);
    }

    /// Synchronous transmission, or event driven with an event timer.
    pub fn is_periodic(&self) -> bool {
        let state = self.lock();
        if state.task.is_some() {
            return true;
        }
        match state.trans_type {
            Some(t) if t <= 0xF0 => true,
            Some(t) if t >= 0xFE => state.event_timer.map_or(false, |e| e > 0),
            _ => false,
        }
    }

    /// Remove all mapped entries.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.length = 0;
        state.data.clear();
    }

    /// Append an entry. `length` defaults to the width of its data type.
    ///
    /// Entries that would make the PDO longer than 64 bits are skipped.
    pub fn add_variable(&self, index: u16, sub_index: u8, length: Option<usize>) -> Result<PdoEntry> {
        let variable = match self.od.variable(index, sub_index) {
            Ok(var) => var.into_owned(),
            Err(e) => {
                let Some(length) = length else { return Err(e) };
                warn!("{:#06x}:{:02x} mapped in {} is not in the dictionary", index, sub_index, self.name());
                let name = format!("Unknown{:04x}_{:02x}", index, sub_index);
                let data_type = if length <= 8 { DataType::Unsigned8 } else { DataType::Domain };
                Variable::new(name, index, sub_index, data_type)
            }
        };
        let length = length.unwrap_or_else(|| variable.bit_length());
        let mut state = self.lock();
        if state.length + length > MAX_PDO_MAPPING_LENGTH {
            warn!("Max size of {} exceeded ({} > {}), skipping {:#06x}:{:02x}",
                self.name(), state.length + length, MAX_PDO_MAPPING_LENGTH, index, sub_index);
            return Err(Error::Pdo(format!("{} would exceed {} bits", self.name(), MAX_PDO_MAPPING_LENGTH)));
        }
        let entry = PdoEntry { variable, offset: state.length, length };
        debug!("Adding {} ({:#06x}:{:02x}) at offset {} to {}", entry.variable.name(), index, sub_index,
            entry.offset, self.name());
        state.length += length;
        state.entries.push(entry.clone());
        let size = (state.length + 7) / 8;
        state.data.resize(size, 0);
        Ok(entry)
    }

    /// Read the configuration through `access`, then (re)subscribe.
    pub fn read(&self, access: &dyn DictionaryAccess) -> Result<()> {
        self.configure(|index, sub| access.read_value(index, sub).and_then(unsigned))
    }

    /// Configure from the dictionary's default values.
    pub fn read_from_od(&self) -> Result<()> {
        let node_id = self.od.node_id();
        let od = self.od.clone();
        self.configure(move |index, sub| {
            let var = od.variable(index, sub)?;
            var.value_for_node(node_id)
                .ok_or_else(|| Error::InvalidValue(format!("{:#06x}:{:02x} has no default value", index, sub)))
                .and_then(unsigned)
        })
    }

    fn configure<F>(&self, read: F) -> Result<()>
    where
        F: Fn(u16, u8) -> Result<u64>,
    {
        let raw_cob_id = match read(self.com_index, 1) {
            Ok(v) => v as u32,
            Err(e) => {
                warn!("Could not read COB-ID of {}: {}, using {:#x}", self.name(), e, self.predefined_cob_id);
                self.predefined_cob_id
            }
        };
        let trans_type = read(self.com_index, 2).ok().map(|v| v as u8);
        let (mut inhibit_time, mut event_timer) = (None, None);
        if trans_type.map_or(false, |t| t >= 0xFE) {
            inhibit_time = optional(read(self.com_index, 3), "inhibit time", self).map(|v| v as u16);
            event_timer = optional(read(self.com_index, 5), "event timer", self).map(|v| v as u16);
        }
        let sync_start_value = read(self.com_index, 6).ok().map(|v| v as u8);
        {
            let mut state = self.lock();
            state.cob_id = raw_cob_id & COB_ID_MASK;
            state.enabled = raw_cob_id & PDO_NOT_VALID == 0;
            state.rtr_allowed = raw_cob_id & RTR_NOT_ALLOWED == 0;
            state.trans_type = trans_type;
            state.inhibit_time = inhibit_time;
            state.event_timer = event_timer;
            state.sync_start_value = sync_start_value;
        }
        self.clear();

        let count = read(self.map_index, 0).unwrap_or(0);
        for sub in 1..=count.min(0xFE) as u8 {
            let value = match read(self.map_index, sub) {
                Ok(v) => v as u32,
                Err(e) => {
                    warn!("Cannot read mapping entry {} of {}: {}", sub, self.name(), e);
                    continue;
                }
            };
            let (index, sub_index, length) = self.layout.decode(value);
            if index == 0 || length == 0 {
                continue;
            }
            // Overlong entries are logged and left out.
            let _ = self.add_variable(index, sub_index, Some(length));
        }
        info!("{} configured: COB-ID {:#x}, enabled {}, {} entries", self.name(), self.cob_id(),
            self.enabled(), self.lock().entries.len());
        self.subscribe();
        Ok(())
    }

    /// Write the configuration through `access`.
    ///
    /// The PDO is disabled while its parameters and mapping are written and
    /// re-enabled afterwards when it is enabled.
    pub fn save(&self, access: &dyn DictionaryAccess) -> Result<()> {
        let (cob_id, rtr_allowed, enabled, trans_type, inhibit_time, event_timer, sync_start, entries) = {
            let s = self.lock();
            (s.cob_id, s.rtr_allowed, s.enabled, s.trans_type, s.inhibit_time, s.event_timer,
             s.sync_start_value, s.entries.clone())
        };
        let rtr_bit = if rtr_allowed { 0 } else { RTR_NOT_ALLOWED };
        info!("Setting COB-ID {:#x} and temporarily disabling {}", cob_id, self.name());
        let com = self.com_index;
        access.write_value(com, 1, Value::Unsigned((cob_id | PDO_NOT_VALID | rtr_bit) as u64))?;
        if let Some(t) = trans_type {
            access.write_value(com, 2, Value::Unsigned(t as u64))?;
        }
        if let Some(t) = inhibit_time {
            access.write_value(com, 3, Value::Unsigned(t as u64))?;
        }
        if let Some(t) = event_timer {
            access.write_value(com, 5, Value::Unsigned(t as u64))?;
        }
        if let Some(v) = sync_start {
            access.write_value(com, 6, Value::Unsigned(v as u64))?;
        }

        let map = self.map_index;
        let mut fill_dummy = false;
        if let Err(e) = access.write_value(map, 0, Value::Unsigned(0)) {
            warn!("Cannot clear mapping count of {}: {}, filling unused entries instead", self.name(), e);
            fill_dummy = true;
        }
        for (i, entry) in entries.iter().enumerate() {
            let value = self.layout.encode(entry.index(), entry.sub_index(), entry.length);
            debug!("Writing {} ({:#010x}) to {:#06x}:{:02x}", entry.variable.name(), value, map, i + 1);
            access.write_value(map, (i + 1) as u8, Value::Unsigned(value as u64))?;
        }
        if !fill_dummy {
            match access.write_value(map, 0, Value::Unsigned(entries.len() as u64)) {
                Ok(()) => {}
                Err(e) if e.abort_code() == AbortCode::AttemptToWriteReadOnlyObject.code() => {
                    fill_dummy = true;
                }
                Err(e) => return Err(e),
            }
        }
        if fill_dummy {
            for sub in entries.len() + 1..=self.max_mapping_entries() {
                access.write_value(map, sub as u8, Value::Unsigned(0))?;
            }
        }

        if enabled {
            info!("Enabling {}", self.name());
            access.write_value(com, 1, Value::Unsigned((cob_id | rtr_bit) as u64))?;
            self.subscribe();
        }
        Ok(())
    }

    fn max_mapping_entries(&self) -> usize {
        let Some(obj) = self.od.get(self.map_index) else { return 0 };
        let explicit = obj.members().iter().map(|v| v.sub_index() as usize).max().unwrap_or(0);
        let declared = obj
            .variable(0)
            .and_then(|v| v.default().and_then(Value::as_u64))
            .unwrap_or(0) as usize;
        explicit.max(declared)
    }

    /// Listen on the current COB-ID, replacing an earlier subscription.
    pub fn subscribe(&self) {
        let mut state = self.lock();
        if let Some((cob_id, id)) = state.subscription.take() {
            self.network.unsubscribe(cob_id, id);
        }
        if !state.enabled {
            return;
        }
        let me = self.me.clone();
        let id = self.network.subscribe(state.cob_id, move |cob_id, data, timestamp| {
            if let Some(map) = me.upgrade() {
                map.on_frame(cob_id, data, timestamp);
            }
        });
        state.subscription = Some((state.cob_id, id));
    }

    pub fn unsubscribe(&self) {
        if let Some((cob_id, id)) = self.lock().subscription.take() {
            self.network.unsubscribe(cob_id, id);
        }
    }

    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&PdoMap) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Handle a frame received on this map's COB-ID.
    pub fn on_frame(&self, cob_id: u32, data: &[u8], timestamp: Instant) {
        {
            let mut state = self.lock();
            if cob_id != state.cob_id || state.task.is_some() {
                return;
            }
            state.is_received = true;
            state.data = data.to_vec();
            if let Some(previous) = state.timestamp {
                state.period = Some(timestamp.saturating_duration_since(previous));
            }
            state.timestamp = Some(timestamp);
            self.reception.notify_all();
        }
        let callbacks: Vec<PdoCallback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(self);
        }
    }

    /// Block until the next frame arrives; returns its timestamp.
    pub fn wait_for_reception(&self, timeout: Duration) -> Option<Instant> {
        let mut state = self.lock();
        state.is_received = false;
        let (state, _) = self
            .reception
            .wait_timeout_while(state, timeout, |s| !s.is_received)
            .unwrap_or_else(|e| e.into_inner());
        if state.is_received {
            state.timestamp
        } else {
            None
        }
    }

    /// Send the current data once.
    pub fn transmit(&self) -> Result<()> {
        let (cob_id, data) = {
            let state = self.lock();
            (state.cob_id, state.data.clone())
        };
        self.network.send_message(cob_id, &data)
    }

    /// Start periodic transmission.
    ///
    /// Without `period` the last known period, then the event timer, is used.
    pub fn start(&self, period: Option<Duration>) -> Result<()> {
        self.stop();
        let mut state = self.lock();
        let event_period = state.event_timer.filter(|&ms| ms > 0).map(|ms| Duration::from_millis(ms as u64));
        let period = period
            .or(state.period)
            .or(event_period)
            .filter(|p| !p.is_zero())
            .ok_or_else(|| Error::Pdo(format!("no transmission period for {}", self.name())))?;
        state.period = Some(period);
        info!("Starting {} with a period of {:?}", self.name(), period);
        let task = self.network.send_periodic(state.cob_id, &state.data, period, false);
        state.task = Some(task);
        Ok(())
    }

    /// Stop periodic transmission. No frame is sent once this returns.
    pub fn stop(&self) {
        let task = self.lock().task.take();
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// Push the current data into the running periodic task.
    pub fn update(&self) {
        let state = self.lock();
        if let Some(task) = &state.task {
            task.update(&state.data);
        }
    }

    /// Ask the producer for the PDO with a remote frame.
    pub fn remote_request(&self) -> Result<()> {
        let (enabled, rtr_allowed, cob_id, len) = {
            let s = self.lock();
            (s.enabled, s.rtr_allowed, s.cob_id, s.data.len())
        };
        if enabled && rtr_allowed {
            self.network.send_remote(cob_id, len)
        } else {
            Err(Error::Pdo(format!("{} does not accept remote requests", self.name())))
        }
    }

    fn find_entry(state: &PdoState, index: u16, sub_index: u8) -> Result<PdoEntry> {
        state
            .entries
            .iter()
            .find(|e| e.index() == index && e.sub_index() == sub_index)
            .cloned()
            .ok_or(Error::NotFound { index, sub_index: Some(sub_index) })
    }

    pub fn contains(&self, index: u16, sub_index: u8) -> bool {
        Self::find_entry(&self.lock(), index, sub_index).is_ok()
    }

    /// Decode a mapped entry from the current data.
    pub fn value(&self, index: u16, sub_index: u8) -> Result<Value> {
        let state = self.lock();
        let entry = Self::find_entry(&state, index, sub_index)?;
        entry.decode(&state.data)
    }

    /// Encode a mapped entry into the current data.
    ///
    /// A running periodic task picks up the new data on its next cycle.
    pub fn set_value(&self, index: u16, sub_index: u8, value: Value) -> Result<()> {
        let mut state = self.lock();
        let entry = Self::find_entry(&state, index, sub_index)?;
        let bytes = entry.variable.encode_raw(&value)?;
        entry.store(&mut state.data, &bytes);
        if let Some(task) = &state.task {
            task.update(&state.data);
        }
        Ok(())
    }

    pub fn value_by_name(&self, path: &str) -> Result<Value> {
        let (index, sub_index) = self.resolve(path)?;
        self.value(index, sub_index)
    }

    pub fn set_value_by_name(&self, path: &str, value: Value) -> Result<()> {
        let (index, sub_index) = self.resolve(path)?;
        self.set_value(index, sub_index, value)
    }

    fn resolve(&self, path: &str) -> Result<(u16, u8)> {
        if let Some(entry) = self.lock().entries.iter().find(|e| e.variable.name() == path) {
            return Ok((entry.index(), entry.sub_index()));
        }
        let var = self.od.variable_by_name(path)?;
        Ok((var.index(), var.sub_index()))
    }

    /// Fill the data with the values of the mapped entries read from `access`.
    pub fn pull_from(&self, access: &dyn DictionaryAccess) {
        let entries = self.entries();
        let mut updates = Vec::with_capacity(entries.len());
        for entry in entries.iter().filter(|e| !e.is_dummy()) {
            match access.read_raw(entry.index(), entry.sub_index()) {
                Ok(bytes) => updates.push((entry, bytes)),
                Err(e) => warn!("Cannot read {:#06x}:{:02x} for {}: {}", entry.index(), entry.sub_index(),
                    self.name(), e),
            }
        }
        let mut state = self.lock();
        for (entry, bytes) in updates {
            entry.store(&mut state.data, &bytes);
        }
    }

    /// Write the values of the mapped entries to `access`.
    pub fn push_to(&self, access: &dyn DictionaryAccess) {
        let (entries, data) = {
            let state = self.lock();
            (state.entries.clone(), state.data.clone())
        };
        for entry in entries.iter().filter(|e| !e.is_dummy()) {
            if let Err(e) = access.write_raw(entry.index(), entry.sub_index(), &entry.raw_bytes(&data)) {
                warn!("Cannot write {:#06x}:{:02x} from {}: {}", entry.index(), entry.sub_index(), self.name(), e);
            }
        }
    }
}

impl Debug for PdoMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("PdoMap")
            .field("name", &self.name())
            .field("cob_id", &state.cob_id)
            .field("enabled", &state.enabled)
            .field("trans_type", &state.trans_type)
            .field("entries", &state.entries.len())
            .field("data", &state.data)
            .finish()
    }
}

impl Drop for PdoMap {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut task) = state.task.take() {
            task.stop();
        }
        if let Some((cob_id, id)) = state.subscription.take() {
            self.network.unsubscribe(cob_id, id);
        }
    }
}

fn unsigned(value: Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| Error::InvalidValue(format!("{} is not an unsigned value", value)))
}

fn optional(result: Result<u64>, what: &str, map: &PdoMap) -> Option<u64> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("No {} for {}: {}", what, map.name(), e);
            None
        }
    }
}

/// All PDOs of one direction found in a dictionary.
pub struct PdoMaps {
    direction: PdoDirection,
    maps: BTreeMap<u16, Arc<PdoMap>>,
}

impl PdoMaps {
    /// One map per communication record present in the dictionary.
    pub fn new(
        direction: PdoDirection,
        od: Arc<ObjectDictionary>,
        network: Arc<Network>,
        layout: PdoMappingLayout,
    ) -> Self {
        let com_base = match direction {
            PdoDirection::Rx => REG_RPDO_COMMUNICATION,
            PdoDirection::Tx => REG_TPDO_COMMUNICATION,
        };
        let maps = (0..MAX_PDO_COUNT)
            .filter(|n| od.contains(com_base + n))
            .map(|n| (n + 1, PdoMap::new(direction, n + 1, od.clone(), network.clone(), layout)))
            .collect();
        PdoMaps { direction, maps }
    }

    pub fn direction(&self) -> PdoDirection {
        self.direction
    }

    /// Map by number, starting at 1.
    pub fn get(&self, number: u16) -> Option<&Arc<PdoMap>> {
        self.maps.get(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PdoMap>> {
        self.maps.values()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn read(&self, access: &dyn DictionaryAccess) -> Result<()> {
        self.maps.values().try_for_each(|map| map.read(access))
    }

    pub fn read_from_od(&self) -> Result<()> {
        self.maps.values().try_for_each(|map| map.read_from_od())
    }

    pub fn save(&self, access: &dyn DictionaryAccess) -> Result<()> {
        self.maps.values().try_for_each(|map| map.save(access))
    }

    pub fn subscribe(&self) {
        self.maps.values().for_each(|map| map.subscribe());
    }

    pub fn stop(&self) {
        self.maps.values().for_each(|map| map.stop());
    }

    /// Maps that carry the given entry.
    pub fn containing(&self, index: u16, sub_index: u8) -> Vec<Arc<PdoMap>> {
        self.maps.values().filter(|m| m.contains(index, sub_index)).cloned().collect()
    }

    /// First mapped value of the given entry.
    pub fn value(&self, index: u16, sub_index: u8) -> Option<Value> {
        self.maps.values().find_map(|m| m.value(index, sub_index).ok())
    }
}
