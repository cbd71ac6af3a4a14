use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use crossbeam::atomic::AtomicCell;

use crate::config::NodeConfig;
use crate::constant::{
    COB_FUNC_NMT, COB_FUNC_SYNC, COMMUNICATION_REGISTERS_RANGE, DUMMY_OBJECTS_RANGE, EMCY_PDO_NOT_PROCESSED,
    MAX_PDO_MAPPING_LENGTH, REG_PRODUCER_HEARTBEAT_TIME, REG_RESTORE_DEFAULT_PARAMETERS, REG_RPDO_MAPPING,
    REG_STORE_PARAMETERS, REG_TPDO_MAPPING, RESET_MAGIC_CODE, STORE_MAGIC_CODE,
};
use crate::emergency::{clear_errors, record_error, EmcyProducer, ErrorRegister};
use crate::error::{AbortCode, Access, Error, Result};
use crate::network::{Network, SubscriptionId};
use crate::nmt::{NmtCommand, NmtSlave, NmtState};
use crate::object_dictionary::{DictionaryAccess, ObjectDictionary};
use crate::pdo::{PdoDirection, PdoMap, PdoMaps};
use crate::prelude::*;
use crate::sdo_server::{SdoServer, ServerStore};
use crate::variable::Variable;
use crate::{debug, error, info, warn};

/// Supplies the value of a read, or `None` to fall through to the store.
pub type ReadCallback = Arc<dyn Fn(&LocalNode, &Variable) -> Option<Vec<u8>> + Send + Sync>;
/// Sees every write before it is stored; an error rejects the write.
pub type WriteCallback = Arc<dyn Fn(&LocalNode, &Variable, &[u8]) -> Result<()> + Send + Sync>;

/// A node implemented by this process.
///
/// Values live in a store keyed by (index, subindex); entries never written
/// read as their dictionary default. The node serves SDO requests, follows
/// NMT commands, consumes RPDOs and produces TPDOs, heartbeat and EMCY.
pub struct LocalNode {
    me: Weak<LocalNode>,
    node_id: u8,
    od: Arc<ObjectDictionary>,
    network: Arc<Network>,
    config: NodeConfig,
    data: Mutex<HashMap<(u16, u8), Vec<u8>>>,
    stored: Mutex<HashMap<(u16, u8), Vec<u8>>>,
    read_callbacks: RwLock<Vec<ReadCallback>>,
    write_callbacks: RwLock<Vec<WriteCallback>>,
    sdo: SdoServer,
    nmt: NmtSlave,
    emcy: EmcyProducer,
    tpdo: PdoMaps,
    rpdo: PdoMaps,
    sync_count: AtomicCell<u32>,
    pending_rpdo: Mutex<Vec<u16>>,
    subscriptions: Mutex<Vec<(u32, SubscriptionId)>>,
}

impl LocalNode {
    pub fn new(node_id: u8, od: Arc<ObjectDictionary>, network: Arc<Network>) -> Result<Arc<Self>> {
        Self::with_config(node_id, od, network, NodeConfig::default())
    }

    pub fn with_config(
        node_id: u8,
        od: Arc<ObjectDictionary>,
        network: Arc<Network>,
        config: NodeConfig,
    ) -> Result<Arc<Self>> {
        let node = Arc::new_cyclic(|me| LocalNode {
            me: me.clone(),
            node_id,
            od: od.clone(),
            network: network.clone(),
            config,
            data: Mutex::new(HashMap::new()),
            stored: Mutex::new(HashMap::new()),
            read_callbacks: RwLock::new(Vec::new()),
            write_callbacks: RwLock::new(Vec::new()),
            sdo: SdoServer::new(node_id, network.clone()),
            nmt: NmtSlave::new(node_id, network.clone()),
            emcy: EmcyProducer::new(node_id, network.clone()),
            tpdo: PdoMaps::new(PdoDirection::Tx, od.clone(), network.clone(), config.pdo_layout),
            rpdo: PdoMaps::new(PdoDirection::Rx, od.clone(), network.clone(), config.pdo_layout),
            sync_count: AtomicCell::new(0),
            pending_rpdo: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        });
        node.attach();
        node.configure_communication()?;
        info!("Local node {} created with {} objects", node_id, od.len());
        Ok(node)
    }

    fn attach(&self) {
        let mut subscriptions = Vec::new();

        let me = self.me.clone();
        let id = self.network.subscribe(self.sdo.rx_cobid(), move |_, data, _| {
            if let Some(node) = me.upgrade() {
                node.sdo.on_request(data, node.as_ref());
            }
        });
        subscriptions.push((self.sdo.rx_cobid(), id));

        let me = self.me.clone();
        let id = self.network.subscribe(COB_FUNC_NMT, move |_, data, _| {
            if let Some(node) = me.upgrade() {
                node.nmt.on_command(data);
            }
        });
        subscriptions.push((COB_FUNC_NMT, id));

        let me = self.me.clone();
        let id = self.network.subscribe(COB_FUNC_SYNC, move |_, _, _| {
            if let Some(node) = me.upgrade() {
                node.on_sync();
            }
        });
        subscriptions.push((COB_FUNC_SYNC, id));

        if let Ok(mut subs) = self.subscriptions.lock() {
            *subs = subscriptions;
        }

        let me = self.me.clone();
        self.nmt.add_state_listener(move |old, new| {
            if let Some(node) = me.upgrade() {
                node.on_state_change(old, new);
            }
        });
        let me = self.me.clone();
        self.nmt.add_reset_listener(move |command| {
            if let Some(node) = me.upgrade() {
                node.on_reset(command);
            }
        });
        for map in self.rpdo.iter() {
            let me = self.me.clone();
            map.add_callback(move |map| {
                if let Some(node) = me.upgrade() {
                    node.on_rpdo(map);
                }
            });
        }
    }

    /// Load PDO configuration and heartbeat time from the current values.
    fn configure_communication(&self) -> Result<()> {
        self.rpdo.read(self)?;
        self.tpdo.read(self)?;
        // TPDOs are produced here, never consumed.
        self.tpdo.iter().for_each(|map| map.unsubscribe());
        self.nmt.set_heartbeat_time(self.heartbeat_time());
        Ok(())
    }

    fn heartbeat_time(&self) -> u16 {
        if !self.od.contains(REG_PRODUCER_HEARTBEAT_TIME) {
            return 0;
        }
        match self.read_value(REG_PRODUCER_HEARTBEAT_TIME, 0) {
            Ok(value) => value.as_u64().unwrap_or(0) as u16,
            Err(e) => {
                warn!("Cannot read producer heartbeat time: {}", e);
                0
            }
        }
    }

    fn lock_data(&self) -> MutexGuard<'_, HashMap<(u16, u8), Vec<u8>>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
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
    pub fn sdo(&self) -> &SdoServer {
        &self.sdo
    }
    pub fn nmt(&self) -> &NmtSlave {
        &self.nmt
    }
    pub fn emcy(&self) -> &EmcyProducer {
        &self.emcy
    }
    pub fn tpdo(&self) -> &PdoMaps {
        &self.tpdo
    }
    pub fn rpdo(&self) -> &PdoMaps {
        &self.rpdo
    }

    /// Send the boot-up message and enter PRE-OPERATIONAL.
    pub fn boot(&self) -> Result<()> {
        self.nmt.boot()
    }

    pub fn add_read_callback<F>(&self, callback: F)
    where
        F: Fn(&LocalNode, &Variable) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.read_callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    pub fn add_write_callback<F>(&self, callback: F)
    where
        F: Fn(&LocalNode, &Variable, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.write_callbacks.write() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Raw value of an entry.
    pub fn get_data(&self, index: u16, sub_index: u8, check_readable: bool) -> Result<Vec<u8>> {
        let var = self.od.variable(index, sub_index)?;
        if check_readable && !var.is_readable() {
            return Err(Error::AccessViolation { index, sub_index, access: Access::Read });
        }
        let callbacks: Vec<ReadCallback> = self.read_callbacks.read().map(|c| c.clone()).unwrap_or_default();
        for callback in callbacks {
            if let Some(data) = callback(self, &var) {
                return Ok(data);
            }
        }
        if let Some(data) = self.lock_data().get(&(index, sub_index)) {
            return Ok(data.clone());
        }
        match var.default_for_node(Some(self.node_id)) {
            Some(value) => var.encode_raw(&value),
            None => Ok(var.data_type().default_value()),
        }
    }

    /// Store a raw value, running validation and write callbacks first.
    pub fn set_data(&self, index: u16, sub_index: u8, data: &[u8], check_writable: bool) -> Result<()> {
        let var = self.od.variable(index, sub_index)?.into_owned();
        if check_writable && !var.is_writable() {
            return Err(Error::AccessViolation { index, sub_index, access: Access::Write });
        }
        if let Some(size) = var.data_type().size() {
            if data.len() != size {
                return Err(Error::SizeMismatch { expected: size, actual: data.len() });
            }
        }
        self.check_mapping_entry(index, sub_index, data)?;

        let callbacks: Vec<WriteCallback> = self.write_callbacks.read().map(|c| c.clone()).unwrap_or_default();
        for callback in callbacks {
            callback(self, &var, data)?;
        }

        match index {
            REG_STORE_PARAMETERS if sub_index > 0 => return self.store_parameters(data),
            REG_RESTORE_DEFAULT_PARAMETERS if sub_index > 0 => return self.restore_defaults(data),
            _ => {}
        }
        debug!("Node {} stores {:#06x}:{:02x} = {:02x?}", self.node_id, index, sub_index, data);
        self.lock_data().insert((index, sub_index), data.to_vec());
        self.after_write(index, sub_index, data);
        Ok(())
    }

    /// Reject mapping entries that reference unmappable objects or overflow the PDO.
    fn check_mapping_entry(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<()> {
        let is_mapping = (REG_RPDO_MAPPING..REG_RPDO_MAPPING + 0x200).contains(&index)
            || (REG_TPDO_MAPPING..REG_TPDO_MAPPING + 0x200).contains(&index);
        if !is_mapping {
            return Ok(());
        }
        let layout = self.config.pdo_layout;
        if sub_index == 0 {
            let count = data.first().copied().unwrap_or(0);
            let mut total = 0;
            for sub in 1..=count {
                let raw = self.get_data(index, sub, false)?;
                let value = u32::from_le_bytes(raw.get(..4).and_then(|b| b.try_into().ok()).unwrap_or([0; 4]));
                total += layout.decode(value).2;
            }
            if total > MAX_PDO_MAPPING_LENGTH {
                warn!("Mapping of {:#06x} would be {} bits long", index, total);
                return Err(AbortCode::ExceedPDOSize.into());
            }
            return Ok(());
        }
        let Some(bytes) = data.get(..4).and_then(|b| <[u8; 4]>::try_from(b).ok()) else {
            return Ok(());
        };
        let value = u32::from_le_bytes(bytes);
        if value == 0 {
            return Ok(());
        }
        let (target, target_sub, _) = layout.decode(value);
        if DUMMY_OBJECTS_RANGE.contains(&target) {
            return Ok(());
        }
        match self.od.variable(target, target_sub) {
            Ok(var) if var.pdo_mappable() => Ok(()),
            _ => {
                warn!("{:#06x}:{:02x} cannot be mapped into a PDO", target, target_sub);
                Err(AbortCode::ObjectCannotBeMappedToPDO.into())
            }
        }
    }

    fn after_write(&self, index: u16, sub_index: u8, data: &[u8]) {
        if index == REG_PRODUCER_HEARTBEAT_TIME {
            let time = u16::from_le_bytes([data.first().copied().unwrap_or(0), data.get(1).copied().unwrap_or(0)]);
            self.nmt.set_heartbeat_time(time);
            return;
        }
        if let Some(map) = self.rpdo.iter().find(|m| m.com_index() == index || m.map_index() == index) {
            if let Err(e) = map.read(self) {
                warn!("Cannot reconfigure {}: {}", map.name(), e);
            }
            return;
        }
        if let Some(map) = self.tpdo.iter().find(|m| m.com_index() == index || m.map_index() == index) {
            map.stop();
            if let Err(e) = map.read(self) {
                warn!("Cannot reconfigure {}: {}", map.name(), e);
            }
            map.unsubscribe();
            if self.nmt.state() == NmtState::Operational {
                self.start_event_tpdo(map);
            }
            return;
        }
        for map in self.tpdo.containing(index, sub_index) {
            map.pull_from(self);
            map.update();
        }
    }

    fn store_parameters(&self, data: &[u8]) -> Result<()> {
        if signature(data) != STORE_MAGIC_CODE {
            return Err(AbortCode::DataTransferOrStoreFailed.into());
        }
        let snapshot = self.lock_data().clone();
        info!("Node {} stored {} parameters", self.node_id, snapshot.len());
        if let Ok(mut stored) = self.stored.lock() {
            *stored = snapshot;
        }
        Ok(())
    }

    fn restore_defaults(&self, data: &[u8]) -> Result<()> {
        if signature(data) != RESET_MAGIC_CODE {
            return Err(AbortCode::DataTransferOrStoreFailed.into());
        }
        info!("Node {} restores default parameters on the next reset", self.node_id);
        if let Ok(mut stored) = self.stored.lock() {
            stored.clear();
        }
        Ok(())
    }

    fn on_reset(&self, command: NmtCommand) {
        self.stop_tpdos();
        self.sdo.reset();
        self.sync_count.store(0);
        if let Ok(mut pending) = self.pending_rpdo.lock() {
            pending.clear();
        }
        let stored = self.stored.lock().map(|s| s.clone()).unwrap_or_default();
        {
            let mut data = self.lock_data();
            match command {
                NmtCommand::ResetCommunication => {
                    data.retain(|(index, _), _| !COMMUNICATION_REGISTERS_RANGE.contains(index));
                    for (key, value) in stored.into_iter().filter(|((i, _), _)| COMMUNICATION_REGISTERS_RANGE.contains(i)) {
                        data.insert(key, value);
                    }
                }
                _ => *data = stored,
            }
        }
        if let Err(e) = self.configure_communication() {
            error!("Node {} failed to reload its communication parameters: {}", self.node_id, e);
        }
    }

    fn on_state_change(&self, old: NmtState, new: NmtState) {
        if new == NmtState::Operational {
            self.sync_count.store(0);
            for map in self.tpdo.iter() {
                self.start_event_tpdo(map);
            }
        } else if old == NmtState::Operational {
            self.stop_tpdos();
        }
    }

    fn start_event_tpdo(&self, map: &Arc<PdoMap>) {
        let event_driven = map.trans_type().map_or(false, |t| t >= 0xFE);
        let Some(timer) = map.event_timer().filter(|&t| t > 0) else { return };
        if !map.enabled() || !event_driven {
            return;
        }
        map.pull_from(self);
        if let Err(e) = map.start(Some(std::time::Duration::from_millis(timer as u64))) {
            warn!("Cannot start {}: {}", map.name(), e);
        }
    }

    fn stop_tpdos(&self) {
        self.tpdo.stop();
    }

    fn on_sync(&self) {
        if self.nmt.state() != NmtState::Operational {
            return;
        }
        let count = self.sync_count.fetch_add(1).wrapping_add(1);
        let pending: Vec<u16> = self.pending_rpdo.lock().map(|mut p| p.drain(..).collect()).unwrap_or_default();
        for number in pending {
            if let Some(map) = self.rpdo.get(number) {
                map.push_to(self);
            }
        }
        for map in self.tpdo.iter().filter(|m| m.enabled()) {
            let due = match map.trans_type() {
                Some(0) => true,
                Some(t) if t <= 0xF0 => count % t as u32 == 0,
                _ => false,
            };
            if due {
                map.pull_from(self);
                if let Err(e) = map.transmit() {
                    error!("Failed to transmit {}: {}", map.name(), e);
                }
            }
        }
    }

    fn on_rpdo(&self, map: &PdoMap) {
        if self.nmt.state() != NmtState::Operational {
            debug!("Ignoring {} outside OPERATIONAL", map.name());
            return;
        }
        let expected = (map.length() + 7) / 8;
        if expected > 0 && map.data().len() != expected {
            warn!("{} has {} bytes, expected {}", map.name(), map.data().len(), expected);
            let cob_id = map.cob_id().to_le_bytes();
            if let Err(e) = self.trigger_emergency(EMCY_PDO_NOT_PROCESSED, ErrorRegister::GenericError.bit(), &cob_id) {
                error!("Failed to signal unprocessed PDO: {}", e);
            }
            return;
        }
        match map.trans_type() {
            Some(t) if t <= 0xF0 => {
                if let Ok(mut pending) = self.pending_rpdo.lock() {
                    if !pending.contains(&map.number()) {
                        pending.push(map.number());
                    }
                }
            }
            _ => map.push_to(self),
        }
    }

    /// Record the error in 0x1001/0x1003 and send an EMCY message.
    pub fn trigger_emergency(&self, code: u16, register: u8, data: &[u8]) -> Result<()> {
        record_error(self, code, register, data)?;
        self.emcy.send(code, register, data)
    }

    /// Clear the error register and history and send the EMCY reset message.
    pub fn clear_emergency(&self) -> Result<()> {
        clear_errors(self)?;
        self.emcy.reset(0, &[])
    }
}

fn signature(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    for (dst, src) in bytes.iter_mut().zip(data) {
        *dst = *src;
    }
    u32::from_le_bytes(bytes)
}

impl ServerStore for LocalNode {
    fn get_data(&self, index: u16, sub_index: u8, check_readable: bool) -> Result<Vec<u8>> {
        LocalNode::get_data(self, index, sub_index, check_readable)
    }

    fn set_data(&self, index: u16, sub_index: u8, data: &[u8], check_writable: bool) -> Result<()> {
        LocalNode::set_data(self, index, sub_index, data, check_writable)
    }

    fn data_size(&self, index: u16, sub_index: u8) -> Option<usize> {
        self.od.variable(index, sub_index).ok().and_then(|v| v.data_type().size())
    }
}

impl DictionaryAccess for LocalNode {
    fn dictionary(&self) -> &ObjectDictionary {
        &self.od
    }

    fn read_raw(&self, index: u16, sub_index: u8) -> Result<Vec<u8>> {
        self.get_data(index, sub_index, false)
    }

    fn write_raw(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<()> {
        self.set_data(index, sub_index, data, false)
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        let subscriptions = self.subscriptions.get_mut().map(std::mem::take).unwrap_or_default();
        for (cob_id, id) in subscriptions {
            self.network.unsubscribe(cob_id, id);
        }
        self.tpdo.stop();
        self.nmt.stop_heartbeat();
    }
}

impl Debug for LocalNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalNode")
            .field("node_id", &self.node_id)
            .field("nmt", &self.nmt.state())
            .field("values", &self.lock_data().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;
    use crate::error::TransportError;
    use crate::network::Transport;
    use crate::object_dictionary::{Array, Record};
    use crate::value::Value;
    use crate::variable::AccessType;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<(u32, Vec<u8>)> {
            std::mem::take(&mut *self.frames.lock().unwrap())
        }
    }

    impl Transport for Recorder {
        fn send(&self, cob_id: u32, data: &[u8], _: bool) -> core::result::Result<(), TransportError> {
            self.frames.lock().unwrap().push((cob_id, data.to_vec()));
            Ok(())
        }
    }

    fn dictionary() -> Arc<ObjectDictionary> {
        let mut od = ObjectDictionary::new().with_node_id(4);
        od.add_object(Variable::new("Error register", 0x1001, 0, DataType::Unsigned8)
            .with_access(AccessType::ReadOnly).with_default(0u8)).unwrap();
        od.add_object(
            Array::new("Pre-defined error field", 0x1003)
                .with_member(Variable::new("Number of errors", 0, 0, DataType::Unsigned8).with_default(0u8))
                .with_member(Variable::new("Standard error field", 0, 1, DataType::Unsigned32).with_access(AccessType::ReadOnly))
                .with_member(Variable::new("Standard error field", 0, 2, DataType::Unsigned32).with_access(AccessType::ReadOnly)),
        ).unwrap();
        od.add_object(
            Array::new("Store parameters", 0x1010)
                .with_member(Variable::new("Highest sub-index supported", 0, 0, DataType::Unsigned8)
                    .with_access(AccessType::ReadOnly).with_default(1u8))
                .with_member(Variable::new("Save all parameters", 0, 1, DataType::Unsigned32).with_default(1u32)),
        ).unwrap();
        od.add_object(Variable::new("Producer heartbeat time", 0x1017, 0, DataType::Unsigned16).with_default(0u16)).unwrap();
        od.add_object(Variable::new("Setpoint", 0x2000, 0, DataType::Integer16).with_default(7i16).with_pdo_mappable(true)).unwrap();
        od.add_object(Variable::new("Label", 0x2001, 0, DataType::VisibleString).with_default("abc")).unwrap();
        od.add_object(Variable::new("Status", 0x2002, 0, DataType::Unsigned8).with_access(AccessType::ReadOnly)
            .with_pdo_mappable(true)).unwrap();
        od.add_object(
            Record::new("TPDO1 communication parameter", 0x1800)
                .with_member(Variable::new("COB-ID", 0, 1, DataType::Unsigned32).with_default(0x180u32).with_relative(true))
                .with_member(Variable::new("Transmission type", 0, 2, DataType::Unsigned8).with_default(1u8)),
        ).unwrap();
        od.add_object(
            Record::new("TPDO1 mapping parameter", 0x1A00)
                .with_member(Variable::new("Number of entries", 0, 0, DataType::Unsigned8).with_default(1u8))
                .with_member(Variable::new("Mapping entry 1", 0, 1, DataType::Unsigned32).with_default(0x2000_0010u32))
                .with_member(Variable::new("Mapping entry 2", 0, 2, DataType::Unsigned32).with_default(0u32)),
        ).unwrap();
        Arc::new(od)
    }

    fn setup() -> (Arc<Recorder>, Arc<Network>, Arc<LocalNode>) {
        let recorder = Arc::new(Recorder::default());
        let network = Network::new(recorder.clone());
        let node = LocalNode::new(4, dictionary(), network.clone()).unwrap();
        (recorder, network, node)
    }

    #[test]
    fn test_defaults_and_store() {
        let (_, _, node) = setup();
        assert_eq!(node.read_value(0x2000, 0).unwrap(), Value::Integer(7));
        assert_eq!(node.read_raw(0x2001, 0).unwrap(), b"abc".to_vec());
        assert_eq!(node.read_raw(0x2002, 0).unwrap(), vec![0]);
        node.write_value(0x2000, 0, Value::Integer(-1)).unwrap();
        assert_eq!(node.read_raw(0x2000, 0).unwrap(), vec![0xFF, 0xFF]);
        assert_eq!(node.get_data(0x3000, 0, true).err(), Some(Error::NotFound { index: 0x3000, sub_index: None }));
    }

    #[test]
    fn test_access_checks() {
        let (_, _, node) = setup();
        let err = node.set_data(0x2002, 0, &[1], true).unwrap_err();
        assert_eq!(err.abort_code(), 0x0601_0002);
        node.set_data(0x2002, 0, &[1], false).unwrap();
        let err = node.set_data(0x2000, 0, &[1, 2, 3], true).unwrap_err();
        assert_eq!(err, Error::SizeMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_callbacks() {
        let (_, _, node) = setup();
        node.add_read_callback(|_, var| (var.index() == 0x2002).then(|| vec![0x42]));
        node.add_write_callback(|_, var, data| {
            if var.index() == 0x2000 && data == [0, 0x80] {
                return Err(AbortCode::ValueWrittenTooLow.into());
            }
            Ok(())
        });
        assert_eq!(node.read_raw(0x2002, 0).unwrap(), vec![0x42]);
        assert_eq!(node.write_raw(0x2000, 0, &[0, 0x80]).unwrap_err().abort_code(), 0x0609_0032);
        node.write_raw(0x2000, 0, &[1, 0]).unwrap();
    }

    #[test]
    fn test_mapping_validation() {
        let (_, _, node) = setup();
        let err = node.write_value(0x1A00, 2, Value::Unsigned(0x2001_0008)).unwrap_err();
        assert_eq!(err.abort_code(), 0x0604_0041);
        node.write_value(0x1A00, 2, Value::Unsigned(0x0005_0008)).unwrap();
        node.write_value(0x1A00, 2, Value::Unsigned(0x2002_0008)).unwrap();
        node.write_value(0x1A00, 0, Value::Unsigned(2)).unwrap();
        assert_eq!(node.tpdo().get(1).unwrap().length(), 24);

        node.write_value(0x1A00, 0, Value::Unsigned(0)).unwrap();
        node.write_value(0x1A00, 1, Value::Unsigned(0x2000_0040)).unwrap();
        let err = node.write_value(0x1A00, 0, Value::Unsigned(2)).unwrap_err();
        assert_eq!(err.abort_code(), 0x0604_0042);
    }

    #[test]
    fn test_sync_tpdo() {
        let (recorder, network, node) = setup();
        node.write_value(0x2000, 0, Value::Integer(0x1234)).unwrap();
        network.dispatch(0x80, &[], std::time::Instant::now());
        assert!(recorder.take().iter().all(|f| f.0 != 0x184));

        node.boot().unwrap();
        node.nmt().send_command(NmtCommand::Start).unwrap();
        recorder.take();
        network.dispatch(0x80, &[], std::time::Instant::now());
        assert_eq!(recorder.take(), vec![(0x184, vec![0x34, 0x12])]);
    }

    #[test]
    fn test_emergency_history() {
        let (recorder, _, node) = setup();
        node.trigger_emergency(0x2310, 0x03, &[1, 0]).unwrap();
        node.trigger_emergency(0x8210, 0x11, &[]).unwrap();
        assert_eq!(node.read_value(0x1001, 0).unwrap(), Value::Unsigned(0x11));
        assert_eq!(node.read_value(0x1003, 0).unwrap(), Value::Unsigned(2));
        assert_eq!(node.read_value(0x1003, 1).unwrap(), Value::Unsigned(0x8210));
        assert_eq!(node.read_value(0x1003, 2).unwrap(), Value::Unsigned(0x0001_2310));
        node.trigger_emergency(0x3100, 0x05, &[]).unwrap();
        assert_eq!(node.read_value(0x1003, 0).unwrap(), Value::Unsigned(2));
        assert_eq!(node.read_value(0x1003, 2).unwrap(), Value::Unsigned(0x8210));

        node.clear_emergency().unwrap();
        assert_eq!(node.read_value(0x1001, 0).unwrap(), Value::Unsigned(0));
        let frames = recorder.take();
        assert_eq!(frames[0], (0x84, vec![0x10, 0x23, 0x03, 1, 0, 0, 0, 0]));
        assert_eq!(frames.last().unwrap(), &(0x84, vec![0; 8]));
    }

    #[test]
    fn test_reset_semantics() {
        let (recorder, _, node) = setup();
        node.boot().unwrap();
        node.write_value(0x2000, 0, Value::Integer(100)).unwrap();
        node.write_value(0x1017, 0, Value::Unsigned(50)).unwrap();
        assert!(node.nmt().is_heartbeat_running());

        node.nmt().send_command(NmtCommand::ResetCommunication).unwrap();
        assert_eq!(node.read_value(0x2000, 0).unwrap(), Value::Integer(100));
        assert_eq!(node.read_value(0x1017, 0).unwrap(), Value::Unsigned(0));
        assert!(!node.nmt().is_heartbeat_running());

        node.write_value(0x1010, 1, Value::Unsigned(STORE_MAGIC_CODE as u64)).unwrap();
        node.write_value(0x2000, 0, Value::Integer(5)).unwrap();
        node.nmt().send_command(NmtCommand::ResetNode).unwrap();
        assert_eq!(node.read_value(0x2000, 0).unwrap(), Value::Integer(100));
        assert_eq!(node.nmt().state(), NmtState::PreOperational);

        let err = node.write_value(0x1010, 1, Value::Unsigned(1)).unwrap_err();
        assert_eq!(err.abort_code(), 0x0800_0020);
        assert!(recorder.take().iter().any(|f| f == &(0x704, vec![0])));
    }
}
