use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;

use crate::config::NmtConfig;
use crate::constant::{COB_FUNC_HEARTBEAT, COB_FUNC_NMT};
use crate::error::{Error, Result};
use crate::network::{Network, PeriodicTask, SubscriptionId};
use crate::prelude::*;
use crate::{debug, info, warn};

/// Coarse operating state of a node, encoded as in heartbeat frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmtState {
    Initialising = 0,
    Stopped = 4,
    Operational = 5,
    Sleep = 80,
    Standby = 96,
    PreOperational = 127,
}

impl NmtState {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(NmtState::Initialising),
            4 => Some(NmtState::Stopped),
            5 => Some(NmtState::Operational),
            80 => Some(NmtState::Sleep),
            96 => Some(NmtState::Standby),
            127 => Some(NmtState::PreOperational),
            _ => None,
        }
    }

    /// Command that moves a node into this state.
    pub fn command(&self) -> NmtCommand {
        match self {
            NmtState::Initialising => NmtCommand::ResetNode,
            NmtState::Stopped => NmtCommand::Stop,
            NmtState::Operational => NmtCommand::Start,
            NmtState::Sleep => NmtCommand::Sleep,
            NmtState::Standby => NmtCommand::Standby,
            NmtState::PreOperational => NmtCommand::EnterPreOperational,
        }
    }
}

impl fmt::Display for NmtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NmtState::Initialising => "INITIALISING",
            NmtState::Stopped => "STOPPED",
            NmtState::Operational => "OPERATIONAL",
            NmtState::Sleep => "SLEEP",
            NmtState::Standby => "STANDBY",
            NmtState::PreOperational => "PRE-OPERATIONAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    Sleep = 0x50,
    Standby = 0x60,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl NmtCommand {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(NmtCommand::Start),
            0x02 => Some(NmtCommand::Stop),
            0x50 => Some(NmtCommand::Sleep),
            0x60 => Some(NmtCommand::Standby),
            0x80 => Some(NmtCommand::EnterPreOperational),
            0x81 => Some(NmtCommand::ResetNode),
            0x82 => Some(NmtCommand::ResetCommunication),
            _ => None,
        }
    }

    /// State a node is in right after executing the command.
    pub fn target_state(&self) -> NmtState {
        match self {
            NmtCommand::Start => NmtState::Operational,
            NmtCommand::Stop => NmtState::Stopped,
            NmtCommand::Sleep => NmtState::Sleep,
            NmtCommand::Standby => NmtState::Standby,
            NmtCommand::EnterPreOperational => NmtState::PreOperational,
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => NmtState::Initialising,
        }
    }
}

pub type HeartbeatCallback = Arc<dyn Fn(NmtState) + Send + Sync>;

#[derive(Debug, Default)]
struct Tracked {
    state: Option<NmtState>,
    timestamp: Option<Instant>,
    heartbeats: u64,
    bootups: u64,
}

/// NMT master side for one remote node.
///
/// Tracks the node's state from sent commands and received heartbeats.
pub struct NmtMaster {
    node_id: u8,
    network: Arc<Network>,
    config: NmtConfig,
    tracked: Mutex<Tracked>,
    heartbeat: Condvar,
    callbacks: Mutex<Vec<HeartbeatCallback>>,
    guarding: Mutex<Option<PeriodicTask>>,
    subscription: SubscriptionId,
}

impl NmtMaster {
    pub fn new(node_id: u8, network: Arc<Network>) -> Arc<Self> {
        Self::with_config(node_id, network, NmtConfig::default())
    }

    pub fn with_config(node_id: u8, network: Arc<Network>, config: NmtConfig) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<NmtMaster>| {
            let me = me.clone();
            let subscription = network.subscribe(COB_FUNC_HEARTBEAT + node_id as u32, move |_, data, ts| {
                if let Some(master) = me.upgrade() {
                    master.on_heartbeat(data, ts);
                }
            });
            NmtMaster {
                node_id,
                network: network.clone(),
                config,
                tracked: Mutex::new(Tracked::default()),
                heartbeat: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
                guarding: Mutex::new(None),
                subscription,
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    /// Last known state, `None` before any command or heartbeat.
    pub fn state(&self) -> Option<NmtState> {
        self.lock().state
    }

    /// Reception time of the last heartbeat.
    pub fn timestamp(&self) -> Option<Instant> {
        self.lock().timestamp
    }

    pub fn on_heartbeat(&self, data: &[u8], timestamp: Instant) {
        let Some(&byte) = data.first() else {
            warn!("Empty heartbeat from node {}", self.node_id);
            return;
        };
        let code = byte & 0x7F;
        let state = if code == 0 {
            info!("Received boot-up message from node {}", self.node_id);
            NmtState::PreOperational
        } else {
            match NmtState::from_code(code) {
                Some(state) => state,
                None => {
                    warn!("Unknown NMT state {} in heartbeat of node {}", code, self.node_id);
                    return;
                }
            }
        };
        {
            let mut tracked = self.lock();
            if tracked.state != Some(state) {
                debug!("Node {} changed NMT state to {}", self.node_id, state);
            }
            tracked.state = Some(state);
            tracked.timestamp = Some(timestamp);
            tracked.heartbeats += 1;
            if code == 0 {
                tracked.bootups += 1;
            }
            self.heartbeat.notify_all();
        }
        let callbacks: Vec<HeartbeatCallback> = match self.callbacks.lock() {
            Ok(callbacks) => callbacks.clone(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(state);
        }
    }

    /// Send an NMT command to this node and assume it is executed.
    ///
    /// The assumed state is recorded before sending, so a boot-up or
    /// heartbeat answering the command overrides it.
    pub fn send_command(&self, command: NmtCommand) -> Result<()> {
        info!("Sending NMT command {:?} ({:#04x}) to node {}", command, command.code(), self.node_id);
        self.lock().state = Some(command.target_state());
        self.network.send_message(COB_FUNC_NMT, &[command.code(), self.node_id])
    }

    pub fn set_state(&self, state: NmtState) -> Result<()> {
        self.send_command(state.command())
    }

    /// Block until the next heartbeat and return the state it carries.
    pub fn wait_for_heartbeat(&self, timeout: Duration) -> Result<NmtState> {
        let tracked = self.lock();
        let seen = tracked.heartbeats;
        let (tracked, _) = self
            .heartbeat
            .wait_timeout_while(tracked, timeout, |t| t.heartbeats == seen)
            .unwrap_or_else(|e| e.into_inner());
        match tracked.state {
            Some(state) if tracked.heartbeats != seen => Ok(state),
            _ => Err(Error::NoHeartbeat),
        }
    }

    /// Block until the node sends a boot-up message.
    pub fn wait_for_bootup(&self, timeout: Duration) -> Result<()> {
        let tracked = self.lock();
        let seen = tracked.bootups;
        let (tracked, _) = self
            .heartbeat
            .wait_timeout_while(tracked, timeout, |t| t.bootups == seen)
            .unwrap_or_else(|e| e.into_inner());
        if tracked.bootups != seen {
            Ok(())
        } else {
            Err(Error::NoHeartbeat)
        }
    }

    /// `wait_for_heartbeat` with the configured timeout.
    pub fn wait_for_heartbeat_default(&self) -> Result<NmtState> {
        self.wait_for_heartbeat(self.config.heartbeat_timeout)
    }

    pub fn add_heartbeat_callback<F>(&self, callback: F)
    where
        F: Fn(NmtState) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.push(Arc::new(callback));
        }
    }

    /// Poll the node with remote frames on its heartbeat identifier.
    pub fn start_node_guarding(&self, period: Duration) {
        let task = self.network.send_periodic(COB_FUNC_HEARTBEAT + self.node_id as u32, &[0], period, true);
        if let Ok(mut guarding) = self.guarding.lock() {
            if let Some(mut old) = guarding.replace(task) {
                old.stop();
            }
        }
    }

    pub fn stop_node_guarding(&self) {
        let task = self.guarding.lock().ok().and_then(|mut g| g.take());
        if let Some(mut task) = task {
            task.stop();
        }
    }
}

impl Drop for NmtMaster {
    fn drop(&mut self) {
        self.stop_node_guarding();
        self.network.unsubscribe(COB_FUNC_HEARTBEAT + self.node_id as u32, self.subscription);
    }
}

pub type StateListener = Arc<dyn Fn(NmtState, NmtState) + Send + Sync>;
pub type ResetListener = Arc<dyn Fn(NmtCommand) + Send + Sync>;

/// NMT slave side of a local node.
///
/// Executes commands addressed to its node id or broadcast and produces the
/// heartbeat. A reset runs the reset listeners, sends the boot-up message
/// and ends in PRE-OPERATIONAL.
pub struct NmtSlave {
    node_id: u8,
    network: Arc<Network>,
    state: AtomicCell<NmtState>,
    heartbeat_time: AtomicCell<u16>,
    heartbeat: Mutex<Option<PeriodicTask>>,
    transition: Mutex<()>,
    state_listeners: Mutex<Vec<StateListener>>,
    reset_listeners: Mutex<Vec<ResetListener>>,
}

impl NmtSlave {
    pub fn new(node_id: u8, network: Arc<Network>) -> Self {
        NmtSlave {
            node_id,
            network,
            state: AtomicCell::new(NmtState::Initialising),
            heartbeat_time: AtomicCell::new(0),
            heartbeat: Mutex::new(None),
            transition: Mutex::new(()),
            state_listeners: Mutex::new(Vec::new()),
            reset_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> NmtState {
        self.state.load()
    }

    /// Producer heartbeat time in ms, 0 when disabled.
    pub fn heartbeat_time(&self) -> u16 {
        self.heartbeat_time.load()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat.lock().map_or(false, |t| t.is_some())
    }

    pub fn add_state_listener<F>(&self, listener: F)
    where
        F: Fn(NmtState, NmtState) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.state_listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    pub fn add_reset_listener<F>(&self, listener: F)
    where
        F: Fn(NmtCommand) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.reset_listeners.lock() {
            listeners.push(Arc::new(listener));
        }
    }

    /// Handle a frame received on the NMT identifier.
    pub fn on_command(&self, data: &[u8]) {
        if data.len() < 2 {
            warn!("Dropping malformed NMT frame {:02x?}", data);
            return;
        }
        let (code, target) = (data[0], data[1]);
        if target != 0 && target != self.node_id {
            return;
        }
        match NmtCommand::from_code(code) {
            Some(command) => {
                if let Err(e) = self.send_command(command) {
                    warn!("NMT command {:?} failed on node {}: {}", command, self.node_id, e);
                }
            }
            None => warn!("Unknown NMT command {:#04x}", code),
        }
    }

    /// Execute a command locally.
    pub fn send_command(&self, command: NmtCommand) -> Result<()> {
        let _guard = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.state.load();
        match command {
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => {
                info!("NMT: node {} executing {:?}", self.node_id, command);
                self.stop_heartbeat();
                self.change_state(old, NmtState::Initialising);
                let listeners: Vec<ResetListener> =
                    self.reset_listeners.lock().map(|l| l.clone()).unwrap_or_default();
                for listener in listeners {
                    listener(command);
                }
                self.enter_pre_operational()
            }
            NmtCommand::Stop if old == NmtState::Initialising => {
                debug!("Ignoring STOP while initialising");
                Ok(())
            }
            _ => {
                let new = command.target_state();
                self.change_state(old, new);
                self.update_heartbeat();
                Ok(())
            }
        }
    }

    pub fn set_state(&self, state: NmtState) -> Result<()> {
        self.send_command(state.command())
    }

    /// Leave INITIALISING after power-on: send boot-up and enter PRE-OPERATIONAL.
    pub fn boot(&self) -> Result<()> {
        let _guard = self.transition.lock().unwrap_or_else(|e| e.into_inner());
        if self.state.load() != NmtState::Initialising {
            return Ok(());
        }
        self.enter_pre_operational()
    }

    fn enter_pre_operational(&self) -> Result<()> {
        info!("Sending boot-up message of node {}", self.node_id);
        self.network.send_message(COB_FUNC_HEARTBEAT + self.node_id as u32, &[0])?;
        self.change_state(NmtState::Initialising, NmtState::PreOperational);
        self.start_heartbeat(self.heartbeat_time.load());
        Ok(())
    }

    fn change_state(&self, old: NmtState, new: NmtState) {
        self.state.store(new);
        if old == new {
            return;
        }
        info!("NMT: node {} changed state from {} to {}", self.node_id, old, new);
        let listeners: Vec<StateListener> = self.state_listeners.lock().map(|l| l.clone()).unwrap_or_default();
        for listener in listeners {
            listener(old, new);
        }
    }

    /// (Re)start the heartbeat producer. A time of 0 disables it.
    pub fn start_heartbeat(&self, time_ms: u16) {
        self.heartbeat_time.store(time_ms);
        self.stop_heartbeat();
        if time_ms == 0 {
            return;
        }
        info!("Starting heartbeat of node {} every {} ms", self.node_id, time_ms);
        let task = self.network.send_periodic(
            COB_FUNC_HEARTBEAT + self.node_id as u32,
            &[self.state.load().code()],
            Duration::from_millis(time_ms as u64),
            false,
        );
        if let Ok(mut heartbeat) = self.heartbeat.lock() {
            *heartbeat = Some(task);
        }
    }

    pub fn stop_heartbeat(&self) {
        let task = self.heartbeat.lock().ok().and_then(|mut h| h.take());
        if let Some(mut task) = task {
            task.stop();
        }
    }

    /// Apply a new producer heartbeat time written at runtime.
    pub fn set_heartbeat_time(&self, time_ms: u16) {
        if self.state.load() == NmtState::Initialising {
            self.heartbeat_time.store(time_ms);
        } else {
            self.start_heartbeat(time_ms);
        }
    }

    fn update_heartbeat(&self) {
        if let Ok(heartbeat) = self.heartbeat.lock() {
            if let Some(task) = heartbeat.as_ref() {
                task.update(&[self.state.load().code()]);
            }
        }
    }
}

impl Drop for NmtSlave {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

impl Debug for NmtSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NmtSlave")
            .field("node_id", &self.node_id)
            .field("state", &self.state.load())
            .field("heartbeat_time", &self.heartbeat_time.load())
            .finish()
    }
}
