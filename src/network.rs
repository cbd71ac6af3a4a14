use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use crossbeam::select;
use embedded_can::nb::Can;
use embedded_can::Frame;

use crate::error::{Result, TransportError};
use crate::prelude::*;
use crate::util::{create_frame, create_remote_frame, get_cob_id};
use crate::{debug, error};

/// Outbound half of a CAN interface.
pub trait Transport: Send + Sync {
    /// Send one frame. For remote frames the length of `data` is the DLC.
    fn send(&self, cob_id: u32, data: &[u8], is_remote: bool) -> core::result::Result<(), TransportError>;
}

/// Callback invoked with (COB-ID, data, reception time).
pub type MessageCallback = Arc<dyn Fn(u32, &[u8], Instant) + Send + Sync>;

/// Handle returned by [`Network::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Demultiplexer between one transport and the protocol services.
pub struct Network {
    transport: Arc<dyn Transport>,
    subscribers: RwLock<HashMap<u32, Vec<(SubscriptionId, MessageCallback)>>>,
    next_subscription: AtomicU64,
}

impl Network {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Network {
            transport,
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn subscribe<F>(&self, cob_id: u32, callback: F) -> SubscriptionId
    where
        F: Fn(u32, &[u8], Instant) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subs) = self.subscribers.write() {
            subs.entry(cob_id).or_default().push((id, Arc::new(callback)));
        }
        id
    }

    pub fn unsubscribe(&self, cob_id: u32, id: SubscriptionId) {
        if let Ok(mut subs) = self.subscribers.write() {
            if let Some(list) = subs.get_mut(&cob_id) {
                list.retain(|(sid, _)| *sid != id);
                if list.is_empty() {
                    subs.remove(&cob_id);
                }
            }
        }
    }

    /// Deliver a received frame to every subscriber of its identifier.
    ///
    /// Callbacks run after the subscription table lock is released, so they
    /// may subscribe, unsubscribe or send.
    pub fn dispatch(&self, cob_id: u32, data: &[u8], timestamp: Instant) {
        let callbacks: Vec<MessageCallback> = match self.subscribers.read() {
            Ok(subs) => match subs.get(&cob_id) {
                Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
                None => return,
            },
            Err(_) => {
                error!("Subscription table poisoned, dropping frame {:#x}", cob_id);
                return;
            }
        };
        debug!("Dispatching {:#x} {:02x?} to {} subscriber(s)", cob_id, data, callbacks.len());
        for callback in callbacks {
            callback(cob_id, data, timestamp);
        }
    }

    pub fn send_message(&self, cob_id: u32, data: &[u8]) -> Result<()> {
        debug!("Sending {:#x} {:02x?}", cob_id, data);
        self.transport.send(cob_id, data, false)?;
        Ok(())
    }

    pub fn send_remote(&self, cob_id: u32, dlc: usize) -> Result<()> {
        self.transport.send(cob_id, &vec![0; dlc], true)?;
        Ok(())
    }

    /// Start sending `data` every `period`, beginning immediately.
    pub fn send_periodic(&self, cob_id: u32, data: &[u8], period: Duration, remote: bool) -> PeriodicTask {
        PeriodicTask::start(self.transport.clone(), cob_id, data, period, remote)
    }
}

/// Background thread transmitting one frame at a fixed period.
///
/// Once [`stop`](PeriodicTask::stop) returns no further frame is sent.
pub struct PeriodicTask {
    cob_id: u32,
    period: Duration,
    data: Arc<Mutex<Vec<u8>>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    fn start(transport: Arc<dyn Transport>, cob_id: u32, data: &[u8], period: Duration, remote: bool) -> Self {
        let data = Arc::new(Mutex::new(data.to_vec()));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let shared = data.clone();
        let handle = thread::spawn(move || {
            let ticker = channel::tick(period);
            loop {
                let frame = match shared.lock() {
                    Ok(d) => d.clone(),
                    Err(_) => break,
                };
                if let Err(e) = transport.send(cob_id, &frame, remote) {
                    error!("Periodic transmit of {:#x} failed: {}", cob_id, e);
                }
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {}
                }
            }
        });
        PeriodicTask { cob_id, period, data, stop_tx: Some(stop_tx), handle: Some(handle) }
    }

    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Replace the transmitted data without restarting the timer.
    pub fn update(&self, data: &[u8]) {
        if let Ok(mut d) = self.data.lock() {
            d.clear();
            d.extend_from_slice(data);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // Dropping the sender also wakes the thread.
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Periodic task for {:#x} panicked", self.cob_id);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Debug for PeriodicTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("cob_id", &self.cob_id)
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish()
    }
}

/// [`Transport`] over any non-blocking `embedded_can` driver.
pub struct CanBus<C: Can> {
    can: Mutex<C>,
}

impl<C: Can> CanBus<C> where C::Frame: Debug {
    pub fn new(can: C) -> Self {
        CanBus { can: Mutex::new(can) }
    }

    /// Read at most one pending frame and dispatch it.
    ///
    /// Returns `true` when a frame was processed.
    pub fn poll(&self, network: &Network) -> bool {
        let received = match self.can.lock() {
            Ok(mut can) => can.receive(),
            Err(_) => return false,
        };
        match received {
            Ok(frame) => {
                if frame.is_remote_frame() {
                    network.dispatch(get_cob_id(&frame), &[], Instant::now());
                } else {
                    network.dispatch(get_cob_id(&frame), frame.data(), Instant::now());
                }
                true
            }
            Err(nb::Error::WouldBlock) => false,
            Err(nb::Error::Other(err)) => {
                error!("Errors in reading CAN frame, {:?}", err);
                false
            }
        }
    }
}

impl<C> Transport for CanBus<C>
where
    C: Can + Send,
    C::Frame: Debug,
{
    fn send(&self, cob_id: u32, data: &[u8], is_remote: bool) -> core::result::Result<(), TransportError> {
        let frame: C::Frame = if is_remote {
            create_remote_frame(cob_id, data.len())?
        } else {
            create_frame(cob_id, data)?
        };
        let mut can = self.can.lock().map_err(|_| TransportError::Bus("driver lock poisoned".to_string()))?;
        nb::block!(can.transmit(&frame))
            .map(|_| ())
            .map_err(|e| TransportError::Bus(format!("{:?}", e)))
    }
}
