use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::constant::COB_FUNC_SYNC;
use crate::error::{Error, Result};
use crate::network::{Network, PeriodicTask};
use crate::info;

/// Periodic SYNC producer.
pub struct SyncProducer {
    cob_id: u32,
    network: Arc<Network>,
    period: Mutex<Option<Duration>>,
    task: Mutex<Option<PeriodicTask>>,
}

impl SyncProducer {
    pub fn new(network: Arc<Network>) -> Self {
        SyncProducer { cob_id: COB_FUNC_SYNC, network, period: Mutex::new(None), task: Mutex::new(None) }
    }

    pub fn cob_id(&self) -> u32 {
        self.cob_id
    }

    pub fn period(&self) -> Option<Duration> {
        self.period.lock().ok().and_then(|p| *p)
    }

    pub fn set_period(&self, period: Duration) {
        if let Ok(mut p) = self.period.lock() {
            *p = Some(period);
        }
    }

    /// Send one SYNC, with the optional counter byte.
    pub fn transmit(&self, counter: Option<u8>) -> Result<()> {
        match counter {
            Some(c) => self.network.send_message(self.cob_id, &[c]),
            None => self.network.send_message(self.cob_id, &[]),
        }
    }

    /// Start sending SYNC every `period`, or the configured period.
    pub fn start(&self, period: Option<Duration>) -> Result<()> {
        let period = period
            .or_else(|| self.period())
            .filter(|p| !p.is_zero())
            .ok_or_else(|| Error::InvalidValue("a SYNC period must be given".to_string()))?;
        self.set_period(period);
        info!("Starting SYNC every {:?}", period);
        let task = self.network.send_periodic(self.cob_id, &[], period, false);
        let old = self.task.lock().ok().and_then(|mut t| t.replace(task));
        if let Some(mut old) = old {
            old.stop();
        }
        Ok(())
    }

    pub fn stop(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            task.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().map_or(false, |t| t.is_some())
    }
}

impl Drop for SyncProducer {
    fn drop(&mut self) {
        self.stop();
    }
}
