use std::time::Duration;

/// Timing of the SDO client.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdoConfig {
    /// Max time to wait for a response from the server.
    pub response_timeout: Duration,
    /// Resends of an unanswered request before giving up.
    pub max_retries: u32,
    /// Delay before retrying a request the transport failed to send.
    pub retry_delay: Duration,
    /// Pause before every request, for slow devices.
    pub pause_before_send: Duration,
}

impl Default for SdoConfig {
    fn default() -> Self {
        SdoConfig {
            response_timeout: Duration::from_millis(500),
            max_retries: 1,
            retry_delay: Duration::from_millis(100),
            pause_before_send: Duration::ZERO,
        }
    }
}

impl SdoConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_pause_before_send(mut self, pause: Duration) -> Self {
        self.pause_before_send = pause;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmtConfig {
    /// Default wait used by `wait_for_heartbeat` / `wait_for_bootup` helpers.
    pub heartbeat_timeout: Duration,
}

impl Default for NmtConfig {
    fn default() -> Self {
        NmtConfig { heartbeat_timeout: Duration::from_secs(10) }
    }
}

impl NmtConfig {
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

/// Timeouts of the CiA-402 state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cia402Config {
    pub reset_fault: Duration,
    pub switch_op_mode: Duration,
    pub switch_state_final: Duration,
    pub switch_state_single: Duration,
    pub check_tpdo: Duration,
    pub homing: Duration,
    pub poll_interval: Duration,
}

impl Default for Cia402Config {
    fn default() -> Self {
        Cia402Config {
            reset_fault: Duration::from_millis(400),
            switch_op_mode: Duration::from_millis(500),
            switch_state_final: Duration::from_millis(800),
            switch_state_single: Duration::from_millis(400),
            check_tpdo: Duration::from_millis(200),
            homing: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl Cia402Config {
    pub fn with_switch_state_final(mut self, timeout: Duration) -> Self {
        self.switch_state_final = timeout;
        self
    }

    pub fn with_switch_state_single(mut self, timeout: Duration) -> Self {
        self.switch_state_single = timeout;
        self
    }

    pub fn with_switch_op_mode(mut self, timeout: Duration) -> Self {
        self.switch_op_mode = timeout;
        self
    }

    pub fn with_homing(mut self, timeout: Duration) -> Self {
        self.homing = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Field order of a 32-bit PDO mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdoMappingLayout {
    /// `index << 16 | subindex << 8 | bit length`
    #[default]
    Standard,
    /// `bit length << 24 | subindex << 16 | index`, used by Curtis controllers.
    Curtis,
}

impl PdoMappingLayout {
    /// Split a mapping entry into (index, subindex, bit length).
    pub fn decode(&self, value: u32) -> (u16, u8, usize) {
        match self {
            PdoMappingLayout::Standard => {
                ((value >> 16) as u16, ((value >> 8) & 0xFF) as u8, (value & 0x7F) as usize)
            }
            PdoMappingLayout::Curtis => {
                ((value & 0xFFFF) as u16, ((value >> 16) & 0xFF) as u8, ((value >> 24) & 0x7F) as usize)
            }
        }
    }

    pub fn encode(&self, index: u16, sub_index: u8, bits: usize) -> u32 {
        let bits = (bits & 0xFF) as u32;
        match self {
            PdoMappingLayout::Standard => (index as u32) << 16 | (sub_index as u32) << 8 | bits,
            PdoMappingLayout::Curtis => bits << 24 | (sub_index as u32) << 16 | index as u32,
        }
    }
}

/// Settings shared by local and remote nodes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct NodeConfig {
    pub sdo: SdoConfig,
    pub nmt: NmtConfig,
    pub pdo_layout: PdoMappingLayout,
}

impl NodeConfig {
    pub fn with_sdo(mut self, sdo: SdoConfig) -> Self {
        self.sdo = sdo;
        self
    }

    pub fn with_nmt(mut self, nmt: NmtConfig) -> Self {
        self.nmt = nmt;
        self
    }

    pub fn with_pdo_layout(mut self, layout: PdoMappingLayout) -> Self {
        self.pdo_layout = layout;
        self
    }
}
