//! Tunables for the control channel, queue sizing and chip capabilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WQE placement mode for send queues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WqeMode {
    /// Every WQE occupies the maximum slot count
    Static,
    /// WQEs occupy only the slots their payload needs
    Variable,
}

/// Control channel (RCFW) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RcfwConfig {
    /// Command ring depth in 16-byte slots (power of two)
    pub cmdq_depth: u32,
    /// Event ring depth in 16-byte entries (power of two)
    pub creq_depth: u32,
    /// Timeout for interrupt-driven and self-polled waits
    pub cmd_timeout_ms: u64,
    /// Absolute ceiling for blocking (spinning) waits
    pub blocking_ceiling_ms: u64,
    /// Consecutive no-progress timeouts before the channel is declared stalled
    pub stall_threshold: u32,
    /// Cap on unacknowledged non-blocking commands
    pub non_blocking_shadow_qd: u32,
    /// How long a non-blocking submitter waits for room under that cap
    pub admission_timeout_ms: u64,
    /// Sleep between self-polling passes
    pub poll_interval_us: u64,
    /// Interval at which interrupt waiters service the event ring themselves
    pub nudge_interval_ms: u64,
    /// Event ring is serviced from an interrupt callback
    pub use_interrupts: bool,
}

impl Default for RcfwConfig {
    fn default() -> Self {
        Self {
            cmdq_depth: 256,
            creq_depth: 256,
            cmd_timeout_ms: 20_000,
            blocking_ceiling_ms: 5_000,
            stall_threshold: 3,
            non_blocking_shadow_qd: 64,
            admission_timeout_ms: 20_000,
            poll_interval_us: 50,
            nudge_interval_ms: 100,
            use_interrupts: true,
        }
    }
}

impl RcfwConfig {
    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_millis(self.cmd_timeout_ms)
    }

    pub fn blocking_ceiling(&self) -> Duration {
        Duration::from_millis(self.blocking_ceiling_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn nudge_interval(&self) -> Duration {
        Duration::from_millis(self.nudge_interval_ms)
    }
}

/// Data-path queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub wqe_mode: WqeMode,
    /// Slots kept free on every send queue beyond what a WQE needs
    pub sq_headroom_slots: u32,
    /// Largest inline payload accepted by post_send
    pub max_inline: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            wqe_mode: WqeMode::Variable,
            sq_headroom_slots: 0,
            max_inline: 96,
        }
    }
}

/// Capabilities that depend on the silicon revision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChipCaps {
    /// Newer silicon; older parts need the phantom-completion workaround
    pub modern_silicon: bool,
    /// Hardware retransmission: MSN table replaces the PSN search table
    pub hw_retransmission: bool,
}

impl Default for ChipCaps {
    fn default() -> Self {
        Self {
            modern_silicon: true,
            hw_retransmission: false,
        }
    }
}

impl ChipCaps {
    pub fn needs_phantom_workaround(&self) -> bool {
        !self.modern_silicon
    }
}

/// Top-level library configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QplibConfig {
    pub rcfw: RcfwConfig,
    pub queues: QueueConfig,
    pub caps: ChipCaps,
    /// Threads delivering deferred completion notifications
    pub worker_threads: usize,
    /// Reference table capacity per resource class
    pub max_qp: u32,
    pub max_cq: u32,
    pub max_srq: u32,
}

impl QplibConfig {
    /// Defaults with sane resource limits filled in
    pub fn new() -> Self {
        Self {
            worker_threads: 2,
            max_qp: 1024,
            max_cq: 1024,
            max_srq: 256,
            ..Default::default()
        }
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.worker_threads == 0 {
            self.worker_threads = 2;
        }
        if self.max_qp == 0 {
            self.max_qp = 1024;
        }
        if self.max_cq == 0 {
            self.max_cq = 1024;
        }
        if self.max_srq == 0 {
            self.max_srq = 256;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcfw_config_default() {
        let config = RcfwConfig::default();
        assert_eq!(config.cmdq_depth, 256);
        assert_eq!(config.non_blocking_shadow_qd, 64);
        assert_eq!(config.stall_threshold, 3);
        assert_eq!(config.cmd_timeout(), Duration::from_secs(20));
        assert_eq!(config.admission_timeout(), config.cmd_timeout());
        assert!(config.use_interrupts);
    }

    #[test]
    fn test_caps_gate_phantom_workaround() {
        let modern = ChipCaps::default();
        assert!(!modern.needs_phantom_workaround());

        let legacy = ChipCaps {
            modern_silicon: false,
            ..Default::default()
        };
        assert!(legacy.needs_phantom_workaround());
    }

    #[test]
    fn test_normalized_fills_zeroes() {
        let config = QplibConfig::default().normalized();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.max_qp, 1024);
        assert_eq!(config.max_srq, 256);

        let custom = QplibConfig {
            max_qp: 16,
            ..QplibConfig::new()
        }
        .normalized();
        assert_eq!(custom.max_qp, 16);
    }
}
