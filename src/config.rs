use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailurePolicy;
use crate::fabric::ConnParams;

/// Runtime knobs for the engines.
///
/// Layout-affecting parameters (ring capacity, slot capacity) are compile-time
/// constants instead, since both sides of a region must agree on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Period of the moderation timer while an engine is in polling mode.
    pub poll_interval: Duration,

    /// Consecutive idle polls before falling back to doorbell-driven wake-up.
    pub poll_retry: u32,

    /// Maximum TX descriptors taken from the ring per poll.
    pub tx_budget: usize,

    /// Completed receives accumulated before the guest is notified early.
    pub rx_budget: usize,

    /// Cores to pin the RX engine, TX engine, and slot assigner to.
    pub rx_cpu: Option<usize>,
    pub tx_cpu: Option<usize>,
    pub assign_cpu: Option<usize>,

    /// What to do when a session fails.
    pub failure_policy: FailurePolicy,

    /// How long an initiator waits for the peer to accept, and an acceptor
    /// for the initiator to confirm.
    pub connect_timeout: Duration,

    /// UDP port of the connection manager.
    pub listen_port: u16,

    /// Tenant identifier of the multicast variant; selects the multicast
    /// group and the Q_Key.
    pub tenant_id: u32,

    /// Largest frame carried by an RDMA write. TX frames above it are
    /// dropped, receive buffers below it are not granted, and connect
    /// requests announcing more are refused.
    pub max_frame: u32,
}

impl Config {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_nanos(50_000);
    pub const DEFAULT_POLL_RETRY: u32 = 1000;
    pub const DEFAULT_TX_BUDGET: usize = 4096;
    pub const DEFAULT_RX_BUDGET: usize = 128;
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const DEFAULT_LISTEN_PORT: u16 = 12345;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            poll_retry: Self::DEFAULT_POLL_RETRY,
            tx_budget: Self::DEFAULT_TX_BUDGET,
            rx_budget: Self::DEFAULT_RX_BUDGET,
            rx_cpu: None,
            tx_cpu: None,
            assign_cpu: None,
            failure_policy: FailurePolicy::default(),
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            listen_port: Self::DEFAULT_LISTEN_PORT,
            tenant_id: 0,
            max_frame: ConnParams::DEFAULT_MAX_FRAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.poll_interval, Duration::from_micros(50));
        assert_eq!(cfg.poll_retry, 1000);
        assert_eq!(cfg.tx_budget, 4096);
        assert_eq!(cfg.rx_budget, 128);
        assert_eq!(cfg.failure_policy, FailurePolicy::TearDownSession);
        assert_eq!(cfg.listen_port, 12345);
        assert_eq!(cfg.max_frame, 2048);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        #[derive(Serialize)]
        struct Partial {
            poll_retry: u32,
            tenant_id: u32,
        }
        let bytes = rmp_serde::to_vec_named(&Partial {
            poll_retry: 7,
            tenant_id: 3,
        })
        .unwrap();
        let cfg: Config = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(cfg.poll_retry, 7);
        assert_eq!(cfg.tenant_id, 3);
        assert_eq!(cfg.tx_budget, Config::DEFAULT_TX_BUDGET);
    }
}
