//! Dead Peer Detection (DPD)
//!
//! Liveness checking with empty INFORMATIONAL exchanges (RFC 7296 Section
//! 2.4).
//!
//! # Algorithm
//!
//! 1. **Idle tracking**: every authenticated message from the peer counts as
//!    activity
//! 2. **Probe**: once the SA has been idle for `interval`, an empty
//!    INFORMATIONAL request is queued
//! 3. **Retry**: the probe is retransmitted every `timeout`, up to
//!    `max_retries` times
//! 4. **Dead declaration**: an unanswered probe destroys the IKE_SA
//!
//! ```text
//! Time:  0s       30s      40s      50s      60s
//!        |--------|--------|--------|--------|
//!        traffic  Probe    Retry    Retry    Dead
//!
//! Config: interval=30s, timeout=10s, max_retries=3
//! ```

use std::time::{Duration, Instant};

use crate::ipsec::config::RetransmitConfig;

/// Default DPD check interval (30 seconds)
pub const DEFAULT_DPD_INTERVAL: Duration = Duration::from_secs(30);

/// Default DPD response timeout (10 seconds)
pub const DEFAULT_DPD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum retry attempts (3 times)
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// DPD Configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpdConfig {
    /// Enable DPD
    pub enabled: bool,

    /// Idle time after which a probe is sent
    pub interval: Duration,

    /// Time to wait for each probe response
    pub timeout: Duration,

    /// Probe retransmissions before the peer is declared dead
    pub max_retries: u32,
}

impl Default for DpdConfig {
    fn default() -> Self {
        DpdConfig {
            enabled: true,
            interval: DEFAULT_DPD_INTERVAL,
            timeout: DEFAULT_DPD_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DpdConfig {
    /// Create new DPD configuration
    pub fn new(enabled: bool, interval: Duration, timeout: Duration, max_retries: u32) -> Self {
        DpdConfig {
            enabled,
            interval,
            timeout,
            max_retries,
        }
    }

    /// Create disabled DPD configuration
    pub fn disabled() -> Self {
        DpdConfig {
            enabled: false,
            ..DpdConfig::default()
        }
    }

    /// Retransmission policy for probe exchanges: a flat `timeout` between
    /// attempts
    pub fn retransmit_policy(&self) -> RetransmitConfig {
        RetransmitConfig {
            timeout: self.timeout,
            base: 1.0,
            tries: self.max_retries,
            max_interval: None,
        }
    }
}

/// Per-IKE_SA liveness bookkeeping
#[derive(Debug, Clone)]
pub struct DpdState {
    last_activity: Instant,
    probes_sent: u64,
}

impl Default for DpdState {
    fn default() -> Self {
        Self::new()
    }
}

impl DpdState {
    /// Start tracking with activity "now"
    pub fn new() -> Self {
        DpdState {
            last_activity: Instant::now(),
            probes_sent: 0,
        }
    }

    /// Record an authenticated message from the peer
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the peer was last heard from
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// `None` if a probe is due now, otherwise how long until one is
    pub fn next_probe_delay(&self, config: &DpdConfig) -> Option<Duration> {
        let idle = self.idle_for();
        if idle >= config.interval {
            None
        } else {
            Some(config.interval - idle)
        }
    }

    /// Count a probe
    pub fn mark_probe(&mut self) {
        self.probes_sent += 1;
    }

    /// Probes sent over the lifetime of the SA
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpd_config_default() {
        let config = DpdConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval, DEFAULT_DPD_INTERVAL);
        assert_eq!(config.timeout, DEFAULT_DPD_TIMEOUT);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn test_dpd_config_disabled() {
        let config = DpdConfig::disabled();
        assert!(!config.enabled);
        assert_eq!(config.interval, DEFAULT_DPD_INTERVAL);
    }

    #[test]
    fn test_probe_policy_is_flat() {
        let config = DpdConfig::new(true, Duration::from_secs(30), Duration::from_secs(5), 2);
        let policy = config.retransmit_policy();
        assert_eq!(policy.tries, 2);
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(5));
    }

    #[test]
    fn test_probe_not_due_after_activity() {
        let config = DpdConfig::default();
        let mut state = DpdState::new();
        state.record_activity();

        let delay = state.next_probe_delay(&config).unwrap();
        assert!(delay <= DEFAULT_DPD_INTERVAL);
        assert!(delay > Duration::from_secs(25));
    }

    #[test]
    fn test_probe_due_with_zero_interval() {
        let config = DpdConfig::new(true, Duration::ZERO, Duration::from_secs(1), 1);
        let mut state = DpdState::new();
        assert!(state.next_probe_delay(&config).is_none());

        state.mark_probe();
        assert_eq!(state.probes_sent(), 1);
    }
}
