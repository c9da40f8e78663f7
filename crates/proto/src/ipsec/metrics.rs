//! Metrics for the negotiation engine
//!
//! Counters for monitoring IKE negotiation health. All metrics use atomic
//! operations and are shared between IKE_SAs by cloning the handle.
//!
//! # Example
//!
//! ```
//! use ikev2d_proto::ipsec::metrics::IpsecMetrics;
//!
//! let metrics = IpsecMetrics::new();
//!
//! metrics.record_handshake_started();
//! metrics.record_ike_sa_established();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.ike_handshakes_total, 1);
//! assert_eq!(snapshot.ike_sa_established, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Engine metrics
///
/// Thread-safe atomic counters. Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct IpsecMetrics {
    /// IKE_SA_INIT exchanges started (either role)
    pub ike_handshakes_total: Arc<AtomicU64>,

    /// Handshakes that did not reach ESTABLISHED
    pub ike_handshake_failures: Arc<AtomicU64>,

    /// IKE_SAs that reached ESTABLISHED
    pub ike_sa_established: Arc<AtomicU64>,

    /// IKE_SAs destroyed
    pub ike_sa_deleted: Arc<AtomicU64>,

    /// IKE_SAs replaced by a rekey
    pub ike_sa_rekeyed: Arc<AtomicU64>,

    /// Request retransmissions
    pub retransmits: Arc<AtomicU64>,

    /// IKE_SAs given up on after the retransmission budget
    pub peer_unreachable: Arc<AtomicU64>,

    /// COOKIE challenges sent
    pub cookie_challenges: Arc<AtomicU64>,

    /// CHILD_SAs installed in the kernel
    pub child_sa_installed: Arc<AtomicU64>,

    /// CHILD_SAs replaced by a rekey
    pub child_sa_rekeyed: Arc<AtomicU64>,

    /// CHILD_SAs removed from the kernel
    pub child_sa_deleted: Arc<AtomicU64>,

    /// NO_PROPOSAL_CHOSEN failures (sent or received)
    pub proposal_negotiation_failed: Arc<AtomicU64>,

    /// TS_UNACCEPTABLE failures (sent or received)
    pub ts_negotiation_failed: Arc<AtomicU64>,

    /// Authentication failures
    pub authentication_failed: Arc<AtomicU64>,

    /// DPD probes started
    pub dpd_checks_total: Arc<AtomicU64>,
}

impl IpsecMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record IKE handshake started
    pub fn record_handshake_started(&self) {
        self.ike_handshakes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE handshake failed
    pub fn record_handshake_failed(&self) {
        self.ike_handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE_SA established
    pub fn record_ike_sa_established(&self) {
        self.ike_sa_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE_SA destroyed
    pub fn record_ike_sa_deleted(&self) {
        self.ike_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record IKE_SA rekeyed
    pub fn record_ike_rekey(&self) {
        self.ike_sa_rekeyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retransmitted request
    pub fn record_retransmit(&self) {
        self.retransmits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a peer declared unreachable
    pub fn record_peer_unreachable(&self) {
        self.peer_unreachable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a COOKIE challenge
    pub fn record_cookie_challenge(&self) {
        self.cookie_challenges.fetch_add(1, Ordering::Relaxed);
    }

    /// Record CHILD_SA installed
    pub fn record_child_sa_installed(&self) {
        self.child_sa_installed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record CHILD_SA rekeyed
    pub fn record_child_rekey(&self) {
        self.child_sa_rekeyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record CHILD_SA deleted
    pub fn record_child_sa_deleted(&self) {
        self.child_sa_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record proposal negotiation failure
    pub fn record_proposal_failed(&self) {
        self.proposal_negotiation_failed
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record traffic selector negotiation failure
    pub fn record_ts_failed(&self) {
        self.ts_negotiation_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record authentication failure
    pub fn record_auth_failed(&self) {
        self.authentication_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record DPD probe
    pub fn record_dpd_check(&self) {
        self.dpd_checks_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    ///
    /// Counters are read individually; the snapshot is not atomic across
    /// fields.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            ike_handshakes_total: load(&self.ike_handshakes_total),
            ike_handshake_failures: load(&self.ike_handshake_failures),
            ike_sa_established: load(&self.ike_sa_established),
            ike_sa_deleted: load(&self.ike_sa_deleted),
            ike_sa_rekeyed: load(&self.ike_sa_rekeyed),
            retransmits: load(&self.retransmits),
            peer_unreachable: load(&self.peer_unreachable),
            cookie_challenges: load(&self.cookie_challenges),
            child_sa_installed: load(&self.child_sa_installed),
            child_sa_rekeyed: load(&self.child_sa_rekeyed),
            child_sa_deleted: load(&self.child_sa_deleted),
            proposal_negotiation_failed: load(&self.proposal_negotiation_failed),
            ts_negotiation_failed: load(&self.ts_negotiation_failed),
            authentication_failed: load(&self.authentication_failed),
            dpd_checks_total: load(&self.dpd_checks_total),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// IKE_SA_INIT exchanges started
    pub ike_handshakes_total: u64,
    /// Handshakes that failed
    pub ike_handshake_failures: u64,
    /// IKE_SAs established
    pub ike_sa_established: u64,
    /// IKE_SAs destroyed
    pub ike_sa_deleted: u64,
    /// IKE_SA rekeys
    pub ike_sa_rekeyed: u64,
    /// Retransmissions
    pub retransmits: u64,
    /// Unreachable peers
    pub peer_unreachable: u64,
    /// COOKIE challenges
    pub cookie_challenges: u64,
    /// CHILD_SAs installed
    pub child_sa_installed: u64,
    /// CHILD_SA rekeys
    pub child_sa_rekeyed: u64,
    /// CHILD_SAs deleted
    pub child_sa_deleted: u64,
    /// Proposal failures
    pub proposal_negotiation_failed: u64,
    /// TS failures
    pub ts_negotiation_failed: u64,
    /// Authentication failures
    pub authentication_failed: u64,
    /// DPD probes
    pub dpd_checks_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = IpsecMetrics::new();
        let other = metrics.clone();

        metrics.record_retransmit();
        other.record_retransmit();
        other.record_child_sa_installed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retransmits, 2);
        assert_eq!(snapshot.child_sa_installed, 1);
        assert_eq!(snapshot.child_sa_deleted, 0);
    }

    #[test]
    fn test_negotiation_failure_counters() {
        let metrics = IpsecMetrics::new();
        metrics.record_proposal_failed();
        metrics.record_ts_failed();
        metrics.record_auth_failed();
        metrics.record_handshake_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.proposal_negotiation_failed, 1);
        assert_eq!(snapshot.ts_negotiation_failed, 1);
        assert_eq!(snapshot.authentication_failed, 1);
        assert_eq!(snapshot.ike_handshake_failures, 1);
    }
}
