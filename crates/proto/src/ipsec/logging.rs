//! Structured logging for the negotiation engine
//!
//! Contextual events emitted through `tracing`. SPIs are rendered as hex so
//! that log lines can be matched against packet captures.
//!
//! # Log Levels
//!
//! - **TRACE**: message send/receive
//! - **DEBUG**: retransmissions, proposal selection, DPD probes
//! - **INFO**: IKE_SA state transitions, CHILD_SA lifecycle
//! - **WARN**: failed exchanges, cookie challenges, dropped messages
//! - **ERROR**: authentication failures, unreachable peers
//!
//! # Example
//!
//! ```no_run
//! use ikev2d_proto::ipsec::logging;
//!
//! tracing_subscriber::fmt()
//!     .with_env_filter("ikev2d_proto::ipsec=debug")
//!     .init();
//!
//! logging::log_ike_state_transition(&[1; 8], &[2; 8], "CONNECTING", "ESTABLISHED");
//! ```

use std::net::SocketAddr;

use tracing::{debug, error, info, trace, warn};

use super::ikev2::constants::ExchangeType;

/// Log IKE SA state transition
pub fn log_ike_state_transition(spi_i: &[u8], spi_r: &[u8], old_state: &str, new_state: &str) {
    info!(
        ike_spi_i = %hex::encode(spi_i),
        ike_spi_r = %hex::encode(spi_r),
        state_from = old_state,
        state_to = new_state,
        "IKE SA state transition"
    );
}

/// Log an exchange we initiate
pub fn log_exchange_started(spi_i: &[u8], exchange: ExchangeType, message_id: u32) {
    debug!(
        ike_spi_i = %hex::encode(spi_i),
        exchange = %exchange,
        message_id = message_id,
        "Exchange started"
    );
}

/// Log a failed exchange
///
/// # Arguments
///
/// * `exchange` - Exchange that failed
/// * `notify` - Error notify sent or received, if any
/// * `peer_id` - Peer identity, once known
/// * `error` - Error message
pub fn log_exchange_failed(
    spi_i: &[u8],
    exchange: ExchangeType,
    notify: Option<u16>,
    peer_id: Option<&str>,
    error: &str,
) {
    warn!(
        ike_spi_i = %hex::encode(spi_i),
        exchange = %exchange,
        notify = notify,
        peer_id = peer_id,
        error = error,
        "Exchange failed"
    );
}

/// Log a retransmitted request
pub fn log_retransmit(spi_i: &[u8], exchange: ExchangeType, message_id: u32, attempt: u32) {
    debug!(
        ike_spi_i = %hex::encode(spi_i),
        exchange = %exchange,
        message_id = message_id,
        attempt = attempt,
        "Retransmitting request"
    );
}

/// Log the retransmission budget running out
pub fn log_peer_unreachable(spi_i: &[u8], peer_addr: SocketAddr, tries: u32) {
    error!(
        ike_spi_i = %hex::encode(spi_i),
        peer = %peer_addr,
        tries = tries,
        "Peer unreachable, giving up"
    );
}

/// Log a dropped message
pub fn log_message_dropped(peer_addr: SocketAddr, reason: &str) {
    warn!(peer = %peer_addr, reason = reason, "IKE message dropped");
}

/// Log IKE SA rekey completion
pub fn log_ike_rekey_complete(old_spi_i: &[u8], new_spi_i: &[u8], new_spi_r: &[u8]) {
    info!(
        old_spi_i = %hex::encode(old_spi_i),
        new_spi_i = %hex::encode(new_spi_i),
        new_spi_r = %hex::encode(new_spi_r),
        "IKE SA rekey completed successfully"
    );
}

/// Log CHILD_SA installation
pub fn log_child_sa_installed(spi_in: u32, spi_out: u32) {
    info!(
        child_spi_in = %format!("{:08x}", spi_in),
        child_spi_out = %format!("{:08x}", spi_out),
        "Child SA installed"
    );
}

/// Log CHILD_SA rekey completion
pub fn log_child_rekey_complete(old_spi: u32, new_spi: u32) {
    info!(
        old_child_spi = %format!("{:08x}", old_spi),
        new_child_spi = %format!("{:08x}", new_spi),
        "Child SA rekey completed successfully"
    );
}

/// Log CHILD_SA deletion
///
/// # Arguments
///
/// * `child_spi` - Inbound SPI of the CHILD_SA
/// * `reason` - Deletion reason (e.g., "peer delete", "rekeyed", "expired")
pub fn log_child_sa_deleted(child_spi: u32, reason: &str) {
    info!(
        child_spi = %format!("{:08x}", child_spi),
        reason = reason,
        "Child SA deleted"
    );
}

/// Log a COOKIE challenge
pub fn log_cookie_challenge(peer_addr: SocketAddr, half_open: usize) {
    warn!(
        peer = %peer_addr,
        half_open = half_open,
        "Half-open limit reached, demanding cookie"
    );
}

/// Log DPD probe
pub fn log_dpd_probe(spi_i: &[u8], peer_addr: SocketAddr) {
    debug!(
        ike_spi_i = %hex::encode(spi_i),
        peer = %peer_addr,
        "DPD probe"
    );
}

/// Log proposal negotiation
///
/// # Arguments
///
/// * `offered` - Number of proposals offered
/// * `chosen_id` - ID of chosen proposal, or None if no match
pub fn log_proposal_negotiation(offered: usize, chosen_id: Option<u8>) {
    match chosen_id {
        Some(id) => {
            debug!(
                proposals_offered = offered,
                chosen_id = id,
                "Proposal negotiation successful"
            );
        }
        None => {
            warn!(
                proposals_offered = offered,
                "Proposal negotiation failed - no acceptable proposal"
            );
        }
    }
}

/// Log authentication success
pub fn log_authentication_success(peer_id: &str, auth_method: &str) {
    info!(
        peer_id = peer_id,
        auth_method = auth_method,
        "Peer authenticated successfully"
    );
}

/// Log authentication failure
pub fn log_authentication_failed(peer_id: &str, reason: &str) {
    error!(
        peer_id = peer_id,
        reason = reason,
        "Peer authentication failed"
    );
}

/// Log protocol message send
pub fn log_message_send(exchange: ExchangeType, peer_addr: SocketAddr, size_bytes: usize) {
    trace!(
        exchange = %exchange,
        peer = %peer_addr,
        size_bytes = size_bytes,
        "Sending IKE message"
    );
}

/// Log protocol message receive
pub fn log_message_recv(exchange: ExchangeType, peer_addr: SocketAddr, size_bytes: usize) {
    trace!(
        exchange = %exchange,
        peer = %peer_addr,
        size_bytes = size_bytes,
        "Received IKE message"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_functions() {
        let peer: SocketAddr = "192.0.2.1:500".parse().unwrap();

        log_ike_state_transition(&[1; 8], &[2; 8], "CONNECTING", "ESTABLISHED");
        log_exchange_started(&[1; 8], ExchangeType::IkeAuth, 1);
        log_exchange_failed(
            &[1; 8],
            ExchangeType::CreateChildSa,
            Some(14),
            Some("gw.example.com"),
            "no proposal chosen",
        );
        log_exchange_failed(&[1; 8], ExchangeType::IkeSaInit, None, None, "timeout");
        log_retransmit(&[1; 8], ExchangeType::IkeAuth, 1, 2);
        log_peer_unreachable(&[1; 8], peer, 5);
        log_message_dropped(peer, "unexpected message ID");

        log_ike_rekey_complete(&[1; 8], &[3; 8], &[4; 8]);
        log_child_sa_installed(0xc000_0001, 0xd000_0001);
        log_child_rekey_complete(0xc000_0001, 0xc000_0002);
        log_child_sa_deleted(0xc000_0001, "rekeyed");

        log_cookie_challenge(peer, 11);
        log_dpd_probe(&[1; 8], peer);

        log_proposal_negotiation(3, Some(1));
        log_proposal_negotiation(3, None);

        log_authentication_success("gw.example.com", "PSK");
        log_authentication_failed("gw.example.com", "AUTH mismatch");

        log_message_send(ExchangeType::IkeSaInit, peer, 256);
        log_message_recv(ExchangeType::IkeSaInit, peer, 256);
    }
}
