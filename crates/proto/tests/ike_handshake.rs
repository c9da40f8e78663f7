//! IKE_SA_INIT and IKE_AUTH between two in-memory IKE_SAs

#![cfg(feature = "ipsec")]

mod common;

use common::*;
use ikev2d_proto::ipsec::{
    config::{DaemonConfig, DosConfig},
    ike_sa::{DestroyCause, IkeSaState, Timer},
    ikev2::{
        constants::ExchangeType,
        message::{decode_header, IkeMessage},
        proposal::{DhTransformId, EncrTransformId, EsnTransformId, PrfTransformId, Proposal, ProtocolId, Transform},
    },
    kernel::Direction,
    manager::{Admission, IkeSaManager},
    metrics::IpsecMetrics,
    Error,
};

#[test]
fn test_handshake_establishes_one_child() {
    let (alice, bob) = established();

    assert_eq!(alice.sa.state(), IkeSaState::Established);
    assert_eq!(bob.sa.state(), IkeSaState::Established);
    assert_eq!(alice.sa.id().spi_r, bob.sa.id().spi_r);
    assert_eq!(alice.sa.remote_identity(), Some(&bob_id()));
    assert_eq!(bob.sa.remote_identity(), Some(&alice_id()));

    assert_eq!(alice.children(), 1);
    assert_eq!(bob.children(), 1);
    let a = &alice.sa.children()[0];
    let b = &bob.sa.children()[0];
    assert_eq!(a.spi_in, b.spi_out);
    assert_eq!(a.spi_out, b.spi_in);
    assert_eq!(a.local_ts, vec![subnet(1)]);
    assert_eq!(b.local_ts, vec![subnet(2)]);

    assert!(alice.kernel.is_installed(a.spi_in, Direction::Inbound));
    assert!(alice.kernel.is_installed(a.spi_out, Direction::Outbound));
    assert_eq!(bob.kernel.installed_count(), 2);

    // Both directions use the same keys on both ends
    let a_out = alice.kernel.installed(a.spi_out, Direction::Outbound).unwrap();
    let b_in = bob.kernel.installed(b.spi_in, Direction::Inbound).unwrap();
    assert_eq!(&a_out.encr_key[..], &b_in.encr_key[..]);
}

#[test]
fn test_initial_contact_and_timers() {
    let (alice, bob) = established();

    assert_eq!(alice.authenticated, vec![(bob_id(), false)]);
    assert_eq!(bob.authenticated, vec![(alice_id(), true)]);

    for side in [&alice, &bob] {
        assert!(side.timers.contains_key(&Timer::RekeyIke));
        assert!(side.timers.contains_key(&Timer::ExpireIke));
        assert!(!side.timers.contains_key(&Timer::HalfOpenTimeout));
        assert!(!side.timers.contains_key(&Timer::Retransmit));
        let spi = side.sa.children()[0].spi_in;
        assert!(side.timers.contains_key(&Timer::RekeyChild(spi)));
        assert!(side.timers.contains_key(&Timer::ExpireChild(spi)));
    }
}

#[test]
fn test_no_initial_contact_with_existing_sa() {
    // Alice already has an authenticated IKE_SA with Bob
    let manager: IkeSaManager<u32> = IkeSaManager::new(DosConfig::default(), IpsecMetrics::new());
    let existing = manager.allocate_spi().unwrap();
    manager.register(existing, 1, None);
    manager.authenticated(&existing, bob_id(), false);

    let mut alice =
        Side::initiator_with_contacts(alice_config(), DaemonConfig::default(), manager.contacts());
    alice.initiate();
    let init = alice.outbox.front().cloned().unwrap();
    let mut bob = Side::responder(bob_config(), DaemonConfig::default(), &init, None);
    pump(&mut alice, &mut bob);

    assert_eq!(alice.sa.state(), IkeSaState::Established);
    assert_eq!(bob.sa.state(), IkeSaState::Established);
    // Bob must keep his older IKE_SAs with Alice
    assert_eq!(bob.authenticated, vec![(alice_id(), false)]);
}

#[test]
fn test_message_ids_advance() {
    let (mut alice, mut bob) = established();
    assert_eq!(alice.sa.next_message_id(), 2);
    assert_eq!(bob.sa.expected_message_id(), 2);

    alice.command(ikev2d_proto::ipsec::SaCommand::Dpd).unwrap();
    let header = decode_header(alice.outbox.front().unwrap()).unwrap();
    assert_eq!(header.exchange_type, ExchangeType::Informational);
    assert_eq!(header.message_id, 2);
    pump(&mut alice, &mut bob);

    assert_eq!(alice.sa.next_message_id(), 3);
    assert_eq!(bob.sa.expected_message_id(), 3);
    // Bob never initiated
    assert_eq!(bob.sa.next_message_id(), 0);
}

#[test]
fn test_duplicate_ike_auth_replays_cached_response() {
    let (alice, mut bob) = established();
    let auth_request = alice.sent[1].clone();
    let auth_response = bob.sent[1].clone();

    bob.receive(&auth_request).unwrap();
    assert_eq!(bob.outbox.len(), 1);
    assert_eq!(bob.outbox[0], auth_response);

    // Processed once only
    assert_eq!(bob.children(), 1);
    assert_eq!(bob.kernel.installed_count(), 2);
    assert_eq!(bob.sa.expected_message_id(), 2);
}

#[test]
fn test_old_request_outside_window_dropped() {
    let (alice, mut bob) = established();
    let init_request = alice.sent[0].clone();

    let err = bob.receive(&init_request).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidMessageId {
            expected: 2,
            received: 0
        }
    );
    assert!(bob.outbox.is_empty());
    assert_eq!(bob.sa.state(), IkeSaState::Established);
}

#[test]
fn test_no_proposal_chosen_keeps_ike_sa() {
    let mut bob = bob_config();
    bob.esp_proposals = vec![Proposal::new(1, ProtocolId::Esp)
        .add_transform(Transform::encr(EncrTransformId::ChaCha20Poly1305, None))
        .add_transform(Transform::esn(EsnTransformId::NoEsn))];
    let (alice, bob) = connect(alice_config(), bob);

    assert_eq!(alice.sa.state(), IkeSaState::Established);
    assert_eq!(bob.sa.state(), IkeSaState::Established);
    assert_eq!(alice.children(), 0);
    assert_eq!(bob.children(), 0);
    assert_eq!(alice.kernel.installed_count(), 0);
    assert_eq!(bob.kernel.installed_count(), 0);
    assert_eq!(alice.metrics.snapshot().proposal_negotiation_failed, 1);
    assert_eq!(bob.metrics.snapshot().proposal_negotiation_failed, 1);
}

#[test]
fn test_ts_unacceptable_keeps_ike_sa() {
    let mut bob = bob_config();
    bob.remote_ts = vec![subnet(9)];
    let (alice, bob) = connect(alice_config(), bob);

    assert_eq!(alice.sa.state(), IkeSaState::Established);
    assert_eq!(alice.children(), 0);
    assert_eq!(bob.children(), 0);
    assert_eq!(alice.metrics.snapshot().ts_negotiation_failed, 1);
}

#[test]
fn test_wrong_psk_tears_down_both() {
    let mut alice = Side::initiator(alice_config(), DaemonConfig::default());
    alice.initiate();
    let init = alice.outbox.front().cloned().unwrap();
    let mut bob = Side::responder_with_psk(bob_config(), DaemonConfig::default(), &init, None, b"wrong");
    pump(&mut alice, &mut bob);

    assert!(alice.sa.is_destroyed());
    assert!(bob.sa.is_destroyed());
    assert!(matches!(
        bob.destroyed,
        Some(DestroyCause::Failed(Error::AuthenticationFailed(_)))
    ));
    assert!(matches!(
        alice.destroyed,
        Some(DestroyCause::Failed(Error::AuthenticationFailed(_)))
    ));
    assert_eq!(bob.metrics.snapshot().authentication_failed, 1);
    assert_eq!(alice.kernel.installed_count(), 0);
    assert!(alice.timers.is_empty());
}

#[test]
fn test_invalid_ke_retries_with_requested_group() {
    let mut bob_cfg = bob_config();
    bob_cfg.ike_proposals = vec![Proposal::new(1, ProtocolId::Ike)
        .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(256)))
        .add_transform(Transform::prf(PrfTransformId::HmacSha384))
        .add_transform(Transform::dh(DhTransformId::Modp2048))];

    let mut alice = Side::initiator(alice_config(), DaemonConfig::default());
    alice.initiate();
    let first = alice.outbox.pop_front().unwrap();
    let mut bob = Side::responder(bob_cfg.clone(), DaemonConfig::default(), &first, None);
    bob.receive(&first).unwrap();

    // The refusing responder keeps no state
    assert!(matches!(
        bob.destroyed,
        Some(DestroyCause::Failed(Error::InvalidKePayload { group: 14 }))
    ));
    let refusal = bob.outbox.pop_front().unwrap();
    assert_eq!(decode_header(&refusal).unwrap().responder_spi, [0; 8]);

    alice.receive(&refusal).unwrap();
    let retry = alice.outbox.front().cloned().unwrap();
    let header = decode_header(&retry).unwrap();
    assert_eq!(header.message_id, 0);
    let retry_msg = IkeMessage::decode(&retry, None).unwrap();
    assert_eq!(retry_msg.ke().unwrap().dh_group, 14);

    let mut bob = Side::responder(bob_cfg, DaemonConfig::default(), &retry, None);
    pump(&mut alice, &mut bob);
    assert_eq!(alice.sa.state(), IkeSaState::Established);
    assert_eq!(bob.children(), 1);
}

#[test]
fn test_cookie_challenge_then_accept() {
    let dos = DosConfig {
        cookie_threshold: 0,
        ..DosConfig::default()
    };
    let manager: IkeSaManager<()> = IkeSaManager::new(dos, IpsecMetrics::new());
    let from = ALICE_ADDR.parse().unwrap();

    let mut alice = Side::initiator(alice_config(), DaemonConfig::default());
    alice.initiate();
    let first = alice.outbox.pop_front().unwrap();
    let challenge = match manager.admit(&IkeMessage::decode(&first, None).unwrap(), from) {
        Admission::Challenge(packet) => packet,
        other => panic!("expected a cookie challenge, got {:?}", other),
    };
    assert_eq!(manager.half_open(), 0);

    alice.receive(&challenge).unwrap();
    let second = alice.outbox.front().cloned().unwrap();
    assert_eq!(decode_header(&second).unwrap().message_id, 0);
    let ticket = match manager.admit(&IkeMessage::decode(&second, None).unwrap(), from) {
        Admission::Accept(ticket) => ticket,
        other => panic!("expected the cookie to be accepted, got {:?}", other),
    };
    assert_eq!(manager.half_open(), 1);

    let mut bob = Side::responder(bob_config(), DaemonConfig::default(), &second, Some(ticket));
    pump(&mut alice, &mut bob);
    assert_eq!(bob.sa.state(), IkeSaState::Established);
    assert_eq!(manager.half_open(), 0);
}

#[test]
fn test_half_open_released_on_timeout() {
    let manager: IkeSaManager<()> = IkeSaManager::new(DosConfig::default(), IpsecMetrics::new());
    let from = ALICE_ADDR.parse().unwrap();

    let mut alice = Side::initiator(alice_config(), DaemonConfig::default());
    alice.initiate();
    let init = alice.outbox.front().cloned().unwrap();
    let ticket = match manager.admit(&IkeMessage::decode(&init, None).unwrap(), from) {
        Admission::Accept(ticket) => ticket,
        other => panic!("expected admission, got {:?}", other),
    };
    let mut bob = Side::responder(bob_config(), DaemonConfig::default(), &init, Some(ticket));
    bob.receive(&init).unwrap();
    assert_eq!(manager.half_open(), 1);

    // IKE_AUTH never arrives
    assert!(bob.fire(Timer::HalfOpenTimeout));
    assert_eq!(bob.destroyed, Some(DestroyCause::HalfOpenTimeout));
    assert_eq!(manager.half_open(), 0);
    assert_eq!(bob.metrics.snapshot().ike_handshake_failures, 1);
}
