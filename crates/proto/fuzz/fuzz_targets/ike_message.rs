//! Fuzz target for IKE message parsing.
//!
//! Every datagram the daemon receives goes through `decode_header` and then
//! `IkeMessage::decode`; neither may panic on arbitrary input.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ike_message -- -max_total_time=300
//! ```

#![no_main]
use ikev2d_proto::ipsec::ikev2::message::{decode_header, IkeMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let header = decode_header(data);

    if let Ok(message) = IkeMessage::decode(data, None) {
        // A message that parses has a valid header
        assert!(header.is_ok());

        // Plaintext messages re-encode and parse again
        if let Ok(wire) = message.encode(None) {
            let reparsed = IkeMessage::decode(&wire, None).expect("re-encoded message must parse");
            assert_eq!(reparsed.payloads.len(), message.payloads.len());
        }
    }
});
