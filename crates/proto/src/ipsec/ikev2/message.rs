//! IKEv2 message structures and the message codec
//!
//! Implements the IKE message format defined in RFC 7296 Section 3.1 and the
//! Encrypted payload framing of Section 3.14 for AEAD ciphers (RFC 5282).
//!
//! The codec is a pure transform: [`IkeMessage::encode`] and
//! [`IkeMessage::decode`] keep no state between calls.

use rand::RngCore;

use super::constants::*;
use super::payload::{
    encode_payload_chain, parse_payload_chain, AuthPayload, DeletePayload, Identity, IkePayload,
    KePayload, NotifyPayload, PayloadHeader, SaPayload, TsPayload,
};
use crate::ipsec::crypto::CipherAlgorithm;
use crate::ipsec::{Error, Result};

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's Security Parameter Index (8 bytes)
    pub initiator_spi: [u8; 8],

    /// Responder's Security Parameter Index (8 bytes, zero for IKE_SA_INIT request)
    pub responder_spi: [u8; 8],

    /// Raw type of the first payload
    pub next_payload: u8,

    /// Protocol version (must be 0x20 for IKEv2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID (used for replay protection and matching)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a new IKE header
    pub fn new(
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        next_payload: u8,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        length: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length,
        }
    }

    /// Parse IKE header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Buffer is too short (< 28 bytes)
    /// - Protocol version is not 0x20
    /// - Exchange type is unknown
    /// - Message length is invalid
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < IKE_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut initiator_spi = [0u8; 8];
        let mut responder_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&data[0..8]);
        responder_spi.copy_from_slice(&data[8..16]);

        let version = data[17];
        if version >> 4 != IKE_VERSION >> 4 {
            return Err(Error::UnsupportedVersion(version));
        }

        let exchange_type =
            ExchangeType::from_u8(data[18]).ok_or(Error::UnsupportedExchangeType(data[18]))?;

        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);

        let header = IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: data[16],
            version,
            exchange_type,
            flags: IkeFlags::new(data[19]),
            message_id,
            length,
        };
        header.validate()?;
        Ok(header)
    }

    /// Serialize IKE header to bytes
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.initiator_spi);
        bytes[8..16].copy_from_slice(&self.responder_spi);
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type.to_u8();
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Validate header fields
    pub fn validate(&self) -> Result<()> {
        if self.version >> 4 != IKE_VERSION >> 4 {
            return Err(Error::UnsupportedVersion(self.version));
        }

        if self.length > MAX_IKE_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(self.length));
        }

        if self.length < IKE_HEADER_SIZE as u32 {
            return Err(Error::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: self.length as usize,
            });
        }

        Ok(())
    }

    /// Whether this message is a request
    pub fn is_request(&self) -> bool {
        !self.flags.is_response()
    }

    /// SPI identifying the IKE_SA on the receiving side
    ///
    /// A message sent by the original initiator is addressed to the
    /// responder's SPI and vice versa.
    pub fn recipient_spi(&self) -> [u8; 8] {
        if self.flags.is_initiator() {
            self.responder_spi
        } else {
            self.initiator_spi
        }
    }
}

/// Parse and validate the cleartext header of a datagram
///
/// Used for routing and message-ID checks before any decryption is attempted.
///
/// # Errors
///
/// Returns `MalformedMessage` if the length field disagrees with the datagram.
pub fn decode_header(bytes: &[u8]) -> Result<IkeHeader> {
    let header = IkeHeader::from_bytes(bytes)?;
    if header.length as usize != bytes.len() {
        return Err(Error::MalformedMessage(format!(
            "header length {} but datagram is {} bytes",
            header.length,
            bytes.len()
        )));
    }
    Ok(header)
}

/// SK payload keys for one direction
#[derive(Debug, Clone, Copy)]
pub struct SkKey<'a> {
    /// Negotiated AEAD cipher
    pub cipher: CipherAlgorithm,
    /// Keying material (SK_ei or SK_er, key followed by salt)
    pub key: &'a [u8],
}

/// A decoded IKE message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeMessage {
    /// Initiator's SPI
    pub initiator_spi: [u8; 8],
    /// Responder's SPI
    pub responder_spi: [u8; 8],
    /// Exchange type
    pub exchange_type: ExchangeType,
    /// Initiator/response flags
    pub flags: IkeFlags,
    /// Message ID
    pub message_id: u32,
    /// Payloads in wire order; inside the SK envelope when keys are in use
    pub payloads: Vec<IkePayload>,
}

impl IkeMessage {
    /// Empty message
    pub fn new(
        exchange_type: ExchangeType,
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        flags: IkeFlags,
        message_id: u32,
    ) -> Self {
        IkeMessage {
            initiator_spi,
            responder_spi,
            exchange_type,
            flags,
            message_id,
            payloads: Vec::new(),
        }
    }

    /// Whether this message is a response
    pub fn is_response(&self) -> bool {
        self.flags.is_response()
    }

    /// Append a payload
    pub fn push(&mut self, payload: IkePayload) {
        self.payloads.push(payload);
    }

    /// Serialize to wire bytes
    ///
    /// Every exchange except IKE_SA_INIT is wrapped in an SK payload when a
    /// key is supplied.
    pub fn encode(&self, key: Option<SkKey<'_>>) -> Result<Vec<u8>> {
        match key {
            Some(key) if self.exchange_type != ExchangeType::IkeSaInit => self.encode_sealed(key),
            _ => self.encode_plain(),
        }
    }

    fn header(&self, next_payload: u8, length: usize) -> Result<IkeHeader> {
        if length > MAX_IKE_MESSAGE_SIZE as usize {
            return Err(Error::MessageTooLarge(length as u32));
        }
        Ok(IkeHeader::new(
            self.initiator_spi,
            self.responder_spi,
            next_payload,
            self.exchange_type,
            self.flags,
            self.message_id,
            length as u32,
        ))
    }

    fn encode_plain(&self) -> Result<Vec<u8>> {
        let (first, body) = encode_payload_chain(&self.payloads, PayloadType::None.to_u8());
        let header = self.header(first, IKE_HEADER_SIZE + body.len())?;

        let mut out = Vec::with_capacity(header.length as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn encode_sealed(&self, key: SkKey<'_>) -> Result<Vec<u8>> {
        let (first_inner, mut plaintext) =
            encode_payload_chain(&self.payloads, PayloadType::None.to_u8());
        // AEAD needs no block alignment: zero padding, pad length byte only
        plaintext.push(0);

        let cipher = key.cipher;
        let sk_len = PayloadHeader::SIZE + cipher.iv_len() + plaintext.len() + cipher.icv_len();
        let header = self.header(PayloadType::SK.to_u8(), IKE_HEADER_SIZE + sk_len)?;
        let sk_header = PayloadHeader::new(first_inner, false, sk_len as u16);

        let mut out = Vec::with_capacity(header.length as usize);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&sk_header.to_bytes());

        let mut iv = vec![0u8; cipher.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        let sealed = cipher.seal(key.key, &iv, &out, &plaintext)?;

        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Parse wire bytes
    ///
    /// # Errors
    ///
    /// - `MalformedMessage` on inconsistent lengths, an SK payload that is not
    ///   last, or a protected exchange arriving in clear while keys exist
    /// - `DecryptionFailed` if the ICV does not verify
    /// - `UnsupportedCriticalPayload` for unknown critical payloads
    pub fn decode(bytes: &[u8], key: Option<SkKey<'_>>) -> Result<Self> {
        let header = decode_header(bytes)?;
        let body = &bytes[IKE_HEADER_SIZE..];
        let chain = parse_payload_chain(header.next_payload, body)?;

        let mut payloads = chain.payloads;
        match (chain.encrypted_at, key) {
            (Some(offset), Some(key)) => {
                let inner = open_sk(bytes, IKE_HEADER_SIZE + offset, key)?;
                payloads.extend(inner);
            }
            (Some(_), None) => {
                return Err(Error::MalformedMessage(
                    "encrypted payload but no keys established".into(),
                ));
            }
            (None, Some(_)) if header.exchange_type != ExchangeType::IkeSaInit => {
                return Err(Error::MalformedMessage(format!(
                    "{} message without encrypted payload",
                    header.exchange_type
                )));
            }
            (None, _) => {}
        }

        Ok(IkeMessage {
            initiator_spi: header.initiator_spi,
            responder_spi: header.responder_spi,
            exchange_type: header.exchange_type,
            flags: header.flags,
            message_id: header.message_id,
            payloads,
        })
    }

    /// SA payload
    pub fn sa(&self) -> Option<&SaPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::SA(sa) => Some(sa),
            _ => None,
        })
    }

    /// KE payload
    pub fn ke(&self) -> Option<&KePayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::KE(ke) => Some(ke),
            _ => None,
        })
    }

    /// Nonce data
    pub fn nonce(&self) -> Option<&[u8]> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::Nonce(n) => Some(n.nonce.as_slice()),
            _ => None,
        })
    }

    /// IDi payload
    pub fn id_i(&self) -> Option<&Identity> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::IDi(id) => Some(id),
            _ => None,
        })
    }

    /// IDr payload
    pub fn id_r(&self) -> Option<&Identity> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::IDr(id) => Some(id),
            _ => None,
        })
    }

    /// AUTH payload
    pub fn auth(&self) -> Option<&AuthPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::AUTH(auth) => Some(auth),
            _ => None,
        })
    }

    /// TSi payload
    pub fn ts_i(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::TSi(ts) => Some(ts),
            _ => None,
        })
    }

    /// TSr payload
    pub fn ts_r(&self) -> Option<&TsPayload> {
        self.payloads.iter().find_map(|p| match p {
            IkePayload::TSr(ts) => Some(ts),
            _ => None,
        })
    }

    /// All Delete payloads
    pub fn deletes(&self) -> impl Iterator<Item = &DeletePayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::Delete(d) => Some(d),
            _ => None,
        })
    }

    /// All Notify payloads
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::Notify(n) => Some(n),
            _ => None,
        })
    }

    /// First notify of the given type
    pub fn notify(&self, notify_type: NotifyType) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.notify_type == notify_type)
    }

    /// First error notify, if any
    pub fn error_notify(&self) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.notify_type.is_error())
    }
}

/// Verify and decrypt the SK payload starting at `sk_start`
fn open_sk(bytes: &[u8], sk_start: usize, key: SkKey<'_>) -> Result<Vec<IkePayload>> {
    let cipher = key.cipher;
    let sk_header = PayloadHeader::from_bytes(&bytes[sk_start..])
        .map_err(|e| Error::MalformedMessage(format!("SK header: {}", e)))?;

    if sk_start + sk_header.length as usize != bytes.len() {
        return Err(Error::MalformedMessage(
            "encrypted payload is not the last payload".into(),
        ));
    }

    let iv_start = sk_start + PayloadHeader::SIZE;
    let ct_start = iv_start + cipher.iv_len();
    if bytes.len() < ct_start + cipher.icv_len() + 1 {
        return Err(Error::MalformedMessage("encrypted payload too short".into()));
    }

    let aad = &bytes[..iv_start];
    let iv = &bytes[iv_start..ct_start];
    let plaintext = cipher.open(key.key, iv, aad, &bytes[ct_start..])?;

    let pad_len = plaintext
        .last()
        .map(|b| *b as usize)
        .ok_or_else(|| Error::MalformedMessage("empty encrypted payload".into()))?;
    if pad_len + 1 > plaintext.len() {
        return Err(Error::MalformedMessage(format!(
            "pad length {} exceeds plaintext",
            pad_len
        )));
    }

    let inner = &plaintext[..plaintext.len() - pad_len - 1];
    let chain = parse_payload_chain(sk_header.next_payload, inner)?;
    if chain.encrypted_at.is_some() {
        return Err(Error::MalformedMessage("nested encrypted payload".into()));
    }
    Ok(chain.payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::payload::{NoncePayload, TrafficSelector};
    use std::net::{IpAddr, Ipv4Addr};

    const KEY: [u8; 20] = [0x5a; 20];

    fn key() -> SkKey<'static> {
        SkKey {
            cipher: CipherAlgorithm::AesGcm128,
            key: &KEY,
        }
    }

    fn auth_request() -> IkeMessage {
        let mut msg = IkeMessage::new(
            ExchangeType::IkeAuth,
            [1; 8],
            [2; 8],
            IkeFlags::request(true),
            1,
        );
        msg.push(IkePayload::IDi(Identity::fqdn("client.example.com")));
        msg.push(IkePayload::Notify(NotifyPayload::new(
            NotifyType::InitialContact,
            Vec::new(),
        )));
        let any = TrafficSelector::range(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 255)),
        );
        msg.push(IkePayload::TSi(TsPayload::new(vec![any.clone()])));
        msg.push(IkePayload::TSr(TsPayload::new(vec![any])));
        msg
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IkeHeader::new(
            [1, 2, 3, 4, 5, 6, 7, 8],
            [9, 10, 11, 12, 13, 14, 15, 16],
            PayloadType::SA.to_u8(),
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            42,
            100,
        );

        let bytes = header.to_bytes();
        let parsed = IkeHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header, parsed);
    }

    #[test]
    fn test_buffer_too_short() {
        let data = vec![0u8; 27];
        let result = IkeHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::BufferTooShort { .. })));
    }

    #[test]
    fn test_invalid_version() {
        let mut data = vec![0u8; 28];
        data[17] = 0x10;

        let result = IkeHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::UnsupportedVersion(0x10))));
    }

    #[test]
    fn test_unknown_exchange_type() {
        let mut data = vec![0u8; 28];
        data[17] = 0x20;
        data[18] = 99;

        let result = IkeHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::UnsupportedExchangeType(99))));
    }

    #[test]
    fn test_message_too_large() {
        let mut data = vec![0u8; 28];
        data[17] = 0x20;
        data[18] = 34;
        data[24..28].copy_from_slice(&70000u32.to_be_bytes());

        let result = IkeHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::MessageTooLarge(70000))));
    }

    #[test]
    fn test_recipient_spi() {
        let mut header = IkeHeader::new(
            [1; 8],
            [2; 8],
            0,
            ExchangeType::Informational,
            IkeFlags::request(true),
            3,
            28,
        );
        assert_eq!(header.recipient_spi(), [2; 8]);
        header.flags = IkeFlags::response(false);
        assert_eq!(header.recipient_spi(), [1; 8]);
    }

    #[test]
    fn test_decode_header_rejects_length_mismatch() {
        let msg = IkeMessage::new(
            ExchangeType::IkeSaInit,
            [1; 8],
            [0; 8],
            IkeFlags::request(true),
            0,
        );
        let mut bytes = msg.encode(None).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_header(&bytes),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_plain_init_message() {
        let mut msg = IkeMessage::new(
            ExchangeType::IkeSaInit,
            [7; 8],
            [0; 8],
            IkeFlags::request(true),
            0,
        );
        msg.push(IkePayload::Nonce(NoncePayload::new(vec![9; 32]).unwrap()));

        // IKE_SA_INIT is never encrypted, even when a key is passed
        let bytes = msg.encode(Some(key())).unwrap();
        assert_eq!(bytes[16], PayloadType::Nonce.to_u8());
        assert_eq!(IkeMessage::decode(&bytes, None).unwrap(), msg);
    }

    #[test]
    fn test_sealed_message() {
        let msg = auth_request();
        let bytes = msg.encode(Some(key())).unwrap();

        assert_eq!(bytes[16], PayloadType::SK.to_u8());
        // Identity is not visible on the wire
        assert!(!bytes
            .windows(b"client.example.com".len())
            .any(|w| w == b"client.example.com"));

        let decoded = IkeMessage::decode(&bytes, Some(key())).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_tampered_header_fails_integrity() {
        let mut bytes = auth_request().encode(Some(key())).unwrap();
        // Flip the message ID; the header is authenticated data
        bytes[23] ^= 1;
        assert_eq!(
            IkeMessage::decode(&bytes, Some(key())),
            Err(Error::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_key_fails_integrity() {
        let bytes = auth_request().encode(Some(key())).unwrap();
        let other = [0x11; 20];
        let wrong = SkKey {
            cipher: CipherAlgorithm::AesGcm128,
            key: &other,
        };
        assert_eq!(
            IkeMessage::decode(&bytes, Some(wrong)),
            Err(Error::DecryptionFailed)
        );
    }

    #[test]
    fn test_cleartext_rejected_once_keyed() {
        let bytes = auth_request().encode(None).unwrap();
        assert!(matches!(
            IkeMessage::decode(&bytes, Some(key())),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let mut msg = IkeMessage::new(
            ExchangeType::IkeSaInit,
            [7; 8],
            [0; 8],
            IkeFlags::request(true),
            0,
        );
        msg.push(IkePayload::Nonce(NoncePayload::new(vec![9; 32]).unwrap()));
        let mut bytes = msg.encode(None).unwrap();

        // Payload claims more bytes than the message holds
        bytes[IKE_HEADER_SIZE + 3] = 0xff;
        assert!(matches!(
            IkeMessage::decode(&bytes, None),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_notify_lookup() {
        let msg = auth_request();
        assert!(msg.notify(NotifyType::InitialContact).is_some());
        assert!(msg.error_notify().is_none());
        assert_eq!(msg.id_i(), Some(&Identity::fqdn("client.example.com")));
    }
}
