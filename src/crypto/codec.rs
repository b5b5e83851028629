//! Deterministic binary packaging/parsing of the wire payload.
//!
//! ```text
//! off sz field
//! 0   1  version (0x01)
//! 1   64 ed25519 signature
//! 65  32 dh (X25519 ratchet pubkey)
//! 97  4  pn (u32, big-endian)
//! 101 4  n  (u32, big-endian)
//! 105 .. ciphertext (xsalsa20-poly1305 output incl. its 24-byte nonce)
//! ```

use crate::config::{MIN_PAYLOAD_LEN, RATCHET_VERSION_V1};
use crate::error::{CoreError, Result};

/// The on-wire message header: sender's DH ratchet public key plus
/// chain-position metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub dh: [u8; 32],
    pub pn: u32,
    pub n: u32,
}

impl Header {
    /// Fixed-width 40-byte encoding: `dh ‖ pn_be_u32 ‖ n_be_u32`. This is
    /// the exact byte string the signature is computed over.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..32].copy_from_slice(&self.dh);
        out[32..36].copy_from_slice(&self.pn.to_be_bytes());
        out[36..40].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; 40]) -> Self {
        let mut dh = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        let pn = u32::from_be_bytes(bytes[32..36].try_into().unwrap());
        let n = u32::from_be_bytes(bytes[36..40].try_into().unwrap());
        Self { dh, pn, n }
    }
}

/// Package a signature, header, and ciphertext into the wire payload.
///
/// Validates `signature.len() == 64`; `header.dh` is already fixed at
/// 32 bytes by type.
pub fn package(signature: &[u8], header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if signature.len() != 64 {
        return Err(CoreError::InvalidFormat);
    }

    let mut out = Vec::with_capacity(MIN_PAYLOAD_LEN + ciphertext.len());
    out.push(RATCHET_VERSION_V1);
    out.extend_from_slice(signature);
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Parse a wire payload back into its signature, header, and ciphertext.
///
/// Rejects any payload shorter than [`MIN_PAYLOAD_LEN`] or whose first
/// byte isn't [`RATCHET_VERSION_V1`].
pub fn parse(payload: &[u8]) -> Result<([u8; 64], Header, Vec<u8>)> {
    if payload.len() < MIN_PAYLOAD_LEN {
        return Err(CoreError::InvalidFormat);
    }
    if payload[0] != RATCHET_VERSION_V1 {
        return Err(CoreError::InvalidFormat);
    }

    let mut signature = [0u8; 64];
    signature.copy_from_slice(&payload[1..65]);

    let mut header_bytes = [0u8; 40];
    header_bytes.copy_from_slice(&payload[65..105]);
    let header = Header::from_bytes(&header_bytes);

    let ciphertext = payload[105..].to_vec();

    Ok((signature, header, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header { dh: [3u8; 32], pn: 7, n: 42 }
    }

    #[test]
    fn round_trip() {
        let sig = [9u8; 64];
        let header = sample_header();
        let ciphertext = b"some authenticated ciphertext bytes".to_vec();

        let packaged = package(&sig, &header, &ciphertext).unwrap();
        let (parsed_sig, parsed_header, parsed_ct) = parse(&packaged).unwrap();

        assert_eq!(parsed_sig, sig);
        assert_eq!(parsed_header, header);
        assert_eq!(parsed_ct, ciphertext);
    }

    #[test]
    fn rejects_short_payload() {
        let short = vec![0x01u8; MIN_PAYLOAD_LEN - 1];
        assert!(matches!(parse(&short), Err(CoreError::InvalidFormat)));
    }

    #[test]
    fn rejects_wrong_version() {
        let mut payload = vec![0x02u8; MIN_PAYLOAD_LEN];
        payload[0] = 0x02;
        assert!(matches!(parse(&payload), Err(CoreError::InvalidFormat)));
    }

    #[test]
    fn rejects_bad_signature_length_on_package() {
        let header = sample_header();
        let err = package(&[0u8; 63], &header, b"ct").unwrap_err();
        assert!(matches!(err, CoreError::InvalidFormat));
    }

    proptest::proptest! {
        #[test]
        fn prop_round_trip(sig in proptest::array::uniform64(proptest::num::u8::ANY),
                            dh in proptest::array::uniform32(proptest::num::u8::ANY),
                            pn: u32, n: u32,
                            ct in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let header = Header { dh, pn, n };
            let packaged = package(&sig, &header, &ct).unwrap();
            let (parsed_sig, parsed_header, parsed_ct) = parse(&packaged).unwrap();
            proptest::prop_assert_eq!(parsed_sig.to_vec(), sig.to_vec());
            proptest::prop_assert_eq!(parsed_header, header);
            proptest::prop_assert_eq!(parsed_ct, ct);
        }
    }
}
