//! Detached signature creation/verification over `header ‖ ciphertext`.
//!
//! The core MUST verify the signature before any symmetric-key or DH
//! work — an attacker who cannot forge a signature cannot force the
//! receiver to perform skipped-key ratcheting (DoS protection).

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::crypto::codec::Header;
use crate::error::{CoreError, Result};

/// Build the exact byte string the signature covers: the fixed-width
/// 40-byte header followed by the ciphertext.
fn signing_input(header: &Header, ciphertext: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(40 + ciphertext.len());
    input.extend_from_slice(&header.to_bytes());
    input.extend_from_slice(ciphertext);
    input
}

/// Sign `(header_bytes ‖ ciphertext)` with a detached Ed25519 signature.
pub fn sign(signing_key: &SigningKey, header: &Header, ciphertext: &[u8]) -> [u8; 64] {
    let input = signing_input(header, ciphertext);
    signing_key.sign(&input).to_bytes()
}

/// Verify a detached Ed25519 signature over `(header_bytes ‖
/// ciphertext)`. Must be called before any DH or chain-key operation.
pub fn verify(
    verifying_key: &VerifyingKey,
    header: &Header,
    ciphertext: &[u8],
    signature: &[u8; 64],
) -> Result<()> {
    let signature = Signature::from_bytes(signature);
    let input = signing_input(header, ciphertext);
    verifying_key
        .verify(&input, &signature)
        .map_err(|_| CoreError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn sign_then_verify_round_trips() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let header = Header { dh: [1u8; 32], pn: 0, n: 0 };
        let ciphertext = b"ciphertext bytes".to_vec();

        let sig = sign(&signing_key, &header, &ciphertext);
        assert!(verify(&verifying_key, &header, &ciphertext, &sig).is_ok());
    }

    #[test]
    fn flipped_signature_bit_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let header = Header { dh: [1u8; 32], pn: 0, n: 0 };
        let ciphertext = b"ciphertext bytes".to_vec();

        let mut sig = sign(&signing_key, &header, &ciphertext);
        sig[0] ^= 0x01;

        let err = verify(&verifying_key, &header, &ciphertext, &sig).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSignature));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let header = Header { dh: [1u8; 32], pn: 0, n: 0 };
        let ciphertext = b"ciphertext bytes".to_vec();
        let sig = sign(&signing_key, &header, &ciphertext);

        let tampered = b"CiphertExt bytes".to_vec();
        assert!(verify(&verifying_key, &header, &tampered, &sig).is_err());
    }
}
