//! ML-KEM-768 wrapper, isolating the `ml-kem` crate's fixed-size array
//! types behind plain byte vectors so the rest of the handshake driver
//! never names `MlKem768`'s associated types directly.

use ml_kem::kem::{Decapsulate, Encapsulate};
use ml_kem::{Ciphertext, EncapsulationKey, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;

use crate::error::{CoreError, Result};

pub type PqPublicKeyBytes = Vec<u8>;
pub type PqSecretKeyBytes = Vec<u8>;
pub type PqCiphertextBytes = Vec<u8>;
pub type PqSharedSecret = [u8; 32];

/// Generate a fresh ML-KEM-768 keypair, as raw encoded bytes.
pub fn generate_keypair() -> (PqSecretKeyBytes, PqPublicKeyBytes) {
    let (decap_key, encap_key) = MlKem768::generate(&mut OsRng);
    (decap_key.as_bytes().to_vec(), encap_key.as_bytes().to_vec())
}

/// Encapsulate against a peer's public key, returning the ciphertext to
/// publish and the shared secret to mix into the root key.
pub fn encapsulate(public_key: &[u8]) -> Result<(PqCiphertextBytes, PqSharedSecret)> {
    let encap_key = EncapsulationKey::<MlKem768Params>::from_bytes(
        public_key
            .try_into()
            .map_err(|_| CoreError::InvalidHandshake("wrong ML-KEM public key length".into()))?,
    );
    let (ciphertext, shared_secret) = encap_key
        .encapsulate(&mut OsRng)
        .map_err(|_| CoreError::InvalidHandshake("ML-KEM encapsulation failed".into()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&shared_secret);
    Ok((ciphertext.to_vec(), out))
}

/// Decapsulate a ciphertext against our own secret key.
pub fn decapsulate(secret_key: &[u8], ciphertext: &[u8]) -> Result<PqSharedSecret> {
    let decap_key = <MlKem768 as KemCore>::DecapsulationKey::from_bytes(
        secret_key
            .try_into()
            .map_err(|_| CoreError::InvalidHandshake("wrong ML-KEM secret key length".into()))?,
    );
    let ciphertext: Ciphertext<MlKem768> = ciphertext
        .try_into()
        .map_err(|_| CoreError::InvalidHandshake("wrong ML-KEM ciphertext length".into()))?;
    let shared_secret = decap_key
        .decapsulate(&ciphertext)
        .map_err(|_| CoreError::InvalidHandshake("ML-KEM decapsulation failed".into()))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&shared_secret);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_then_decapsulate_agree() {
        let (secret, public) = generate_keypair();
        let (ciphertext, shared_a) = encapsulate(&public).unwrap();
        let shared_b = decapsulate(&secret, &ciphertext).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn wrong_secret_key_disagrees() {
        let (_secret, public) = generate_keypair();
        let (other_secret, _other_public) = generate_keypair();
        let (ciphertext, shared_a) = encapsulate(&public).unwrap();
        let shared_wrong = decapsulate(&other_secret, &ciphertext).unwrap();
        assert_ne!(shared_a, shared_wrong);
    }
}
