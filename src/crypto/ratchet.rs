//! Double Ratchet encrypt/decrypt: the chain step, DH ratchet decision,
//! skipped-key bookkeeping, and topic rotation.
//!
//! Sessions are values: both functions take a session by reference and
//! return a new one on success, leaving the input untouched on any
//! error. Persisting the returned session is the caller's job (see
//! [`crate::manager`] for the two-phase commit that does it safely).

use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Nonce, XSalsa20Poly1305};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::RatchetConfig;
use crate::crypto::auth;
use crate::crypto::codec::Header;
use crate::crypto::kdf::{derive_topic, dh, kdf_ck, kdf_rk, TopicDirection};
use crate::crypto::session::Session;
use crate::error::{CoreError, Result};

/// The outcome of a successful encrypt: the updated session plus the
/// pieces the caller packages onto the wire and submits to transport.
pub struct Encrypted {
    pub session: Session,
    pub header: Header,
    pub ciphertext: Vec<u8>,
    pub signature: [u8; 64],
    pub topic: [u8; 32],
}

/// Advances the sending chain by one message key. Never performs a DH
/// ratchet step; always sends on `topics.current_outbound`.
pub fn ratchet_encrypt(
    session: &Session,
    plaintext: &[u8],
    signing_key: &SigningKey,
) -> Result<Encrypted> {
    let chain_key = session.sending_chain_key.ok_or(CoreError::NoSendingChain)?;
    let (next_chain_key, message_key) = kdf_ck(&chain_key);

    let header = Header {
        dh: *session.dh_my_public.as_bytes(),
        pn: session.previous_chain_length,
        n: session.sending_msg_number,
    };

    let sealed = secretbox_seal(&message_key, plaintext)?;
    let signature = auth::sign(signing_key, &header, &sealed);

    let mut session = session.clone();
    session.sending_chain_key = Some(next_chain_key);
    session.sending_msg_number += 1;
    session.touch();

    let topic = session.topics.current_outbound;
    Ok(Encrypted { session, header, ciphertext: sealed, signature, topic })
}

/// Verifies the signature before any DH or chain-key work.
pub fn ratchet_decrypt(
    session: &Session,
    header: &Header,
    ciphertext: &[u8],
    signature: &[u8; 64],
    contact_verifying_key: &VerifyingKey,
    config: &RatchetConfig,
) -> Result<(Session, Vec<u8>)> {
    auth::verify(contact_verifying_key, header, ciphertext, signature)?;

    let mut session = session.clone();

    if let Some(message_key) = session.skipped_keys.take(&header.dh, header.n) {
        let plaintext = secretbox_decrypt(&message_key, ciphertext)?;
        session.touch();
        return Ok((session, plaintext));
    }

    let their_dh = PublicKey::from(header.dh);
    if header.dh != *session.dh_their_public.as_bytes() {
        dh_ratchet_step(&mut session, header, &their_dh, config)?;
    }

    skip_receiving_chain(&mut session, header.n, config)?;

    let chain_key = session.receiving_chain_key.ok_or(CoreError::NoReceivingChain)?;
    let (next_chain_key, message_key) = kdf_ck(&chain_key);
    let plaintext = secretbox_decrypt(&message_key, ciphertext)?;

    session.receiving_chain_key = Some(next_chain_key);
    session.receiving_msg_number += 1;
    session.touch();

    Ok((session, plaintext))
}

/// Skips the tail of the current receiving chain, performs the two
/// root-KDF steps (receive then send), rotates the DH keypair, and
/// rotates topics.
fn dh_ratchet_step(
    session: &mut Session,
    header: &Header,
    their_dh: &PublicKey,
    config: &RatchetConfig,
) -> Result<()> {
    if session.receiving_chain_key.is_some() {
        skip_receiving_chain(session, header.pn, config)?;
    }

    let dh_receive = dh(&session.dh_my_secret, their_dh);
    let (root_key, receiving_chain_key) = kdf_rk(&session.root_key, &dh_receive);

    let new_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let new_public = PublicKey::from(&new_secret);
    let dh_send = dh(&new_secret, their_dh);
    let (root_key, sending_chain_key) = kdf_rk(&root_key, &dh_send);

    session.root_key = root_key;
    session.receiving_chain_key = Some(receiving_chain_key);
    session.sending_chain_key = Some(sending_chain_key);
    session.previous_chain_length = session.sending_msg_number;
    session.sending_msg_number = 0;
    session.receiving_msg_number = 0;
    session.dh_my_secret = new_secret;
    session.dh_my_public = new_public;
    session.dh_their_public = *their_dh;

    // New current topics come from the peer-derived dh_receive, labels
    // swapped; the precomputed next topics come from our own dh_send,
    // natural labels — same convention as session bootstrap.
    let new_current_inbound =
        derive_topic(&dh_receive, TopicDirection::Outbound, &session.conversation_id);
    let new_current_outbound =
        derive_topic(&dh_receive, TopicDirection::Inbound, &session.conversation_id);
    let next_outbound = derive_topic(&dh_send, TopicDirection::Outbound, &session.conversation_id);
    let next_inbound = derive_topic(&dh_send, TopicDirection::Inbound, &session.conversation_id);

    session.topics.previous_inbound = Some(session.topics.current_inbound);
    session.topics.previous_expiry = Some(
        crate::crypto::session::now_ms() + config.topic_transition_window_ms,
    );
    session.topics.current_inbound = new_current_inbound;
    session.topics.current_outbound = new_current_outbound;
    session.topics.next_outbound = Some(next_outbound);
    session.topics.next_inbound = Some(next_inbound);
    session.topics.epoch += 1;

    Ok(())
}

/// Derives and stores skipped keys for `receiving_msg_number .. until`,
/// bounded by `max_skip_per_message`.
fn skip_receiving_chain(session: &mut Session, until: u32, config: &RatchetConfig) -> Result<()> {
    let Some(mut chain_key) = session.receiving_chain_key else {
        return Ok(());
    };
    if until <= session.receiving_msg_number {
        return Ok(());
    }
    let span = (until - session.receiving_msg_number) as u64;
    if span > config.max_skip_per_message as u64 {
        return Err(CoreError::TooManySkipped { requested: span, max: config.max_skip_per_message });
    }

    let dh_public = *session.dh_their_public.as_bytes();
    for n in session.receiving_msg_number..until {
        let (next_chain_key, message_key) = kdf_ck(&chain_key);
        session
            .skipped_keys
            .insert(dh_public, n, message_key, config.max_stored_skipped_keys);
        chain_key = next_chain_key;
    }
    session.receiving_chain_key = Some(chain_key);
    session.receiving_msg_number = until;
    Ok(())
}

/// Encrypts `plaintext` under `message_key` with a fresh random nonce
/// and returns `nonce ‖ ciphertext` (secretbox's own wire framing; the
/// header isn't AEAD-bound here since the detached signature already
/// covers `header_bytes ‖ ciphertext`).
pub(crate) fn secretbox_seal(message_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher =
        XSalsa20Poly1305::new_from_slice(message_key).map_err(|_| CoreError::DecryptFailure)?;
    let mut nonce_bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let sealed = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CoreError::DecryptFailure)?;

    let mut out = Vec::with_capacity(24 + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub(crate) fn secretbox_decrypt(message_key: &[u8; 32], wire: &[u8]) -> Result<Vec<u8>> {
    if wire.len() < 24 {
        return Err(CoreError::InvalidFormat);
    }
    let (nonce_bytes, sealed) = wire.split_at(24);
    let cipher =
        XSalsa20Poly1305::new_from_slice(message_key).map_err(|_| CoreError::DecryptFailure)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, sealed)
        .map_err(|_| CoreError::DecryptFailure)
}
