//! Drives the full handshake-through-ratchet flow across the crate's
//! public API: a handshake is negotiated, a first message flows each
//! way, and the initiator's topic epoch advances once the responder's
//! reply lands on the precomputed "next" topic.

use std::sync::Arc;

use verbeth_core::crypto::session::TopicMatch;
use verbeth_core::handshake::Ed25519Identity;
use verbeth_core::store::InMemorySessionStore;
use verbeth_core::{ratchet_decrypt, ratchet_encrypt, HandshakeDriver, RatchetConfig, SessionManager};

#[tokio::test]
async fn handshake_then_a_round_trip_message_exchange_advances_alices_epoch() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let alice_identity = Ed25519Identity::generate();
    let bob_identity = Ed25519Identity::generate();
    let config = RatchetConfig::default();

    let driver = HandshakeDriver::new();
    let handshake = driver
        .initiate("alice".into(), "bob".into(), &alice_identity, false)
        .await;

    let (bob_session, response) = driver
        .accept(&handshake, &alice_identity.verifying_key(), "bob".into())
        .expect("bob accepts a correctly signed handshake");

    let alice_session = driver
        .try_match_response(&response, "alice".into())
        .await
        .unwrap()
        .expect("alice's pending handshake matches bob's response");
    assert_eq!(alice_session.conversation_id, bob_session.conversation_id);
    assert_eq!(driver.pending_count().await, 0);

    let alice_sessions = SessionManager::new(Arc::new(InMemorySessionStore::new()), config);
    let bob_sessions = SessionManager::new(Arc::new(InMemorySessionStore::new()), config);
    alice_sessions.save(alice_session.clone()).await.unwrap();
    bob_sessions.save(bob_session.clone()).await.unwrap();

    // A sends "hello" on the handshake-bootstrap topic; B is listening on
    // exactly that topic, so this resolves as a `Current` match.
    let hello = ratchet_encrypt(&alice_session, b"hello", &alice_identity.signing_key).unwrap();
    alice_sessions.save(hello.session.clone()).await.unwrap();

    let (bob_for_hello, slot) =
        bob_sessions.get_by_inbound_topic(&hello.topic).await.unwrap().expect("bob has this topic");
    assert_eq!(slot, TopicMatch::Current);

    let (bob_after_hello, plaintext) = ratchet_decrypt(
        &bob_for_hello,
        &hello.header,
        &hello.ciphertext,
        &hello.signature,
        &alice_identity.verifying_key(),
        &config,
    )
    .unwrap();
    assert_eq!(plaintext, b"hello");
    // Decrypting A's message carries A's fresh DH key in the header, so B
    // takes its first DH ratchet step here.
    assert_eq!(bob_after_hello.topics.epoch, 1);
    bob_sessions.save(bob_after_hello.clone()).await.unwrap();

    // B replies "hi". The reply goes out on B's new current_outbound,
    // which is A's precomputed next_inbound topic.
    let hi = ratchet_encrypt(&bob_after_hello, b"hi", &bob_identity.signing_key).unwrap();
    bob_sessions.save(hi.session.clone()).await.unwrap();

    let (alice_for_hi, slot) =
        alice_sessions.get_by_inbound_topic(&hi.topic).await.unwrap().expect("alice has this topic");
    assert_eq!(slot, TopicMatch::Next, "B's reply must land on A's precomputed next topic");
    assert_eq!(alice_for_hi.topics.epoch, 1, "the manager promotes next -> current on this match");

    let (alice_after_hi, plaintext) = ratchet_decrypt(
        &alice_for_hi,
        &hi.header,
        &hi.ciphertext,
        &hi.signature,
        &bob_identity.verifying_key(),
        &config,
    )
    .unwrap();
    assert_eq!(plaintext, b"hi");
    alice_sessions.save(alice_after_hi.clone()).await.unwrap();

    let persisted = alice_sessions
        .get_by_conversation_id(&alice_session.conversation_id)
        .await
        .unwrap()
        .expect("alice's session was persisted through the manager");
    assert!(persisted.topics.epoch >= 1, "A's topic epoch must have advanced after B's reply");
}
