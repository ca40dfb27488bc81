//! End-to-end engine tests: two users sharing one key directory,
//! covering session bootstrap, prekey lifecycle, out-of-order delivery,
//! persistence across restarts, and the error surface.

use pairlock::engine::Clock;
use pairlock::storage::KeyStore;
use pairlock::{
    Decrypted, DhPublicKey, Engine, Error, KeyDirectory, MemoryDirectory, MemoryKeyStore,
    SigningPublicKey,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Settable clock for rotation tests
struct TestClock(AtomicU64);

impl TestClock {
    fn at(ms: u64) -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(ms)))
    }

    fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

struct Fixture {
    alice: Engine,
    bob: Engine,
    alice_store: Arc<MemoryKeyStore>,
    bob_store: Arc<MemoryKeyStore>,
    directory: Arc<MemoryDirectory>,
}

async fn initialized_pair() -> Fixture {
    let directory = Arc::new(MemoryDirectory::new());
    let alice_store = Arc::new(MemoryKeyStore::new());
    let bob_store = Arc::new(MemoryKeyStore::new());

    let alice = Engine::new("alice", alice_store.clone(), directory.clone());
    let bob = Engine::new("bob", bob_store.clone(), directory.clone());
    alice.initialize().await.expect("alice initializes");
    bob.initialize().await.expect("bob initializes");

    Fixture {
        alice,
        bob,
        alice_store,
        bob_store,
        directory,
    }
}

fn plaintext_of(decrypted: Decrypted) -> String {
    match decrypted {
        Decrypted::Plaintext(text) => text,
        Decrypted::NotEncrypted(text) => panic!("expected ciphertext, got passthrough: {text}"),
    }
}

#[tokio::test]
async fn first_message_carries_preamble_and_consumes_prekey() {
    let fx = initialized_pair().await;

    let envelope = fx.alice.encrypt("c1", "bob", "hello").await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
    assert_eq!(value["v"], 2);
    assert!(value["header"]["dh"].is_object());
    assert!(value["x3dh"]["identityKey"].is_object());
    assert!(value["x3dh"]["ephemeralKey"].is_object());
    let claimed_id = value["x3dh"]["oneTimePreKeyId"]
        .as_u64()
        .expect("a one-time prekey was claimed") as u32;

    let received = fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();
    assert_eq!(plaintext_of(received), "hello");

    // The responder deleted the consumed one-time prekey.
    assert!(fx
        .bob_store
        .get_one_time_prekey("bob", claimed_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn reply_carries_no_preamble_and_advances_the_ratchet() {
    let fx = initialized_pair().await;

    let first = fx.alice.encrypt("c1", "bob", "hello").await.unwrap();
    fx.bob.decrypt("c1", "alice", &first).await.unwrap();

    let reply = fx.bob.encrypt("c1", "alice", "hi").await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert!(value.get("x3dh").is_none());

    let received = fx.alice.decrypt("c1", "bob", &reply).await.unwrap();
    assert_eq!(plaintext_of(received), "hi");

    // Receiving the reply stepped Alice's DH ratchet: her next header
    // carries a different ratchet key than her first.
    let first_value: serde_json::Value = serde_json::from_str(&first).unwrap();
    let third = fx.alice.encrypt("c1", "bob", "again").await.unwrap();
    let third_value: serde_json::Value = serde_json::from_str(&third).unwrap();
    assert_ne!(first_value["header"]["dh"], third_value["header"]["dh"]);
}

#[tokio::test]
async fn out_of_order_delivery_drains_the_skipped_cache() {
    let fx = initialized_pair().await;

    let mut messages = Vec::new();
    for i in 0..4 {
        messages.push(fx.alice.encrypt("c1", "bob", &format!("m{i}")).await.unwrap());
    }

    for index in [2usize, 0, 3, 1] {
        let received = fx.bob.decrypt("c1", "alice", &messages[index]).await.unwrap();
        assert_eq!(plaintext_of(received), format!("m{index}"));
    }

    let record = fx.bob_store.get_session("c1").await.unwrap().unwrap();
    assert!(record.ratchet.skipped.is_empty());
}

#[tokio::test]
async fn gap_beyond_max_skip_is_undecryptable_and_state_is_unchanged() {
    let fx = initialized_pair().await;

    let mut messages = Vec::new();
    for i in 0..=300u32 {
        messages.push(fx.alice.encrypt("c1", "bob", &format!("m{i}")).await.unwrap());
    }

    // Establish the session with the first message, then jump past the
    // skip bound.
    fx.bob.decrypt("c1", "alice", &messages[0]).await.unwrap();
    let before = serde_json::to_string(
        &fx.bob_store.get_session("c1").await.unwrap().unwrap().ratchet,
    )
    .unwrap();

    let err = fx.bob.decrypt("c1", "alice", &messages[300]).await.unwrap_err();
    assert_eq!(err, Error::Undecryptable);

    let after = serde_json::to_string(
        &fx.bob_store.get_session("c1").await.unwrap().unwrap().ratchet,
    )
    .unwrap();
    assert_eq!(before, after);

    // The live state is also untouched: the next in-order message decrypts.
    let received = fx.bob.decrypt("c1", "alice", &messages[1]).await.unwrap();
    assert_eq!(plaintext_of(received), "m1");
}

#[tokio::test]
async fn session_survives_process_restart() {
    let fx = initialized_pair().await;

    let first = fx.alice.encrypt("c1", "bob", "safe").await.unwrap();
    drop(fx.alice);

    // Same store, fresh process: the session rehydrates from disk.
    let alice = Engine::new("alice", fx.alice_store.clone(), fx.directory.clone());
    alice.initialize().await.unwrap();
    let second = alice.encrypt("c1", "bob", "er").await.unwrap();

    // The preamble was already emitted before the restart.
    let value: serde_json::Value = serde_json::from_str(&second).unwrap();
    assert!(value.get("x3dh").is_none());

    let a = fx.bob.decrypt("c1", "alice", &first).await.unwrap();
    let b = fx.bob.decrypt("c1", "alice", &second).await.unwrap();
    assert_eq!(plaintext_of(a), "safe");
    assert_eq!(plaintext_of(b), "er");
}

#[tokio::test]
async fn published_signed_prekey_signature_verifies() {
    let fx = initialized_pair().await;

    let identity = fx.directory.fetch_identity("bob").await.unwrap().unwrap();
    let prekey = fx.directory.fetch_signed_prekey("bob").await.unwrap().unwrap();

    let signing_key = SigningPublicKey::from_jwk(&identity.signing_key).unwrap();
    let prekey_public = DhPublicKey::from_jwk(&prekey.public_key).unwrap();
    let message = prekey_public.canonical_json().into_bytes();
    let signature = pairlock::crypto::b64_decode(&prekey.signature).unwrap();

    assert!(signing_key.verify(&message, &signature));

    let mut tampered = message.clone();
    tampered[10] ^= 1;
    assert!(!signing_key.verify(&tampered, &signature));
}

#[tokio::test]
async fn initiation_without_one_time_prekeys_still_works() {
    let fx = initialized_pair().await;

    // Exhaust Bob's published pool.
    while fx
        .directory
        .claim_one_time_prekey("bob")
        .await
        .unwrap()
        .is_some()
    {}

    let envelope = fx.alice.encrypt("c1", "bob", "no opk left").await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
    assert!(value["x3dh"].get("oneTimePreKeyId").is_none());

    let received = fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();
    assert_eq!(plaintext_of(received), "no opk left");
}

#[tokio::test]
async fn ratchet_envelope_without_session_is_no_session() {
    let fx = initialized_pair().await;

    fx.alice.encrypt("c1", "bob", "first").await.unwrap();
    let second = fx.alice.encrypt("c1", "bob", "second").await.unwrap();

    // Only the second message (no preamble) reaches Bob.
    let err = fx.bob.decrypt("c1", "alice", &second).await.unwrap_err();
    assert_eq!(err, Error::NoSession);
}

#[tokio::test]
async fn non_protocol_payload_passes_through() {
    let fx = initialized_pair().await;

    let received = fx.bob.decrypt("c1", "alice", "plain old text").await.unwrap();
    assert_eq!(
        received,
        Decrypted::NotEncrypted("plain old text".to_string())
    );
}

#[tokio::test]
async fn operations_before_initialize_fail_cleanly() {
    let directory = Arc::new(MemoryDirectory::new());
    let engine = Engine::new("carol", Arc::new(MemoryKeyStore::new()), directory);

    let err = engine.encrypt("c1", "bob", "hello").await.unwrap_err();
    assert_eq!(err, Error::NotInitialized);

    let envelope = "{\"v\":2,\"header\":{\"dh\":{},\"pn\":0,\"n\":0},\"ciphertext\":\"AA==\"}";
    let err = engine.decrypt("c1", "bob", envelope).await.unwrap_err();
    assert_eq!(err, Error::NotInitialized);
}

#[tokio::test]
async fn encrypt_to_unknown_user_is_bundle_unavailable() {
    let fx = initialized_pair().await;
    let err = fx.alice.encrypt("c1", "nobody", "hello").await.unwrap_err();
    assert_eq!(err, Error::BundleUnavailable);
}

#[tokio::test]
async fn has_session_tracks_lifecycle() {
    let fx = initialized_pair().await;

    assert!(!fx.alice.has_session("c1").await);
    let envelope = fx.alice.encrypt("c1", "bob", "hello").await.unwrap();
    assert!(fx.alice.has_session("c1").await);

    assert!(!fx.bob.has_session("c1").await);
    fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();
    assert!(fx.bob.has_session("c1").await);
}

#[tokio::test]
async fn clear_all_destroys_identity_and_sessions() {
    let fx = initialized_pair().await;

    let envelope = fx.alice.encrypt("c1", "bob", "hello").await.unwrap();
    fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();

    fx.bob.clear_all().await.unwrap();

    assert!(!fx.bob.has_session("c1").await);
    let err = fx.bob.encrypt("c2", "alice", "gone").await.unwrap_err();
    assert_eq!(err, Error::NotInitialized);
}

#[tokio::test]
async fn safety_numbers_agree_and_are_well_formed() {
    let fx = initialized_pair().await;

    let from_alice = fx.alice.safety_number("bob").await.unwrap();
    let from_bob = fx.bob.safety_number("alice").await.unwrap();
    assert_eq!(from_alice, from_bob);

    assert_eq!(from_alice.len(), 35);
    let groups: Vec<&str> = from_alice.split(' ').collect();
    assert_eq!(groups.len(), 6);
    for group in groups {
        assert_eq!(group.len(), 5);
        assert!(group.chars().all(|c| c.is_ascii_digit()));
    }
}

#[tokio::test]
async fn signed_prekey_rotates_after_seven_days() {
    let directory = Arc::new(MemoryDirectory::new());
    let store = Arc::new(MemoryKeyStore::new());
    let clock = TestClock::at(1_000_000);

    let engine = Engine::with_clock("dora", store.clone(), directory.clone(), clock.clone());
    engine.initialize().await.unwrap();
    assert_eq!(
        directory.fetch_signed_prekey("dora").await.unwrap().unwrap().key_id,
        1
    );

    // Within the window nothing rotates.
    clock.advance(6 * 24 * 60 * 60 * 1000);
    engine.initialize().await.unwrap();
    assert_eq!(
        directory.fetch_signed_prekey("dora").await.unwrap().unwrap().key_id,
        1
    );

    // Past seven days a new signed prekey is generated and published,
    // and the old one stays available locally.
    clock.advance(2 * 24 * 60 * 60 * 1000);
    engine.initialize().await.unwrap();
    assert_eq!(
        directory.fetch_signed_prekey("dora").await.unwrap().unwrap().key_id,
        2
    );
    assert!(store.get_signed_prekey("dora", 1).await.unwrap().is_some());
    assert!(store.get_signed_prekey("dora", 2).await.unwrap().is_some());
}

#[tokio::test]
async fn one_time_prekey_pool_refills_below_threshold() {
    let fx = initialized_pair().await;

    // Ten claims leave ten unused: exactly at the threshold, no refill.
    for _ in 0..10 {
        fx.directory.claim_one_time_prekey("bob").await.unwrap().unwrap();
    }
    fx.bob.initialize().await.unwrap();
    assert_eq!(
        fx.directory.unused_one_time_prekey_count("bob").await.unwrap(),
        10
    );

    // One more claim drops below it; the next check tops back up to 20.
    fx.directory.claim_one_time_prekey("bob").await.unwrap().unwrap();
    fx.bob.initialize().await.unwrap();
    assert_eq!(
        fx.directory.unused_one_time_prekey_count("bob").await.unwrap(),
        20
    );

    // Fresh ids continue after the original batch.
    assert!(fx.bob_store.get_one_time_prekey("bob", 21).await.unwrap().is_some());
}

#[tokio::test]
async fn republish_restores_a_wiped_directory_entry() {
    let fx = initialized_pair().await;

    // Simulate directory data loss by pointing a fresh engine at a fresh
    // directory with the same local store.
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Engine::new("alice", fx.alice_store.clone(), directory.clone());
    alice.initialize().await.unwrap();

    assert!(directory.fetch_identity("alice").await.unwrap().is_some());
    assert!(directory.fetch_signed_prekey("alice").await.unwrap().is_some());
    assert_eq!(
        directory.unused_one_time_prekey_count("alice").await.unwrap(),
        20
    );
}

#[tokio::test]
async fn concurrent_encrypts_on_one_conversation_are_serialized() {
    let fx = initialized_pair().await;

    // Prime the session so the fan-out below never races bundle claim.
    let first = fx.alice.encrypt("c1", "bob", "prime").await.unwrap();
    fx.bob.decrypt("c1", "alice", &first).await.unwrap();

    let alice = Arc::new(fx.alice);
    let mut handles = Vec::new();
    for i in 0..10 {
        let alice = alice.clone();
        handles.push(tokio::spawn(async move {
            alice.encrypt("c1", "bob", &format!("burst {i}")).await.unwrap()
        }));
    }

    let mut sequence_numbers = std::collections::HashSet::new();
    for handle in handles {
        let envelope = handle.await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&envelope).unwrap();
        // Strictly ordered ratchet states: every message gets a unique n.
        assert!(sequence_numbers.insert(value["header"]["n"].as_u64().unwrap()));
        let received = fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();
        assert!(plaintext_of(received).starts_with("burst"));
    }
    let expected: std::collections::HashSet<u64> = (1..=10).collect();
    assert_eq!(sequence_numbers, expected);
}

#[tokio::test]
async fn duplicate_first_message_recompletes_idempotently() {
    let fx = initialized_pair().await;

    let envelope = fx.alice.encrypt("c1", "bob", "hello").await.unwrap();
    let received = fx.bob.decrypt("c1", "alice", &envelope).await.unwrap();
    assert_eq!(plaintext_of(received), "hello");

    // The transport redelivers the first message. The session already
    // exists and its message key was consumed, so this is undecryptable,
    // but it must not corrupt the session.
    let err = fx.bob.decrypt("c1", "alice", &envelope).await.unwrap_err();
    assert_eq!(err, Error::Undecryptable);

    let next = fx.alice.encrypt("c1", "bob", "still fine").await.unwrap();
    let received = fx.bob.decrypt("c1", "alice", &next).await.unwrap();
    assert_eq!(plaintext_of(received), "still fine");
}
