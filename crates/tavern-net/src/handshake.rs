//! Mutual-auth, forward-secret handshake
//!
//! Each side presents its identity, key-exchange, and fresh ephemeral
//! public keys plus an Ed25519 signature binding them to the session id.
//! Four X25519 agreements feed a transcript-salted HKDF that yields one
//! send key and one receive key per side.

use crate::error::ChannelError;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tavern_core::crypto::{self, EphemeralKeyPair};
use tavern_core::identity::Identity;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// HKDF info label for session key derivation. Protocol-fixed.
const KEY_INFO: &[u8] = b"dndgame:p2p";

/// Handshake payload carried by both hello and ack frames
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    /// Fresh 16-byte session id chosen by the initiator
    pub session_id: Uuid,
    pub peer_id: String,
    pub device_name: String,
    /// Base64 Ed25519 identity public key
    pub identity_public_key: String,
    /// Base64 persistent X25519 public key
    pub key_exchange_public_key: String,
    /// Base64 fresh ephemeral X25519 public key
    pub ephemeral_public_key: String,
    /// Base64 Ed25519 signature over `session_id || ephemeral || key_exchange`
    pub signature: String,
}

/// A handshake counterpart whose identity checks passed
#[derive(Clone, Debug)]
pub struct VerifiedPeer {
    pub peer_id: String,
    pub device_name: String,
    pub identity_public_key: [u8; 32],
    pub key_exchange_public_key: [u8; 32],
    pub ephemeral_public_key: [u8; 32],
}

/// Which side of the handshake we are
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Directional AEAD keys for one channel; zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

fn sign_bytes(session_id: &Uuid, ephemeral: &[u8; 32], key_exchange: &[u8; 32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + 32 + 32);
    bytes.extend_from_slice(session_id.as_bytes());
    bytes.extend_from_slice(ephemeral);
    bytes.extend_from_slice(key_exchange);
    bytes
}

/// Build this side's handshake payload
pub fn build_payload(
    identity: &Identity,
    session_id: Uuid,
    ephemeral_public: &[u8; 32],
) -> HandshakePayload {
    let key_exchange = identity.key_exchange_public_key();
    let signature = identity.sign(&sign_bytes(&session_id, ephemeral_public, &key_exchange));
    HandshakePayload {
        session_id,
        peer_id: identity.peer_id().to_string(),
        device_name: identity.device_name().to_string(),
        identity_public_key: B64.encode(identity.identity_public_key()),
        key_exchange_public_key: B64.encode(key_exchange),
        ephemeral_public_key: B64.encode(ephemeral_public),
        signature: B64.encode(signature),
    }
}

fn decode_key(field: &str, value: &str) -> Result<[u8; 32], ChannelError> {
    let bytes = B64
        .decode(value)
        .map_err(|_| ChannelError::InvalidKey(field.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| ChannelError::InvalidKey(field.to_string()))
}

/// Verify a received handshake payload: the claimed peer id must equal the
/// fingerprint of the presented identity key, and the signature must verify
/// against that key.
pub fn verify_payload(payload: &HandshakePayload) -> Result<VerifiedPeer, ChannelError> {
    let identity_public_key = decode_key("identityPublicKey", &payload.identity_public_key)?;
    let key_exchange_public_key =
        decode_key("keyExchangePublicKey", &payload.key_exchange_public_key)?;
    let ephemeral_public_key = decode_key("ephemeralPublicKey", &payload.ephemeral_public_key)?;

    let computed = crypto::derive_peer_id(&identity_public_key);
    if computed != payload.peer_id {
        return Err(ChannelError::PeerIdentityMismatch {
            claimed: payload.peer_id.clone(),
            computed,
        });
    }

    let signature = B64
        .decode(&payload.signature)
        .map_err(|_| ChannelError::HandshakeSignatureInvalid)?;
    let signed = sign_bytes(
        &payload.session_id,
        &ephemeral_public_key,
        &key_exchange_public_key,
    );
    if !crypto::verify(&identity_public_key, &signed, &signature) {
        return Err(ChannelError::HandshakeSignatureInvalid);
    }

    Ok(VerifiedPeer {
        peer_id: payload.peer_id.clone(),
        device_name: payload.device_name.clone(),
        identity_public_key,
        key_exchange_public_key,
        ephemeral_public_key,
    })
}

/// Derive the directional session keys.
///
/// Four shared secrets (each X25519 then HKDF-expanded):
/// ephemeral-ephemeral, ephemeral-static, static-ephemeral, static-static.
/// The responder swaps the two mixed secrets so both sides concatenate the
/// same input key material. The HKDF salt is the SHA-256 transcript of the
/// exact hello and ack payload bytes as they crossed the wire.
pub fn derive_session_keys(
    role: Role,
    identity: &Identity,
    ephemeral: &EphemeralKeyPair,
    remote: &VerifiedPeer,
    hello_bytes: &[u8],
    ack_bytes: &[u8],
) -> SessionKeys {
    let s1 = ephemeral.shared_secret(&remote.ephemeral_public_key);
    let mut s2 = ephemeral.shared_secret(&remote.key_exchange_public_key);
    let mut s3 = identity.static_shared_secret(&remote.ephemeral_public_key);
    let s4 = identity.static_shared_secret(&remote.key_exchange_public_key);

    if role == Role::Responder {
        std::mem::swap(&mut s2, &mut s3);
    }

    let mut ikm = [0u8; 128];
    ikm[0..32].copy_from_slice(&s1);
    ikm[32..64].copy_from_slice(&s2);
    ikm[64..96].copy_from_slice(&s3);
    ikm[96..128].copy_from_slice(&s4);

    let mut transcript = Sha256::new();
    transcript.update(hello_bytes);
    transcript.update(ack_bytes);
    let salt = transcript.finalize();

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
    let mut okm = [0u8; 64];
    hkdf.expand(KEY_INFO, &mut okm)
        .expect("64 bytes is a valid HKDF-SHA-256 output length");

    let (first, second) = okm.split_at(32);
    let keys = match role {
        Role::Initiator => SessionKeys {
            send_key: first.try_into().expect("split at 32"),
            recv_key: second.try_into().expect("split at 32"),
        },
        Role::Responder => SessionKeys {
            send_key: second.try_into().expect("split at 32"),
            recv_key: first.try_into().expect("split at 32"),
        },
    };

    ikm.zeroize();
    okm.zeroize();
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tavern_core::identity::{IdentityManager, MemorySecureStore};

    async fn identity(name: &str) -> Arc<Identity> {
        IdentityManager::new(Arc::new(MemorySecureStore::new()), Some(name.into()))
            .initialize()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_payload_verifies() {
        let alice = identity("Alice").await;
        let eph = EphemeralKeyPair::generate();
        let payload = build_payload(&alice, Uuid::new_v4(), &eph.public_key());

        let verified = verify_payload(&payload).unwrap();
        assert_eq!(verified.peer_id, alice.peer_id());
        assert_eq!(verified.identity_public_key, alice.identity_public_key());
    }

    #[tokio::test]
    async fn test_wrong_peer_id_rejected() {
        let alice = identity("Alice").await;
        let eph = EphemeralKeyPair::generate();
        let mut payload = build_payload(&alice, Uuid::new_v4(), &eph.public_key());
        payload.peer_id = "0000000000".into();

        assert!(matches!(
            verify_payload(&payload),
            Err(ChannelError::PeerIdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let alice = identity("Alice").await;
        let eph = EphemeralKeyPair::generate();
        let mut payload = build_payload(&alice, Uuid::new_v4(), &eph.public_key());
        payload.signature = B64.encode([0u8; 64]);

        assert!(matches!(
            verify_payload(&payload),
            Err(ChannelError::HandshakeSignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_swapped_ephemeral_breaks_signature() {
        let alice = identity("Alice").await;
        let eph = EphemeralKeyPair::generate();
        let other = EphemeralKeyPair::generate();
        let mut payload = build_payload(&alice, Uuid::new_v4(), &eph.public_key());
        payload.ephemeral_public_key = B64.encode(other.public_key());

        assert!(matches!(
            verify_payload(&payload),
            Err(ChannelError::HandshakeSignatureInvalid)
        ));
    }

    #[tokio::test]
    async fn test_both_sides_derive_matching_keys() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let session_id = Uuid::new_v4();

        let alice_eph = EphemeralKeyPair::generate();
        let bob_eph = EphemeralKeyPair::generate();

        let hello = build_payload(&alice, session_id, &alice_eph.public_key());
        let ack = build_payload(&bob, session_id, &bob_eph.public_key());
        let hello_bytes = serde_json::to_vec(&hello).unwrap();
        let ack_bytes = serde_json::to_vec(&ack).unwrap();

        let bob_view = verify_payload(&ack).unwrap();
        let alice_view = verify_payload(&hello).unwrap();

        let alice_keys = derive_session_keys(
            Role::Initiator,
            &alice,
            &alice_eph,
            &bob_view,
            &hello_bytes,
            &ack_bytes,
        );
        let bob_keys = derive_session_keys(
            Role::Responder,
            &bob,
            &bob_eph,
            &alice_view,
            &hello_bytes,
            &ack_bytes,
        );

        assert_eq!(alice_keys.send_key, bob_keys.recv_key);
        assert_eq!(alice_keys.recv_key, bob_keys.send_key);
        assert_ne!(alice_keys.send_key, alice_keys.recv_key);
    }

    #[tokio::test]
    async fn test_transcript_binds_keys() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let session_id = Uuid::new_v4();

        let alice_eph = EphemeralKeyPair::generate();
        let bob_eph = EphemeralKeyPair::generate();

        let hello = build_payload(&alice, session_id, &alice_eph.public_key());
        let ack = build_payload(&bob, session_id, &bob_eph.public_key());
        let hello_bytes = serde_json::to_vec(&hello).unwrap();
        let ack_bytes = serde_json::to_vec(&ack).unwrap();

        let bob_view = verify_payload(&ack).unwrap();
        let a = derive_session_keys(
            Role::Initiator,
            &alice,
            &alice_eph,
            &bob_view,
            &hello_bytes,
            &ack_bytes,
        );
        // Same secrets, different transcript
        let b = derive_session_keys(
            Role::Initiator,
            &alice,
            &alice_eph,
            &bob_view,
            &hello_bytes,
            b"different ack",
        );
        assert_ne!(a.send_key, b.send_key);
    }
}
