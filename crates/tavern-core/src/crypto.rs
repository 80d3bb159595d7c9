//! Cryptographic primitives: signatures, key agreement, peer fingerprints
//!
//! Peer ids are short fingerprints of Ed25519 identity keys. Key agreement
//! is X25519 followed by HKDF-SHA-256; raw DH output is never used directly.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, ReusableSecret, StaticSecret};

/// Base32 alphabet for peer-id rendering (Crockford, no I/L/O/U)
const PEER_ID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Number of fingerprint bytes folded into the peer id
const PEER_ID_BYTES: usize = 6;

/// Rendered peer-id length in characters
pub const PEER_ID_LEN: usize = 10;

/// Derive the textual peer id from an Ed25519 identity public key.
///
/// Base32 of the leading 6 bytes of SHA-256(identity_public_key), rendered
/// as 10 uppercase characters. Two identity keys mapping to the same peer id
/// is treated as a collision and fails verification at the handshake layer.
pub fn derive_peer_id(identity_public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(identity_public_key);
    base32_fingerprint(&digest[..PEER_ID_BYTES])
}

fn base32_fingerprint(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(PEER_ID_LEN);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(PEER_ID_ALPHABET[((acc >> bits) & 0x1F) as usize] as char);
        }
    }
    // Trailing partial group, zero-padded on the right
    if bits > 0 {
        out.push(PEER_ID_ALPHABET[((acc << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

/// Generate a fresh Ed25519 signing key
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Generate a fresh persistent X25519 secret
pub fn generate_agreement_key() -> StaticSecret {
    StaticSecret::random_from_rng(OsRng)
}

/// Detached Ed25519 signature over `data`
pub fn sign(key: &SigningKey, data: &[u8]) -> [u8; 64] {
    key.sign(data).to_bytes()
}

/// Verify an Ed25519 signature. Returns false on any parse or verify
/// failure; malformed keys and signatures never propagate as errors.
pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verifying_key
        .verify(data, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

/// Ephemeral X25519 keypair for one handshake.
///
/// The secret supports the multiple DH operations of the key schedule and is
/// zeroized when dropped.
pub struct EphemeralKeyPair {
    secret: ReusableSecret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let secret = ReusableSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// X25519 DH with a remote public key, expanded through HKDF
    pub fn shared_secret(&self, remote_public: &[u8; 32]) -> [u8; 32] {
        let remote = X25519Public::from(*remote_public);
        expand_shared(self.secret.diffie_hellman(&remote).as_bytes())
    }
}

/// X25519 DH with a persistent secret, expanded through HKDF
pub fn static_shared_secret(secret: &StaticSecret, remote_public: &[u8; 32]) -> [u8; 32] {
    let remote = X25519Public::from(*remote_public);
    expand_shared(secret.diffie_hellman(&remote).as_bytes())
}

/// HKDF-SHA-256 extract/expand with empty salt and empty info, 32-byte
/// output. Protocol-fixed; changing salt or info is a new wire version.
fn expand_shared(dh_output: &[u8; 32]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, dh_output);
    let mut okm = [0u8; 32];
    hkdf.expand(&[], &mut okm)
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    okm
}
