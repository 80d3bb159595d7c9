//! Persistent device identity
//!
//! Each device owns an Ed25519 signing keypair and an X25519 key-agreement
//! keypair, both persisted as base64 blobs in the embedding application's
//! secure storage. The peer id is derived from the signing public key and is
//! immutable for the lifetime of the identity.

use crate::crypto;
use crate::error::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

const SIGNING_KEY_SLOT: &str = "tavern.identity.signing";
const AGREEMENT_KEY_SLOT: &str = "tavern.identity.agreement";
const DEVICE_NAME_SLOT: &str = "tavern.identity.device_name";

/// Secure key/value storage supplied by the embedding application
#[async_trait]
pub trait SecureStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-process secure store for tests and first-run flows
#[derive(Default)]
pub struct MemorySecureStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureStore for MemorySecureStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Public face of a device identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub peer_id: String,
    pub device_name: String,
    pub identity_public_key: [u8; 32],
    pub key_exchange_public_key: [u8; 32],
}

/// A device's key material plus derived identity.
///
/// Private keys live for the process lifetime once initialized; the X25519
/// secret zeroizes on drop via its own drop impl.
pub struct Identity {
    signing_key: SigningKey,
    agreement_secret: StaticSecret,
    device: DeviceIdentity,
}

impl Identity {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device
    }

    pub fn peer_id(&self) -> &str {
        &self.device.peer_id
    }

    pub fn device_name(&self) -> &str {
        &self.device.device_name
    }

    pub fn identity_public_key(&self) -> [u8; 32] {
        self.device.identity_public_key
    }

    pub fn key_exchange_public_key(&self) -> [u8; 32] {
        self.device.key_exchange_public_key
    }

    /// Detached Ed25519 signature with the identity key
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        crypto::sign(&self.signing_key, data)
    }

    /// X25519+HKDF shared secret using the persistent agreement key
    pub fn static_shared_secret(&self, remote_public: &[u8; 32]) -> [u8; 32] {
        crypto::static_shared_secret(&self.agreement_secret, remote_public)
    }
}

/// Loads or creates the device identity exactly once per process.
///
/// Double-initialize returns the already-built identity immediately; the
/// first failure is not latched, so a transient storage error can be
/// retried.
pub struct IdentityManager {
    store: Arc<dyn SecureStore>,
    device_name: Option<String>,
    cell: OnceCell<Arc<Identity>>,
}

impl IdentityManager {
    /// `device_name` overrides any stored name when supplied
    pub fn new(store: Arc<dyn SecureStore>, device_name: Option<String>) -> Self {
        Self {
            store,
            device_name,
            cell: OnceCell::new(),
        }
    }

    /// Idempotent initialization: load the persisted keypairs, generating
    /// and persisting fresh ones on first run. Corrupt blobs are discarded
    /// and regenerated with a warning.
    pub async fn initialize(&self) -> Result<Arc<Identity>> {
        self.cell
            .get_or_try_init(|| async { self.load_or_create().await.map(Arc::new) })
            .await
            .cloned()
    }

    /// The identity, if initialize has completed
    pub fn get(&self) -> Option<Arc<Identity>> {
        self.cell.get().cloned()
    }

    async fn load_or_create(&self) -> Result<Identity> {
        let signing_key = match self.load_key_bytes(SIGNING_KEY_SLOT).await? {
            Some(seed) => SigningKey::from_bytes(&seed),
            None => {
                let key = crypto::generate_signing_key();
                self.store
                    .set(SIGNING_KEY_SLOT, &B64.encode(key.to_bytes()))
                    .await?;
                key
            }
        };

        let agreement_secret = match self.load_key_bytes(AGREEMENT_KEY_SLOT).await? {
            Some(seed) => StaticSecret::from(seed),
            None => {
                let secret = crypto::generate_agreement_key();
                self.store
                    .set(AGREEMENT_KEY_SLOT, &B64.encode(secret.to_bytes()))
                    .await?;
                secret
            }
        };

        let identity_public_key = signing_key.verifying_key().to_bytes();
        let key_exchange_public_key = X25519Public::from(&agreement_secret).to_bytes();
        let peer_id = crypto::derive_peer_id(&identity_public_key);

        let device_name = match &self.device_name {
            Some(name) => {
                self.store.set(DEVICE_NAME_SLOT, name).await?;
                name.clone()
            }
            None => match self.store.get(DEVICE_NAME_SLOT).await? {
                Some(name) if !name.is_empty() => name,
                _ => {
                    let fallback = format!("Peer-{}", &peer_id[..4]);
                    self.store.set(DEVICE_NAME_SLOT, &fallback).await?;
                    fallback
                }
            },
        };

        Ok(Identity {
            signing_key,
            agreement_secret,
            device: DeviceIdentity {
                peer_id,
                device_name,
                identity_public_key,
                key_exchange_public_key,
            },
        })
    }

    /// Read a 32-byte base64 key blob; a present-but-corrupt blob is
    /// removed so a fresh key is generated in its place.
    async fn load_key_bytes(&self, slot: &str) -> Result<Option<[u8; 32]>> {
        let Some(blob) = self.store.get(slot).await? else {
            return Ok(None);
        };
        match B64.decode(&blob) {
            Ok(bytes) if bytes.len() == 32 => {
                let mut out = [0u8; 32];
                out.copy_from_slice(&bytes);
                Ok(Some(out))
            }
            _ => {
                warn!(slot, "discarding corrupt key blob, regenerating");
                self.store.remove(slot).await?;
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("peer_id", &self.device.peer_id)
            .field("device_name", &self.device.device_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_run_generates_and_persists() {
        let store = Arc::new(MemorySecureStore::new());
        let manager = IdentityManager::new(store.clone(), Some("Game Table".into()));

        let identity = manager.initialize().await.unwrap();
        assert_eq!(identity.device_name(), "Game Table");
        assert_eq!(identity.peer_id().len(), crate::crypto::PEER_ID_LEN);
        assert!(store.get(SIGNING_KEY_SLOT).await.unwrap().is_some());
        assert!(store.get(AGREEMENT_KEY_SLOT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let store = Arc::new(MemorySecureStore::new());
        let manager = IdentityManager::new(store, None);

        let first = manager.initialize().await.unwrap();
        let second = manager.initialize().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_reload_preserves_identity() {
        let store = Arc::new(MemorySecureStore::new());

        let first = IdentityManager::new(store.clone(), None)
            .initialize()
            .await
            .unwrap();
        let second = IdentityManager::new(store, None).initialize().await.unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.identity_public_key(), second.identity_public_key());
        assert_eq!(
            first.key_exchange_public_key(),
            second.key_exchange_public_key()
        );
    }

    #[tokio::test]
    async fn test_corrupt_blob_regenerated() {
        let store = Arc::new(MemorySecureStore::new());
        store.set(SIGNING_KEY_SLOT, "not base64 at all!").await.unwrap();

        let identity = IdentityManager::new(store.clone(), None)
            .initialize()
            .await
            .unwrap();

        // Fresh valid blob written in place of the corrupt one
        let blob = store.get(SIGNING_KEY_SLOT).await.unwrap().unwrap();
        assert_eq!(B64.decode(blob).unwrap().len(), 32);
        assert_eq!(identity.peer_id().len(), crate::crypto::PEER_ID_LEN);
    }

    #[tokio::test]
    async fn test_fallback_device_name() {
        let store = Arc::new(MemorySecureStore::new());
        let identity = IdentityManager::new(store, None).initialize().await.unwrap();
        assert!(identity.device_name().starts_with("Peer-"));
        assert_eq!(identity.device_name().len(), 9);
    }

    #[tokio::test]
    async fn test_sign_matches_identity_key() {
        let store = Arc::new(MemorySecureStore::new());
        let identity = IdentityManager::new(store, None).initialize().await.unwrap();

        let sig = identity.sign(b"attack roll");
        assert!(crypto::verify(
            &identity.identity_public_key(),
            b"attack roll",
            &sig
        ));
    }
}
