//! Authenticated, forward-secret channel between two peers
//!
//! After the handshake, every data frame is AES-256-GCM sealed with the
//! session id as associated data and a counter nonce. The receive side
//! enforces anti-replay (strict high-water mark plus a 64-entry recent
//! set). Cryptographic failures and replays are surfaced on the event
//! channel without tearing the connection down; Close does.

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::framing::{Frame, FrameCode, FrameCodec, FrameError};
use crate::handshake::{self, HandshakePayload, Role, SessionKeys, VerifiedPeer};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tavern_core::crypto::EphemeralKeyPair;
use tavern_core::identity::Identity;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// seq(8) || nonce(12) || cipher_len(4)
const DATA_HEADER_LEN: usize = 24;
/// AES-GCM 128-bit tag
const TAG_LEN: usize = 16;
/// Anti-replay recent-set size
const REPLAY_WINDOW: u64 = 64;
/// Outbound frame queue depth; producers back-pressure on this
const OUTBOUND_QUEUE: usize = 64;

/// Why a frame was dropped by the receive path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecurityReason {
    /// AEAD open failed
    CryptographicFailure,
    /// Sequence already seen or outside the replay window
    ReplayDetected(u64),
    /// Frame structure did not parse
    MalformedFrame,
    /// Frame code outside the enumerated set
    UnknownFrame(u8),
}

impl std::fmt::Display for SecurityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CryptographicFailure => write!(f, "cryptographic failure"),
            Self::ReplayDetected(seq) => write!(f, "replay detected (sequence {seq})"),
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::UnknownFrame(code) => write!(f, "unknown frame code {code}"),
        }
    }
}

/// Events surfaced to the channel's consumer
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    /// Decrypted application payload from the peer
    Message { peer_id: String, payload: Vec<u8> },
    /// The peer closed or the pipe broke
    PeerDisconnected { peer_id: String },
    /// A frame was dropped for security reasons; the channel stays up
    SecurityAlert {
        peer_id: String,
        reason: SecurityReason,
    },
}

/// Receive-side anti-replay state: strict high-water mark plus a bounded
/// de-dup set covering the last [`REPLAY_WINDOW`] accepted sequences.
#[derive(Debug, Default)]
struct ReplayGuard {
    highest: u64,
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl ReplayGuard {
    fn permits(&self, sequence: u64) -> bool {
        if sequence > self.highest {
            return true;
        }
        self.highest - sequence < REPLAY_WINDOW && !self.seen.contains(&sequence)
    }

    fn record(&mut self, sequence: u64) {
        if sequence > self.highest {
            self.highest = sequence;
        }
        self.seen.insert(sequence);
        self.order.push_back(sequence);
        while self.order.len() > REPLAY_WINDOW as usize {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

struct ChannelShared {
    peer_id: String,
    aad: [u8; 16],
    nonce_salt: [u8; 4],
    send_cipher: Aes256Gcm,
    send_seq: AtomicU64,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    outbound: mpsc::Sender<Frame>,
    lifetime: CancellationToken,
    config: ChannelConfig,
}

/// An established secure channel.
///
/// `send` suspends until the peer acks the frame. Inbound traffic and
/// security alerts arrive on the event receiver handed to
/// [`SecureChannel::connect`]/[`SecureChannel::accept`]. Dropping the
/// channel stops both IO tasks; the AEAD instances die with it.
pub struct SecureChannel {
    device_name: String,
    session_id: Uuid,
    shared: Arc<ChannelShared>,
}

impl SecureChannel {
    /// Initiate a handshake over `io` and establish the channel
    pub async fn connect<T>(
        io: T,
        identity: Arc<Identity>,
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Self, ChannelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        let session_id = Uuid::new_v4();
        let ephemeral = EphemeralKeyPair::generate();

        let hello = handshake::build_payload(&identity, session_id, &ephemeral.public_key());
        let hello_bytes = serde_json::to_vec(&hello)?;
        framed
            .send(Frame::new(FrameCode::HandshakeHello, hello_bytes.clone()))
            .await?;

        let frame = next_frame(&mut framed).await?;
        if frame.code != FrameCode::HandshakeAck {
            return Err(ChannelError::UnexpectedFrame(frame.code));
        }
        let ack_bytes = frame.payload;
        let ack: HandshakePayload = serde_json::from_slice(&ack_bytes)?;
        if ack.session_id != session_id {
            return Err(ChannelError::SessionMismatch);
        }
        let remote = handshake::verify_payload(&ack)?;
        let keys = handshake::derive_session_keys(
            Role::Initiator,
            &identity,
            &ephemeral,
            &remote,
            &hello_bytes,
            &ack_bytes,
        );

        Ok(Self::establish(framed, session_id, remote, keys, config, events))
    }

    /// Answer a handshake over `io` and establish the channel
    pub async fn accept<T>(
        io: T,
        identity: Arc<Identity>,
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<Self, ChannelError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());

        let frame = next_frame(&mut framed).await?;
        if frame.code != FrameCode::HandshakeHello {
            return Err(ChannelError::UnexpectedFrame(frame.code));
        }
        let hello_bytes = frame.payload;
        let hello: HandshakePayload = serde_json::from_slice(&hello_bytes)?;
        let session_id = hello.session_id;
        let remote = handshake::verify_payload(&hello)?;

        let ephemeral = EphemeralKeyPair::generate();
        let ack = handshake::build_payload(&identity, session_id, &ephemeral.public_key());
        let ack_bytes = serde_json::to_vec(&ack)?;
        framed
            .send(Frame::new(FrameCode::HandshakeAck, ack_bytes.clone()))
            .await?;

        let keys = handshake::derive_session_keys(
            Role::Responder,
            &identity,
            &ephemeral,
            &remote,
            &hello_bytes,
            &ack_bytes,
        );

        Ok(Self::establish(framed, session_id, remote, keys, config, events))
    }

    fn establish<T>(
        framed: Framed<T, FrameCodec>,
        session_id: Uuid,
        remote: VerifiedPeer,
        keys: SessionKeys,
        config: ChannelConfig,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let send_cipher = Aes256Gcm::new_from_slice(&keys.send_key)
            .expect("32-byte AES-256-GCM key");
        let recv_cipher = Aes256Gcm::new_from_slice(&keys.recv_key)
            .expect("32-byte AES-256-GCM key");
        drop(keys); // zeroized

        let mut nonce_salt = [0u8; 4];
        OsRng.fill_bytes(&mut nonce_salt);

        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let lifetime = CancellationToken::new();

        let shared = Arc::new(ChannelShared {
            peer_id: remote.peer_id.clone(),
            aad: *session_id.as_bytes(),
            nonce_salt,
            send_cipher,
            send_seq: AtomicU64::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            outbound: outbound_tx,
            lifetime: lifetime.clone(),
            config,
        });

        tokio::spawn(write_loop(sink, outbound_rx, lifetime.clone()));
        tokio::spawn(read_loop(
            stream,
            recv_cipher,
            shared.clone(),
            events,
            lifetime,
        ));

        debug!(peer_id = %remote.peer_id, %session_id, "secure channel established");
        Self {
            device_name: remote.device_name,
            session_id,
            shared,
        }
    }

    /// The authenticated peer's id
    pub fn peer_id(&self) -> &str {
        &self.shared.peer_id
    }

    /// The authenticated peer's device name
    pub fn peer_device_name(&self) -> &str {
        &self.device_name
    }

    /// The 16-byte session id negotiated at handshake
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Seal and send a payload, then wait for the peer's ack.
    ///
    /// A timeout yields `AckTimeout` and cancellation yields `Cancelled`;
    /// in both cases the frame may still have been delivered, so callers
    /// must treat retries as idempotent (event import already is).
    pub async fn send(
        &self,
        plaintext: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        let shared = &self.shared;
        let sequence = shared.send_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&shared.nonce_salt);
        nonce[4..].copy_from_slice(&sequence.to_be_bytes());

        let sealed = shared
            .send_cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &shared.aad,
                },
            )
            .map_err(|_| ChannelError::CryptographicFailure)?;

        let cipher_len = (sealed.len() - TAG_LEN) as u32;
        let mut payload = Vec::with_capacity(DATA_HEADER_LEN + sealed.len());
        payload.extend_from_slice(&sequence.to_be_bytes());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&cipher_len.to_be_bytes());
        payload.extend_from_slice(&sealed);

        let (ack_tx, ack_rx) = oneshot::channel();
        shared.pending_acks.lock().insert(sequence, ack_tx);

        if shared
            .outbound
            .send(Frame::new(FrameCode::Data, payload))
            .await
            .is_err()
        {
            shared.pending_acks.lock().remove(&sequence);
            return Err(ChannelError::ConnectionClosed);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
            acked = tokio::time::timeout(shared.config.ack_timeout, ack_rx) => match acked {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ChannelError::ConnectionClosed),
                Err(_) => Err(ChannelError::AckTimeout(sequence)),
            },
        };
        if outcome.is_err() {
            shared.pending_acks.lock().remove(&sequence);
        }
        outcome
    }

    /// Send a keepalive frame
    pub async fn heartbeat(&self) -> Result<(), ChannelError> {
        self.shared
            .outbound
            .send(Frame::heartbeat())
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Send Close and stop both IO tasks
    pub async fn close(&self) {
        let _ = self.shared.outbound.send(Frame::close()).await;
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.shared.lifetime.cancel();
    }
}

async fn next_frame<T>(framed: &mut Framed<T, FrameCodec>) -> Result<Frame, ChannelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(e.into()),
        None => Err(ChannelError::ConnectionClosed),
    }
}

async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, FrameCodec>, Frame>,
    mut outbound: mpsc::Receiver<Frame>,
    lifetime: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let closing = frame.code == FrameCode::Close;
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                    if closing {
                        let _ = sink.flush().await;
                        lifetime.cancel();
                        break;
                    }
                }
                None => break,
            },
            _ = lifetime.cancelled() => break,
        }
    }
}

async fn read_loop<T>(
    mut stream: SplitStream<Framed<T, FrameCodec>>,
    recv_cipher: Aes256Gcm,
    shared: Arc<ChannelShared>,
    events: mpsc::Sender<ChannelEvent>,
    lifetime: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut replay = ReplayGuard::default();
    let peer_id = shared.peer_id.clone();

    loop {
        let item = tokio::select! {
            _ = lifetime.cancelled() => break,
            item = stream.next() => item,
        };

        match item {
            None => {
                let _ = events
                    .send(ChannelEvent::PeerDisconnected {
                        peer_id: peer_id.clone(),
                    })
                    .await;
                break;
            }
            Some(Err(FrameError::UnknownFrame(code))) => {
                let _ = events
                    .send(ChannelEvent::SecurityAlert {
                        peer_id: peer_id.clone(),
                        reason: SecurityReason::UnknownFrame(code),
                    })
                    .await;
            }
            Some(Err(e)) => {
                warn!(peer_id = %peer_id, error = %e, "frame stream error, closing");
                let _ = events
                    .send(ChannelEvent::PeerDisconnected {
                        peer_id: peer_id.clone(),
                    })
                    .await;
                break;
            }
            Some(Ok(frame)) => match frame.code {
                FrameCode::Data => {
                    handle_data(
                        &frame.payload,
                        &recv_cipher,
                        &shared,
                        &mut replay,
                        &events,
                    )
                    .await;
                }
                FrameCode::Ack => {
                    if let Ok(bytes) = <[u8; 8]>::try_from(frame.payload.as_slice()) {
                        let sequence = u64::from_be_bytes(bytes);
                        if let Some(ack_tx) = shared.pending_acks.lock().remove(&sequence) {
                            let _ = ack_tx.send(());
                        }
                    }
                }
                FrameCode::Close => {
                    let _ = events
                        .send(ChannelEvent::PeerDisconnected {
                            peer_id: peer_id.clone(),
                        })
                        .await;
                    break;
                }
                FrameCode::Heartbeat => {}
                FrameCode::HandshakeHello | FrameCode::HandshakeAck => {
                    debug!(peer_id = %peer_id, "ignoring handshake frame on established channel");
                }
            },
        }
    }

    lifetime.cancel();
}

async fn handle_data(
    payload: &[u8],
    recv_cipher: &Aes256Gcm,
    shared: &ChannelShared,
    replay: &mut ReplayGuard,
    events: &mpsc::Sender<ChannelEvent>,
) {
    let alert = |reason: SecurityReason| ChannelEvent::SecurityAlert {
        peer_id: shared.peer_id.clone(),
        reason,
    };

    if payload.len() < DATA_HEADER_LEN + TAG_LEN {
        let _ = events.send(alert(SecurityReason::MalformedFrame)).await;
        return;
    }

    let sequence = u64::from_be_bytes(payload[0..8].try_into().expect("8-byte slice"));
    let nonce = &payload[8..20];
    let cipher_len =
        u32::from_be_bytes(payload[20..24].try_into().expect("4-byte slice")) as usize;

    // The nonce's trailing 8 bytes must restate the sequence
    if payload.len() != DATA_HEADER_LEN + cipher_len + TAG_LEN
        || nonce[4..12] != sequence.to_be_bytes()
    {
        let _ = events.send(alert(SecurityReason::MalformedFrame)).await;
        return;
    }

    if !replay.permits(sequence) {
        let _ = events
            .send(alert(SecurityReason::ReplayDetected(sequence)))
            .await;
        return;
    }

    let opened = recv_cipher.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: &payload[DATA_HEADER_LEN..],
            aad: &shared.aad,
        },
    );

    match opened {
        Ok(plaintext) => {
            replay.record(sequence);
            let _ = events
                .send(ChannelEvent::Message {
                    peer_id: shared.peer_id.clone(),
                    payload: plaintext,
                })
                .await;
            let _ = shared.outbound.send(Frame::ack(sequence)).await;
        }
        Err(_) => {
            let _ = events.send(alert(SecurityReason::CryptographicFailure)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tavern_core::identity::{IdentityManager, MemorySecureStore};

    async fn identity(name: &str) -> Arc<Identity> {
        IdentityManager::new(Arc::new(MemorySecureStore::new()), Some(name.into()))
            .initialize()
            .await
            .unwrap()
    }

    fn quick_config() -> ChannelConfig {
        ChannelConfig {
            ack_timeout: Duration::from_millis(500),
            ..ChannelConfig::default()
        }
    }

    async fn channel_pair() -> (
        SecureChannel,
        mpsc::Receiver<ChannelEvent>,
        SecureChannel,
        mpsc::Receiver<ChannelEvent>,
    ) {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let (alice_events_tx, alice_events) = mpsc::channel(16);
        let (bob_events_tx, bob_events) = mpsc::channel(16);

        let accept = tokio::spawn(SecureChannel::accept(
            bob_io,
            bob,
            quick_config(),
            bob_events_tx,
        ));
        let alice_channel =
            SecureChannel::connect(alice_io, alice, quick_config(), alice_events_tx)
                .await
                .unwrap();
        let bob_channel = accept.await.unwrap().unwrap();

        (alice_channel, alice_events, bob_channel, bob_events)
    }

    #[test]
    fn test_replay_guard_strict_and_windowed() {
        let mut guard = ReplayGuard::default();
        assert!(guard.permits(1));
        guard.record(1);
        assert!(!guard.permits(1));

        guard.record(10);
        // Unseen sequence inside the window is admitted once
        assert!(guard.permits(5));
        guard.record(5);
        assert!(!guard.permits(5));

        // Far behind the high-water mark is rejected outright
        guard.record(500);
        assert!(!guard.permits(400));
        assert!(guard.permits(501));
    }

    #[test]
    fn test_replay_guard_set_is_bounded() {
        let mut guard = ReplayGuard::default();
        for seq in 1..=200u64 {
            guard.record(seq);
        }
        assert!(guard.seen.len() <= REPLAY_WINDOW as usize);
        assert_eq!(guard.highest, 200);
    }

    #[tokio::test]
    async fn test_roundtrip_and_ack() {
        let (alice, _alice_events, _bob, mut bob_events) = channel_pair().await;
        assert_eq!(alice.peer_id().len(), 10);

        let cancel = CancellationToken::new();
        alice.send(b"roll for initiative", &cancel).await.unwrap();

        match bob_events.recv().await.unwrap() {
            ChannelEvent::Message { payload, .. } => {
                assert_eq!(payload, b"roll for initiative")
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bidirectional_traffic() {
        let (alice, mut alice_events, bob, mut bob_events) = channel_pair().await;
        let cancel = CancellationToken::new();

        alice.send(b"ping", &cancel).await.unwrap();
        bob.send(b"pong", &cancel).await.unwrap();

        assert!(matches!(
            bob_events.recv().await.unwrap(),
            ChannelEvent::Message { .. }
        ));
        assert!(matches!(
            alice_events.recv().await.unwrap(),
            ChannelEvent::Message { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_emits_disconnect() {
        let (alice, _alice_events, _bob, mut bob_events) = channel_pair().await;
        alice.close().await;

        match bob_events.recv().await.unwrap() {
            ChannelEvent::PeerDisconnected { peer_id } => assert_eq!(peer_id.len(), 10),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_send() {
        let (alice, _alice_events, bob, _bob_events) = channel_pair().await;
        // Silence the responder so no ack ever comes
        drop(bob);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = alice.send(b"never acked", &cancel).await;
        assert!(matches!(result, Err(ChannelError::Cancelled)));
        assert!(alice.shared.pending_acks.lock().is_empty());
    }

    /// Manual wire peer: completes the responder handshake by hand so tests
    /// can inject raw frames (replays, tampered ciphertext) at the Data
    /// layer.
    struct RawPeer {
        framed: Framed<tokio::io::DuplexStream, FrameCodec>,
        keys: SessionKeys,
        aad: [u8; 16],
        next_seq: u64,
    }

    impl RawPeer {
        async fn respond(io: tokio::io::DuplexStream, identity: &Identity) -> Self {
            let mut framed = Framed::new(io, FrameCodec::new());
            let hello_frame = next_frame(&mut framed).await.unwrap();
            let hello: HandshakePayload =
                serde_json::from_slice(&hello_frame.payload).unwrap();
            let remote = handshake::verify_payload(&hello).unwrap();

            let ephemeral = EphemeralKeyPair::generate();
            let ack = handshake::build_payload(identity, hello.session_id, &ephemeral.public_key());
            let ack_bytes = serde_json::to_vec(&ack).unwrap();
            framed
                .send(Frame::new(FrameCode::HandshakeAck, ack_bytes.clone()))
                .await
                .unwrap();

            let keys = handshake::derive_session_keys(
                Role::Responder,
                identity,
                &ephemeral,
                &remote,
                &hello_frame.payload,
                &ack_bytes,
            );
            Self {
                framed,
                keys,
                aad: *hello.session_id.as_bytes(),
                next_seq: 0,
            }
        }

        fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
            self.next_seq += 1;
            self.seal_with_seq(plaintext, self.next_seq)
        }

        fn seal_with_seq(&self, plaintext: &[u8], sequence: u64) -> Vec<u8> {
            let cipher = Aes256Gcm::new_from_slice(&self.keys.send_key).unwrap();
            let mut nonce = [0u8; 12];
            nonce[..4].copy_from_slice(&[7, 7, 7, 7]);
            nonce[4..].copy_from_slice(&sequence.to_be_bytes());
            let sealed = cipher
                .encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: plaintext,
                        aad: &self.aad,
                    },
                )
                .unwrap();
            let mut payload = Vec::new();
            payload.extend_from_slice(&sequence.to_be_bytes());
            payload.extend_from_slice(&nonce);
            payload.extend_from_slice(&((sealed.len() - TAG_LEN) as u32).to_be_bytes());
            payload.extend_from_slice(&sealed);
            payload
        }

        async fn send_raw(&mut self, payload: Vec<u8>) {
            self.framed
                .send(Frame::new(FrameCode::Data, payload))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_replayed_frame_rejected_but_channel_lives() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let (events_tx, mut events) = mpsc::channel(16);

        let responder = tokio::spawn(async move { RawPeer::respond(bob_io, &bob).await });
        let _channel = SecureChannel::connect(alice_io, alice, quick_config(), events_tx)
            .await
            .unwrap();
        let mut peer = responder.await.unwrap();

        let frame = peer.seal(b"first");
        peer.send_raw(frame.clone()).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Message { .. }
        ));

        // Exact replay of sequence 1
        peer.send_raw(frame).await;
        match events.recv().await.unwrap() {
            ChannelEvent::SecurityAlert { reason, .. } => {
                assert_eq!(reason, SecurityReason::ReplayDetected(1))
            }
            other => panic!("expected replay alert, got {other:?}"),
        }

        // Channel still delivers fresh traffic
        let fresh = peer.seal(b"second");
        peer.send_raw(fresh).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            ChannelEvent::Message { .. }
        ));
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_rejected() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let (events_tx, mut events) = mpsc::channel(16);

        let responder = tokio::spawn(async move { RawPeer::respond(bob_io, &bob).await });
        let _channel = SecureChannel::connect(alice_io, alice, quick_config(), events_tx)
            .await
            .unwrap();
        let mut peer = responder.await.unwrap();

        let mut frame = peer.seal(b"tamper me");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        peer.send_raw(frame).await;

        match events.recv().await.unwrap() {
            ChannelEvent::SecurityAlert { reason, .. } => {
                assert_eq!(reason, SecurityReason::CryptographicFailure)
            }
            other => panic!("expected crypto alert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonce_sequence_mismatch_is_malformed() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let (events_tx, mut events) = mpsc::channel(16);

        let responder = tokio::spawn(async move { RawPeer::respond(bob_io, &bob).await });
        let _channel = SecureChannel::connect(alice_io, alice, quick_config(), events_tx)
            .await
            .unwrap();
        let mut peer = responder.await.unwrap();

        // Claim sequence 9 in the header while the nonce still says 1
        let mut frame = peer.seal_with_seq(b"skewed", 1);
        frame[0..8].copy_from_slice(&9u64.to_be_bytes());
        peer.send_raw(frame).await;

        match events.recv().await.unwrap() {
            ChannelEvent::SecurityAlert { reason, .. } => {
                assert_eq!(reason, SecurityReason::MalformedFrame)
            }
            other => panic!("expected malformed alert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ack_timeout_without_responder_ack() {
        let alice = identity("Alice").await;
        let bob = identity("Bob").await;
        let (alice_io, bob_io) = tokio::io::duplex(64 * 1024);
        let (events_tx, _events) = mpsc::channel(16);

        let responder = tokio::spawn(async move { RawPeer::respond(bob_io, &bob).await });
        let channel = SecureChannel::connect(
            alice_io,
            alice,
            ChannelConfig {
                ack_timeout: Duration::from_millis(100),
                ..ChannelConfig::default()
            },
            events_tx,
        )
        .await
        .unwrap();
        let _peer = responder.await.unwrap();

        // RawPeer never acks
        let cancel = CancellationToken::new();
        let result = channel.send(b"lost in the void", &cancel).await;
        assert!(matches!(result, Err(ChannelError::AckTimeout(1))));
        assert!(channel.shared.pending_acks.lock().is_empty());
    }
}
