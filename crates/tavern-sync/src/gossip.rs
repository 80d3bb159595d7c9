//! Gossip anti-entropy exchange
//!
//! One convergence round between two authenticated peers: each side sends
//! its heads and known event ids, answers with the events the other side
//! lacks, and imports what it receives. Import is idempotent and
//! materialization re-sorts, so rounds may overlap or repeat freely.

use crate::engine::SyncEngine;
use crate::error::SyncError;
use std::collections::HashSet;
use std::sync::Arc;
use tavern_core::codec;
use tavern_core::types::SessionId;
use tavern_net::channel::{ChannelEvent, SecureChannel};
use tavern_net::error::ChannelError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many known ids a request carries at most; peers with deeper logs
/// resend some already-known events, which import drops harmlessly
const MAX_KNOWN_IDS: usize = 10_000;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("codec error: {0}")]
    Codec(#[from] tavern_core::CoreError),
    #[error("peer disconnected mid-round")]
    Disconnected,
}

/// One side's view of a session, asking for what it lacks
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub session_id: SessionId,
    pub head_ids: Vec<String>,
    pub known_event_ids: Vec<String>,
}

/// The events the requester was missing, as a wire batch
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub session_id: SessionId,
    /// JSON array of wire events; empty batch is the empty string
    pub batch: String,
}

/// Tagged gossip envelope carried as secure-channel data
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GossipMessage {
    SyncRequest(SyncRequest),
    SyncResponse(SyncResponse),
}

/// Result of feeding one inbound gossip message to the exchange
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Message to send back, if any
    pub reply: Option<GossipMessage>,
    /// Events newly stored by an import
    pub imported: usize,
    /// True when this message completed our own request/response round
    pub round_complete: bool,
}

/// Anti-entropy driver bound to one engine
pub struct GossipExchange {
    engine: Arc<SyncEngine>,
}

impl GossipExchange {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Build the opening request for a session
    pub async fn create_request(&self, session_id: SessionId) -> Result<GossipMessage, GossipError> {
        let head_ids = self.engine.get_head_event_ids(session_id).await?;
        let mut known_event_ids: Vec<String> = self
            .engine
            .get_events(session_id)
            .await?
            .into_iter()
            .map(|event| event.event_id)
            .collect();
        if known_event_ids.len() > MAX_KNOWN_IDS {
            warn!(
                session_id,
                total = known_event_ids.len(),
                "truncating known-id sample for gossip request"
            );
            known_event_ids.truncate(MAX_KNOWN_IDS);
        }
        Ok(GossipMessage::SyncRequest(SyncRequest {
            session_id,
            head_ids,
            known_event_ids,
        }))
    }

    /// Answer a peer's request with the events it lacks
    pub async fn handle_request(&self, request: &SyncRequest) -> Result<SyncResponse, GossipError> {
        let known: HashSet<String> = request.known_event_ids.iter().cloned().collect();
        let missing = self
            .engine
            .get_missing_events(request.session_id, &known)
            .await?;
        debug!(
            session_id = request.session_id,
            peer_heads = request.head_ids.len(),
            sending = missing.len(),
            "answering gossip request"
        );
        Ok(SyncResponse {
            session_id: request.session_id,
            batch: codec::encode_batch(&missing)?,
        })
    }

    /// Import the events a peer sent us; returns the newly stored count
    pub async fn handle_response(
        &self,
        response: &SyncResponse,
        cancel: &CancellationToken,
    ) -> Result<usize, GossipError> {
        let events = codec::decode_batch(&response.batch)?;
        Ok(self.engine.import(events, cancel).await?)
    }

    /// Feed one decrypted payload through the exchange
    pub async fn handle_message(
        &self,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> Result<HandleOutcome, GossipError> {
        match serde_json::from_slice::<GossipMessage>(payload)? {
            GossipMessage::SyncRequest(request) => {
                let response = self.handle_request(&request).await?;
                Ok(HandleOutcome {
                    reply: Some(GossipMessage::SyncResponse(response)),
                    ..HandleOutcome::default()
                })
            }
            GossipMessage::SyncResponse(response) => {
                let imported = self.handle_response(&response, cancel).await?;
                Ok(HandleOutcome {
                    imported,
                    round_complete: true,
                    ..HandleOutcome::default()
                })
            }
        }
    }

    /// Drive one full convergence round over an established channel.
    ///
    /// Sends our request, answers the peer's request if one arrives in the
    /// meantime, and returns once our own response has been imported. Both
    /// sides may call this concurrently on the same channel pair.
    pub async fn converge(
        &self,
        channel: &SecureChannel,
        events: &mut mpsc::Receiver<ChannelEvent>,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<usize, GossipError> {
        let request = self.create_request(session_id).await?;
        channel.send(&serde_json::to_vec(&request)?, cancel).await?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(GossipError::Sync(SyncError::Cancelled)),
                event = events.recv() => event.ok_or(GossipError::Disconnected)?,
            };
            match event {
                ChannelEvent::Message { payload, .. } => {
                    let outcome = self.handle_message(&payload, cancel).await?;
                    if let Some(reply) = outcome.reply {
                        channel.send(&serde_json::to_vec(&reply)?, cancel).await?;
                    }
                    if outcome.round_complete {
                        return Ok(outcome.imported);
                    }
                }
                ChannelEvent::PeerDisconnected { .. } => {
                    return Err(GossipError::Disconnected);
                }
                ChannelEvent::SecurityAlert { peer_id, reason } => {
                    warn!(%peer_id, %reason, "security alert during gossip round");
                }
            }
        }
    }
}
