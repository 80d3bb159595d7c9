//! Secure peer channel for the Tavern protocol
//!
//! This crate provides:
//! - Outer wire framing (`frame_code || length || payload`)
//! - The mutual-auth, forward-secret handshake and session key schedule
//! - AEAD data framing with sequence numbers, acks, and replay protection
//! - Peer descriptors consumed from the discovery layer
//!
//! The transport underneath is any reliable, in-order byte pipe supplied by
//! the embedding application; this crate adds framing and security on top.

pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod peer;

pub use channel::{ChannelEvent, SecureChannel, SecurityReason};
pub use config::ChannelConfig;
pub use error::ChannelError;
pub use framing::{Frame, FrameCode, FrameCodec};
pub use handshake::{HandshakePayload, SessionKeys, VerifiedPeer};
pub use peer::PeerDescriptor;
