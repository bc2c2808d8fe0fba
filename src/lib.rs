//! # quicsync — QUIC collaboration provider
//!
//! Client half of a collaborative editing system: binds a local `yrs` CRDT
//! document to a named room on a remote relay over a QUIC bidirectional
//! transport, reconciles the replica with peers, and propagates per-user
//! ephemeral presence ("awareness") over unreliable datagrams.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   control stream    ┌─────────────┐
//! │ CollabProvider │ ◄─────────────────► │ Relay       │
//! │  + Awareness   │   length-prefixed   │ (per room)  │
//! └──────┬─────────┘   frames            └─────────────┘
//!        │                                      ▲
//!        ▼                                      │ datagrams
//! ┌────────────────┐     unreliable, clocked    │
//! │ yrs::Doc       │ ─────────────────────────── ┘
//! │ (local)        │
//! └────────────────┘
//! ```
//!
//! Reliable sync runs a two-phase handshake over the control stream: a
//! state vector out, the missing updates back, then incremental updates in
//! both directions with origin-based echo suppression. Presence rides
//! datagrams with a per-client logical clock ("latest wins per sender"),
//! refreshed periodically against loss, with a reliable full-state snapshot
//! on every (re)connect.
//!
//! ## Modules
//!
//! - [`framing`] — pure wire codecs (stream frames, datagram header, tags)
//! - [`awareness`] — per-client presence state with clocks and change events
//! - [`connection`] — QUIC connection manager with bounded-backoff reconnect
//! - [`presence`] — the datagram/stream presence pipeline
//! - [`provider`] — the public orchestrator

pub mod awareness;
pub mod connection;
pub mod framing;
pub mod presence;
pub mod provider;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessEntry, AwarenessEvent, AwarenessOrigin, ClientId};
pub use connection::{
    CertificateHash, CollabError, ConnectOptions, ConnectionEvent, ConnectionManager,
    ConnectionState, ReconnectConfig,
};
pub use framing::{
    decode_awareness_datagram, decode_frames, encode_awareness_datagram, encode_frame,
    FramingError, MAX_FRAME_PAYLOAD, STREAM_TYPE_SYNC,
};
pub use presence::{PresenceOptions, PresencePipeline};
pub use provider::{CollabProvider, ProviderEvent, ProviderOptions};
