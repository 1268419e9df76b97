//! Transport trait and typed event channel.
//!
//! The remote wire protocol is translated into a tagged union of local
//! events delivered over a broadcast channel; consumers subscribe and
//! match on the variants they care about. Transport-level failures are
//! deliberately collapsed into the generic [`TransportEvent::Error`] so
//! the orchestrator's handling stays simple.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Connection lifecycle of a transport.
///
/// `Closed` may re-enter `Connecting` through a fresh `connect()` call;
/// no reconnection is ever attempted automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    /// Never connected.
    #[default]
    Idle,
    /// Stream open in progress.
    Connecting,
    /// Stream open and setup sent.
    Open,
    /// Stream closed by either side.
    Closed,
}

/// Typed events emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The remote acknowledged session setup.
    Connected,
    /// The stream closed.
    Disconnected,
    /// Any stream-level failure, as a user-displayable message.
    Error(String),
    /// The per-session question cap was hit; carries the user-facing
    /// message. The transport force-disconnects after a grace delay.
    LimitReached(String),
    /// One segment of server audio, raw PCM16 (base64 already stripped).
    Audio(Bytes),
    /// The server finished its current turn.
    TurnComplete,
    /// A locally-initiated interrupt was sent upstream.
    Interrupted,
}

/// A duplex streaming connection to the remote voice service.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Whether the stream is currently open.
    fn is_open(&self) -> bool;

    /// Subscribe to the transport's event feed. Events published before
    /// the first subscription are dropped, so subscribe before `connect`.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open the stream and send session setup. No-op when already open.
    async fn connect(&self) -> Result<()>;

    /// Transmit one base64 PCM16 chunk. Silent no-op when not open;
    /// fire-and-forget, relying on the stream's own flow control.
    async fn send_audio_chunk(&self, base64_pcm: &str) -> Result<()>;

    /// Ask the remote model to stop generating. No confirmation is
    /// awaited; emits [`TransportEvent::Interrupted`] locally.
    async fn interrupt(&self) -> Result<()>;

    /// Close the stream if open. Idempotent.
    async fn disconnect(&self) -> Result<()>;

    /// Count one answered question against the per-connection cap.
    fn register_question(&self);
}

/// A shared transport for dynamic dispatch.
pub type BoxedTransport = Arc<dyn VoiceTransport>;
