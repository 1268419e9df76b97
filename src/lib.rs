//! Real-time voice agent pipeline over the Gemini Live API.
//!
//! This crate implements a full-duplex voice session: microphone capture
//! at 16 kHz mono PCM16, a WebSocket transport speaking the Gemini Live
//! `BidiGenerateContent` protocol, and gapless scheduled playback of the
//! model's 24 kHz audio responses.
//!
//! # Architecture
//!
//! - [`audio`] — PCM16 codec and format constants
//! - [`capture`] — microphone pipeline emitting fixed-size frames with a
//!   loudness signal
//! - [`playback`] — cursor-based scheduler serializing bursty server audio
//!   into ordered, gapless output
//! - [`transport`] — the [`transport::VoiceTransport`] trait and its typed
//!   event feed
//! - [`gemini`] — the Live API client implementing the transport
//! - [`session`] — the orchestrator wiring all of the above together
//! - [`auth`] — pluggable session authorization
//!
//! # Example
//!
//! ```no_run
//! use secrecy::SecretString;
//! use voiceline::{SessionConfig, VoiceSession};
//!
//! # async fn run() -> voiceline::Result<()> {
//! let api_key = SecretString::from(std::env::var("GEMINI_API_KEY").unwrap_or_default());
//! let session = VoiceSession::with_live_defaults(SessionConfig::default(), api_key);
//! session.start_session().await?;
//! // ... speak ...
//! session.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod auth;
pub mod capture;
pub mod config;
pub mod error;
pub mod gemini;
pub mod playback;
pub mod session;
pub mod transport;

pub use auth::{HttpAuthorizer, OpenAccess, SessionAuthorizer};
pub use capture::{AudioFrame, CaptureConfig, CaptureStream, CpalMic, MicSource};
pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{Result, VoiceError};
pub use gemini::GeminiLiveClient;
pub use playback::{CpalOutput, OutputDevice, OutputSink, PlaybackHandle, PlaybackScheduler};
pub use session::{SessionPhase, SessionState, VoiceSession};
pub use transport::{BoxedTransport, ConnectionPhase, TransportEvent, VoiceTransport};
