//! Gemini Live API transport.
//!
//! Implements [`crate::transport::VoiceTransport`] over Google's
//! WebSocket-based Live API (`BidiGenerateContent`):
//!
//! - Input audio: 16 kHz mono PCM16, base64 inside `realtimeInput` envelopes
//! - Output audio: 24 kHz mono PCM16, base64 inside `serverContent` parts
//! - Turn detection: server-side; the local loudness signal is cosmetic

mod client;

pub use client::GeminiLiveClient;

/// Gemini Live API WebSocket URL.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Default model for live voice sessions.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-latest";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Kore";

/// Available prebuilt voices (varies by model).
pub const GEMINI_VOICES: &[&str] = &["Puck", "Charon", "Kore", "Fenrir", "Aoede"];

/// Grace delay between the limit-reached event and the forced disconnect,
/// letting any in-flight final response complete.
pub const LIMIT_GRACE: std::time::Duration = std::time::Duration::from_secs(1);
