//! Session configuration.

use crate::capture::CaptureConfig;
use crate::gemini::{DEFAULT_MODEL, DEFAULT_VOICE};
use serde::{Deserialize, Serialize};

/// Default system instruction for the voice agent.
pub const DEFAULT_INSTRUCTION: &str = "You are a helpful voice assistant. \
Answer questions concisely and conversationally, in one or two sentences. \
If a question is outside your knowledge, say so briefly.";

/// Default user-facing message when the question cap is reached.
pub const DEFAULT_LIMIT_MESSAGE: &str =
    "You've reached the question limit for this session. Thanks for trying the demo!";

/// Default per-connection question cap.
pub const DEFAULT_MAX_QUESTIONS: u32 = 100;

/// Configuration for a live voice session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Model resource name, e.g. `models/gemini-2.5-flash-native-audio-latest`.
    pub model: String,
    /// Prebuilt voice name, e.g. `Kore`.
    pub voice: String,
    /// System instruction sent with session setup.
    pub instruction: String,
    /// Questions answered before the session is force-closed.
    pub max_questions: u32,
    /// Message surfaced to the user when the cap is hit.
    pub limit_message: String,
    /// Microphone capture parameters.
    pub capture: CaptureConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            max_questions: DEFAULT_MAX_QUESTIONS,
            limit_message: DEFAULT_LIMIT_MESSAGE.to_string(),
            capture: CaptureConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Set the model resource name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the prebuilt voice.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    /// Set the system instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.config.voice = voice.into();
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.instruction = instruction.into();
        self
    }

    pub fn max_questions(mut self, max: u32) -> Self {
        self.config.max_questions = max;
        self
    }

    pub fn limit_message(mut self, message: impl Into<String>) -> Self {
        self.config.limit_message = message.into();
        self
    }

    pub fn capture(mut self, capture: CaptureConfig) -> Self {
        self.config.capture = capture;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
