//! Voice session orchestrator.
//!
//! Wires the capture pipeline, the transport, and the playback scheduler
//! into one observable session. The orchestrator owns all cross-component
//! policy: authorization before any device access, gating uplink audio
//! while the agent speaks, debouncing the agent-speaking signal across
//! chunk boundaries, and tearing the whole stack down exactly once.

use crate::audio;
use crate::auth::SessionAuthorizer;
use crate::capture::{AudioFrame, CaptureStream, CpalMic, MicSource};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::gemini::GeminiLiveClient;
use crate::playback::{CpalOutput, OutputDevice, PlaybackScheduler};
use crate::transport::{TransportEvent, VoiceTransport};
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};

/// How long the agent-speaking flag lingers after the last chunk finishes,
/// bridging the gap between consecutive chunks of one response.
pub const AGENT_SPEAKING_DEBOUNCE: Duration = Duration::from_millis(200);

/// Lifecycle of a [`VoiceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session running.
    #[default]
    Idle,
    /// Start requested; authorization and connection in progress.
    Starting,
    /// Capture, transport, and playback all live.
    Active,
    /// The last session ended with an error.
    Failed,
}

/// Observable session state, cheap to clone as a snapshot.
///
/// `error` and `limit_message` survive teardown so callers can render why
/// the session ended; they clear on the next start.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Microphone loudness currently clears the speech threshold.
    pub user_speaking: bool,
    /// Agent audio is playing or scheduled (with debounce).
    pub agent_speaking: bool,
    /// User-displayable failure message, if the session failed.
    pub error: Option<String>,
    /// User-displayable cap message, if the question limit was hit.
    pub limit_message: Option<String>,
}

struct ActiveSession {
    capture: Box<dyn CaptureStream>,
    scheduler: Arc<PlaybackScheduler>,
}

struct SessionInner {
    config: SessionConfig,
    transport: Arc<dyn VoiceTransport>,
    authorizer: Arc<dyn SessionAuthorizer>,
    mic: Arc<dyn MicSource>,
    output: Arc<dyn OutputDevice>,
    state: parking_lot::RwLock<SessionState>,
    /// Bumped on every start and teardown; tasks from a previous life
    /// compare against it and exit.
    generation: AtomicU64,
    /// Bumped on interrupt; cancels pending agent-speaking clears.
    speak_epoch: AtomicU64,
    /// True while a `start_session` call is in flight.
    starting: AtomicBool,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionInner {
    /// Release everything exactly once. Order matters: transport first so
    /// no more audio arrives, then the microphone, then playback.
    async fn teardown(self: &Arc<Self>, error: Option<String>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.speak_epoch.fetch_add(1, Ordering::SeqCst);

        let active = self.active.lock().await.take();
        let Some(mut active) = active else {
            if let Some(message) = error {
                let mut state = self.state.write();
                state.phase = SessionPhase::Failed;
                state.error = Some(message);
                state.limit_message = None;
            }
            return;
        };

        if let Err(err) = self.transport.disconnect().await {
            tracing::warn!(error = %err, "transport close failed during teardown");
        }
        active.capture.stop();
        active.scheduler.reset().await;

        let mut state = self.state.write();
        state.user_speaking = false;
        state.agent_speaking = false;
        match error {
            Some(message) => {
                state.phase = SessionPhase::Failed;
                state.error = Some(message);
                // A failure message replaces any pending limit notice;
                // only one of the two is ever shown.
                state.limit_message = None;
            }
            None => state.phase = SessionPhase::Idle,
        }
        tracing::info!(phase = ?state.phase, "voice session ended");
    }
}

/// A full-duplex voice session. Cloning shares the session.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    /// Assemble a session from explicit components. Tests and embedders
    /// use this to substitute fakes for the hardware and the wire.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn VoiceTransport>,
        authorizer: Arc<dyn SessionAuthorizer>,
        mic: Arc<dyn MicSource>,
        output: Arc<dyn OutputDevice>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                authorizer,
                mic,
                output,
                state: parking_lot::RwLock::new(SessionState::default()),
                generation: AtomicU64::new(0),
                speak_epoch: AtomicU64::new(0),
                starting: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    /// Assemble a session over the Gemini Live API with the default
    /// microphone and speaker, granting access unconditionally.
    pub fn with_live_defaults(config: SessionConfig, api_key: SecretString) -> Self {
        let transport = Arc::new(GeminiLiveClient::new(api_key, config.clone()));
        Self::new(
            config,
            transport,
            Arc::new(crate::auth::OpenAccess),
            Arc::new(CpalMic),
            Arc::new(CpalOutput),
        )
    }

    /// Snapshot of the current session state.
    pub fn state(&self) -> SessionState {
        self.inner.state.read().clone()
    }

    /// Start the session: authorize, open devices, connect the transport,
    /// and begin streaming. No-op if a session is already running or
    /// another start is in flight.
    ///
    /// Authorization runs before any device is touched; a rejection leaves
    /// the microphone and speaker untouched. A `disconnect()` racing an
    /// in-flight start wins: the start notices the teardown before
    /// installing anything and releases whatever it had opened.
    pub async fn start_session(&self) -> Result<()> {
        if self.inner.starting.swap(true, Ordering::SeqCst) {
            tracing::warn!("start requested while another start is in flight");
            return Ok(());
        }
        let result = self.start_inner().await;
        self.inner.starting.store(false, Ordering::SeqCst);
        result
    }

    async fn start_inner(&self) -> Result<()> {
        if self.inner.active.lock().await.is_some() {
            tracing::warn!("start requested while a session is already active");
            return Ok(());
        }

        {
            let mut state = self.inner.state.write();
            state.phase = SessionPhase::Starting;
            state.error = None;
            state.limit_message = None;
        }

        // Captured before the first suspension point; a teardown during
        // any await bumps the counter and the install step backs out.
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(err) = self.inner.authorizer.authorize().await {
            let reason = match &err {
                VoiceError::AuthorizationRejected(reason) => reason.clone(),
                other => other.to_string(),
            };
            let mut state = self.inner.state.write();
            state.phase = SessionPhase::Failed;
            state.error = Some(reason);
            return Err(err);
        }

        let sink = match self.inner.output.open() {
            Ok(sink) => sink,
            Err(err) => {
                let mut state = self.inner.state.write();
                state.phase = SessionPhase::Failed;
                state.error = Some(err.to_string());
                return Err(err);
            }
        };
        let scheduler = Arc::new(PlaybackScheduler::new(sink));

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<AudioFrame>();
        let threshold = self.inner.config.capture.vad_threshold;
        let cb_inner = Arc::clone(&self.inner);
        let on_frame = Box::new(move |frame: AudioFrame| {
            if cb_inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            cb_inner.state.write().user_speaking = frame.is_speech(threshold);
            let _ = frame_tx.send(frame);
        });

        let capture = match self.inner.mic.start(&self.inner.config.capture, on_frame) {
            Ok(capture) => capture,
            Err(err) => {
                scheduler.reset().await;
                let mut state = self.inner.state.write();
                state.phase = SessionPhase::Failed;
                state.error = Some(err.to_string());
                return Err(err);
            }
        };

        // Subscribe before connecting so setup acknowledgement is not lost.
        let events = self.inner.transport.subscribe();

        if let Err(err) = self.inner.transport.connect().await {
            let mut capture = capture;
            capture.stop();
            scheduler.reset().await;
            let mut state = self.inner.state.write();
            state.phase = SessionPhase::Failed;
            state.error = Some("Connection error occurred.".to_string());
            return Err(err);
        }

        {
            let mut active = self.inner.active.lock().await;
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                drop(active);
                let mut capture = capture;
                capture.stop();
                scheduler.reset().await;
                if let Err(err) = self.inner.transport.disconnect().await {
                    tracing::warn!(error = %err, "transport close failed after cancelled start");
                }
                let mut state = self.inner.state.write();
                if state.phase == SessionPhase::Starting {
                    state.phase = SessionPhase::Idle;
                }
                state.user_speaking = false;
                state.agent_speaking = false;
                tracing::info!("session start cancelled by disconnect");
                return Ok(());
            }
            *active = Some(ActiveSession { capture, scheduler: Arc::clone(&scheduler) });
            self.inner.state.write().phase = SessionPhase::Active;
        }

        tokio::spawn(Self::forward_frames(Arc::clone(&self.inner), generation, frame_rx));
        tokio::spawn(Self::event_loop(Arc::clone(&self.inner), generation, events, scheduler));

        tracing::info!("voice session active");
        Ok(())
    }

    /// Stop the agent mid-response: signal the remote to halt generation
    /// and flush all scheduled playback. No-op when the agent is quiet.
    pub async fn interrupt_agent(&self) {
        if !self.inner.state.read().agent_speaking {
            return;
        }
        if let Err(err) = self.inner.transport.interrupt().await {
            tracing::warn!(error = %err, "interrupt send failed");
        }
        if let Some(active) = self.inner.active.lock().await.as_ref() {
            active.scheduler.reset().await;
        }
        self.inner.speak_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.state.write().agent_speaking = false;
        tracing::debug!("agent interrupted");
    }

    /// End the session and release the microphone, speaker, and transport.
    /// Idempotent.
    pub async fn disconnect(&self) {
        self.inner.teardown(None).await;
    }

    async fn forward_frames(
        inner: Arc<SessionInner>,
        generation: u64,
        mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    ) {
        while let Some(frame) = frames.recv().await {
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Half-duplex uplink: hold frames while the agent is speaking
            // so the model does not hear itself.
            if inner.state.read().agent_speaking {
                continue;
            }
            let chunk = audio::encode_frame(&frame.samples);
            if let Err(err) = inner.transport.send_audio_chunk(&chunk).await {
                tracing::warn!(error = %err, "audio chunk send failed");
            }
        }
    }

    async fn event_loop(
        inner: Arc<SessionInner>,
        generation: u64,
        mut events: broadcast::Receiver<TransportEvent>,
        scheduler: Arc<PlaybackScheduler>,
    ) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event feed lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            match event {
                TransportEvent::Connected => {
                    tracing::info!("session setup acknowledged");
                }
                TransportEvent::Audio(pcm) => {
                    Self::handle_agent_audio(&inner, &scheduler, &pcm).await;
                }
                TransportEvent::TurnComplete => {
                    inner.transport.register_question();
                }
                TransportEvent::Interrupted => {
                    tracing::debug!("interrupt acknowledged locally");
                }
                TransportEvent::LimitReached(message) => {
                    let mut state = inner.state.write();
                    state.limit_message = Some(message);
                    state.error = None;
                }
                TransportEvent::Disconnected => {
                    inner.teardown(None).await;
                    return;
                }
                TransportEvent::Error(message) => {
                    inner.teardown(Some(message)).await;
                    return;
                }
            }
        }
    }

    async fn handle_agent_audio(
        inner: &Arc<SessionInner>,
        scheduler: &Arc<PlaybackScheduler>,
        pcm: &[u8],
    ) {
        let handle = match scheduler.enqueue(pcm).await {
            Ok(handle) => handle,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable agent audio chunk");
                return;
            }
        };

        inner.state.write().agent_speaking = true;
        // The newest chunk owns the eventual clear; a later chunk or an
        // interrupt bumps the epoch and this task backs off.
        let epoch = inner.speak_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let clear_inner = Arc::clone(inner);
        tokio::spawn(async move {
            handle.finished().await;
            tokio::time::sleep(AGENT_SPEAKING_DEBOUNCE).await;
            if clear_inner.speak_epoch.load(Ordering::SeqCst) == epoch {
                clear_inner.state.write().agent_speaking = false;
            }
        });
    }
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession").field("state", &self.state()).finish()
    }
}
