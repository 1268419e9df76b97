//! Orchestrator tests with fake devices and a fake transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use voiceline::audio::pcm16_from_f32;
use voiceline::capture::{AudioFrame, CaptureConfig, CaptureStream, FrameCallback, MicSource};
use voiceline::playback::{OutputDevice, OutputSink};
use voiceline::{
    Result, SessionAuthorizer, SessionConfig, SessionPhase, SessionState, TransportEvent,
    VoiceError, VoiceSession, VoiceTransport,
};

struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    fail_connect: bool,
    /// When set, `connect()` parks until a permit is released.
    gate: Option<Arc<tokio::sync::Semaphore>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    interrupts: AtomicUsize,
    questions: AtomicUsize,
    sent: parking_lot::Mutex<Vec<String>>,
}

impl MockTransport {
    fn new(fail_connect: bool) -> Arc<Self> {
        Self::build(fail_connect, None)
    }

    fn gated() -> (Arc<Self>, Arc<tokio::sync::Semaphore>) {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        (Self::build(false, Some(Arc::clone(&gate))), gate)
    }

    fn build(fail_connect: bool, gate: Option<Arc<tokio::sync::Semaphore>>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            open: AtomicBool::new(false),
            fail_connect,
            gate,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            questions: AtomicUsize::new(0),
            sent: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if self.fail_connect {
            return Err(VoiceError::transport("simulated connect failure"));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_audio_chunk(&self, base64_pcm: &str) -> Result<()> {
        self.sent.lock().push(base64_pcm.to_string());
        Ok(())
    }

    async fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn register_question(&self) {
        self.questions.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockMic {
    callback: parking_lot::Mutex<Option<FrameCallback>>,
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl MockMic {
    /// Push one frame through the stored capture callback.
    fn emit(&self, samples: Vec<f32>) {
        if let Some(cb) = self.callback.lock().as_ref() {
            cb(AudioFrame::from_samples(samples));
        }
    }
}

struct MockStream {
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

impl CaptureStream for MockStream {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MicSource for MockMic {
    fn start(&self, _config: &CaptureConfig, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock() = Some(on_frame);
        Ok(Box::new(MockStream { stops: Arc::clone(&self.stops), stopped: false }))
    }
}

#[derive(Default)]
struct CountingSink {
    writes: parking_lot::Mutex<Vec<usize>>,
    clears: AtomicUsize,
}

impl OutputSink for CountingSink {
    fn write(&self, samples: &[f32]) -> Result<()> {
        self.writes.lock().push(samples.len());
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockOutput {
    sink: Arc<CountingSink>,
}

impl OutputDevice for MockOutput {
    fn open(&self) -> Result<Arc<dyn OutputSink>> {
        Ok(Arc::clone(&self.sink) as Arc<dyn OutputSink>)
    }
}

struct DenyAuth(&'static str);

#[async_trait]
impl SessionAuthorizer for DenyAuth {
    async fn authorize(&self) -> Result<()> {
        Err(VoiceError::rejected(self.0))
    }
}

struct Fixture {
    session: VoiceSession,
    transport: Arc<MockTransport>,
    mic: Arc<MockMic>,
    sink: Arc<CountingSink>,
}

fn fixture(fail_connect: bool) -> Fixture {
    fixture_with(MockTransport::new(fail_connect))
}

fn fixture_with(transport: Arc<MockTransport>) -> Fixture {
    let mic = Arc::new(MockMic::default());
    let sink = Arc::new(CountingSink::default());
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        Arc::new(voiceline::OpenAccess),
        Arc::clone(&mic) as Arc<dyn MicSource>,
        Arc::new(MockOutput { sink: Arc::clone(&sink) }),
    );
    Fixture { session, transport, mic, sink }
}

/// Let spawned tasks run under the paused clock.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// 100 ms of agent audio at the 24 kHz playback rate.
fn agent_chunk() -> Bytes {
    Bytes::from(pcm16_from_f32(&vec![0.1_f32; 2400]))
}

#[tokio::test]
async fn rejected_authorization_touches_no_devices() {
    let transport = MockTransport::new(false);
    let mic = Arc::new(MockMic::default());
    let sink = Arc::new(CountingSink::default());
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        Arc::new(DenyAuth("quota exhausted")),
        Arc::clone(&mic) as Arc<dyn MicSource>,
        Arc::new(MockOutput { sink }),
    );

    let err = session.start_session().await.unwrap_err();
    assert!(matches!(err, VoiceError::AuthorizationRejected(_)));

    let state = session.state();
    assert_eq!(state.phase, SessionPhase::Failed);
    assert_eq!(state.error.as_deref(), Some("quota exhausted"));
    assert_eq!(mic.starts.load(Ordering::SeqCst), 0);
    assert_eq!(transport.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_releases_everything_exactly_once() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    assert_eq!(fx.session.state().phase, SessionPhase::Active);
    assert_eq!(fx.mic.starts.load(Ordering::SeqCst), 1);

    fx.session.disconnect().await;
    fx.session.disconnect().await;

    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fx.transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(fx.session.state(), SessionState::default());
}

#[tokio::test(start_paused = true)]
async fn concurrent_disconnects_release_once() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    let a = fx.session.clone();
    let b = fx.session.clone();
    tokio::join!(a.disconnect(), b.disconnect());

    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fx.transport.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_releases_the_microphone() {
    let fx = fixture(true);
    let err = fx.session.start_session().await.unwrap_err();
    assert!(matches!(err, VoiceError::Transport(_)));

    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1);
    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Failed);
    assert_eq!(state.error.as_deref(), Some("Connection error occurred."));
}

#[tokio::test(start_paused = true)]
async fn full_exchange_gates_uplink_and_counts_questions() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    fx.transport.emit(TransportEvent::Connected);
    settle().await;

    // A loud frame while the agent is quiet flows upstream.
    fx.mic.emit(vec![0.1_f32; 64]);
    settle().await;
    assert!(fx.session.state().user_speaking);
    assert_eq!(fx.transport.sent.lock().len(), 1);

    // Agent audio starts playing and gates the uplink.
    fx.transport.emit(TransportEvent::Audio(agent_chunk()));
    settle().await;
    assert!(fx.session.state().agent_speaking);

    fx.mic.emit(vec![0.1_f32; 64]);
    settle().await;
    assert_eq!(fx.transport.sent.lock().len(), 1, "uplink must pause while the agent speaks");

    fx.transport.emit(TransportEvent::TurnComplete);
    settle().await;
    assert_eq!(fx.transport.questions.load(Ordering::SeqCst), 1);

    // Chunk duration (100 ms) plus the 200 ms debounce.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!fx.session.state().agent_speaking);
    assert_eq!(fx.sink.writes.lock().len(), 1);

    // Uplink resumes; a quiet frame clears the speaking flag but still flows.
    fx.mic.emit(vec![0.0_f32; 64]);
    settle().await;
    assert!(!fx.session.state().user_speaking);
    assert_eq!(fx.transport.sent.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn consecutive_chunks_keep_the_agent_speaking_flag_up() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    fx.transport.emit(TransportEvent::Audio(agent_chunk()));
    fx.transport.emit(TransportEvent::Audio(agent_chunk()));
    settle().await;

    // First chunk ends at 150 ms; without the debounce carrying across the
    // boundary the flag would briefly drop before the second chunk ends.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(fx.session.state().agent_speaking);

    // Both chunks done (250 ms) plus the debounce.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!fx.session.state().agent_speaking);
}

#[tokio::test(start_paused = true)]
async fn interrupt_flushes_playback_and_clears_the_flag() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    fx.transport.emit(TransportEvent::Audio(agent_chunk()));
    settle().await;
    assert!(fx.session.state().agent_speaking);

    fx.session.interrupt_agent().await;
    assert_eq!(fx.transport.interrupts.load(Ordering::SeqCst), 1);
    assert!(fx.sink.clears.load(Ordering::SeqCst) >= 1);
    assert!(!fx.session.state().agent_speaking);

    // The cancelled chunk's pending debounce task must not resurrect it.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!fx.session.state().agent_speaking);
}

#[tokio::test(start_paused = true)]
async fn interrupt_is_a_noop_when_the_agent_is_quiet() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    fx.session.interrupt_agent().await;
    assert_eq!(fx.transport.interrupts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn limit_message_survives_the_following_teardown() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    fx.transport.emit(TransportEvent::LimitReached("cap reached".to_string()));
    settle().await;
    assert_eq!(fx.session.state().limit_message.as_deref(), Some("cap reached"));

    fx.transport.emit(TransportEvent::Disconnected);
    settle().await;

    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Idle);
    assert_eq!(state.limit_message.as_deref(), Some("cap reached"));
    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_error_fails_the_session_with_a_message() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    fx.transport.emit(TransportEvent::Error("Connection error occurred.".to_string()));
    settle().await;

    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Failed);
    assert_eq!(state.error.as_deref(), Some("Connection error occurred."));
    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn restart_clears_the_previous_failure() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    fx.transport.emit(TransportEvent::Error("Connection error occurred.".to_string()));
    settle().await;
    assert_eq!(fx.session.state().phase, SessionPhase::Failed);

    fx.session.start_session().await.unwrap();
    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Active);
    assert_eq!(state.error, None);
    assert_eq!(state.limit_message, None);
    assert_eq!(fx.mic.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn start_while_active_is_a_noop() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    fx.session.start_session().await.unwrap();

    assert_eq!(fx.mic.starts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_startup_wins_over_the_start() {
    let (transport, gate) = MockTransport::gated();
    let fx = fixture_with(transport);

    let starter = fx.session.clone();
    let start = tokio::spawn(async move { starter.start_session().await });
    settle().await;
    assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 1, "start must be parked in connect");

    // Teardown races the in-flight handshake and must win.
    fx.session.disconnect().await;
    gate.add_permits(1);
    start.await.unwrap().unwrap();

    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Idle, "session resurrected after disconnect");
    assert_eq!(fx.mic.stops.load(Ordering::SeqCst), 1, "microphone must be released");
    assert!(!fx.transport.is_open());
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_open_one_capture_stream() {
    let (transport, gate) = MockTransport::gated();
    let fx = fixture_with(transport);

    let starter = fx.session.clone();
    let first = tokio::spawn(async move { starter.start_session().await });
    settle().await;

    // Second start while the first is parked in connect is a no-op.
    fx.session.start_session().await.unwrap();
    assert_eq!(fx.mic.starts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.transport.connects.load(Ordering::SeqCst), 1);

    gate.add_permits(1);
    first.await.unwrap().unwrap();
    assert_eq!(fx.session.state().phase, SessionPhase::Active);
    assert_eq!(fx.mic.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn an_error_during_the_limit_grace_replaces_the_limit_message() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();

    fx.transport.emit(TransportEvent::LimitReached("cap reached".to_string()));
    settle().await;
    assert_eq!(fx.session.state().limit_message.as_deref(), Some("cap reached"));

    fx.transport.emit(TransportEvent::Error("Connection error occurred.".to_string()));
    settle().await;

    let state = fx.session.state();
    assert_eq!(state.phase, SessionPhase::Failed);
    assert_eq!(state.error.as_deref(), Some("Connection error occurred."));
    assert_eq!(state.limit_message, None, "only one message may be shown at a time");
}

#[tokio::test(start_paused = true)]
async fn frames_from_a_previous_session_are_ignored() {
    let fx = fixture(false);
    fx.session.start_session().await.unwrap();
    fx.session.disconnect().await;

    // The capture callback may race teardown on real hardware.
    fx.mic.emit(vec![0.1_f32; 64]);
    settle().await;
    assert!(fx.transport.sent.lock().is_empty());
    assert!(!fx.session.state().user_speaking);
}
