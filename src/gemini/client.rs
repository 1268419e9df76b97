//! Gemini Live WebSocket client.

use crate::audio::{self, INPUT_MIME_TYPE};
use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::gemini::{GEMINI_LIVE_URL, LIMIT_GRACE};
use crate::transport::{ConnectionPhase, TransportEvent, VoiceTransport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;
type WsSource = futures::stream::SplitStream<WsStream>;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Client message envelope. Exactly one field is set per message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    realtime_input: Option<RealtimeInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_content: Option<ClientContent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    system_instruction: Content,
    generation_config: Value,
}

#[derive(Debug, Clone, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientContent {
    turns: Vec<Value>,
    turn_complete: bool,
}

fn setup_message(config: &SessionConfig) -> ClientMessage {
    ClientMessage {
        setup: Some(Setup {
            model: config.model.clone(),
            system_instruction: Content { parts: vec![Part { text: config.instruction.clone() }] },
            generation_config: json!({
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": config.voice }
                    }
                }
            }),
        }),
        realtime_input: None,
        client_content: None,
    }
}

fn audio_message(base64_pcm: &str) -> ClientMessage {
    ClientMessage {
        setup: None,
        realtime_input: Some(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: INPUT_MIME_TYPE.to_string(),
                data: base64_pcm.to_string(),
            }],
        }),
        client_content: None,
    }
}

/// An empty completed turn, which signals the remote model to stop any
/// in-progress generation.
fn interrupt_message() -> ClientMessage {
    ClientMessage {
        setup: None,
        realtime_input: None,
        client_content: Some(ClientContent { turns: Vec::new(), turn_complete: true }),
    }
}

/// Translate one inbound envelope into local events.
///
/// `setupComplete` acknowledges the session. `serverContent` yields one
/// `Audio` event per PCM inline part (undecodable parts are logged and
/// skipped) and a trailing `TurnComplete` when flagged. Unrecognized
/// envelopes produce no events; the protocol is read forward-compatibly.
fn parse_server_message(raw: &str) -> Result<Vec<TransportEvent>> {
    let value: Value = serde_json::from_str(raw)?;
    let mut events = Vec::new();

    if value.get("setupComplete").is_some() {
        events.push(TransportEvent::Connected);
        return Ok(events);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) =
            content.get("modelTurn").and_then(|t| t.get("parts")).and_then(|p| p.as_array())
        {
            for part in parts {
                let Some(inline) = part.get("inlineData") else { continue };
                let mime = inline.get("mimeType").and_then(|m| m.as_str()).unwrap_or("");
                if !mime.starts_with("audio/pcm") {
                    continue;
                }
                let Some(data) = inline.get("data").and_then(|d| d.as_str()) else { continue };
                match audio::decode_base64(data) {
                    Ok(bytes) => events.push(TransportEvent::Audio(bytes)),
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping undecodable audio part");
                    }
                }
            }
        }
        if content.get("turnComplete").and_then(|t| t.as_bool()).unwrap_or(false) {
            events.push(TransportEvent::TurnComplete);
        }
    }

    Ok(events)
}

struct Inner {
    api_key: SecretString,
    config: SessionConfig,
    session_id: String,
    phase: parking_lot::Mutex<ConnectionPhase>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    events: broadcast::Sender<TransportEvent>,
    questions: AtomicU32,
    limit_fired: AtomicBool,
}

impl Inner {
    /// Mark the connection closed; true if this call did the transition.
    fn mark_closed(&self) -> bool {
        let mut phase = self.phase.lock();
        let was_live = matches!(*phase, ConnectionPhase::Connecting | ConnectionPhase::Open);
        *phase = ConnectionPhase::Closed;
        was_live
    }

    fn emit(&self, event: TransportEvent) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.events.send(event);
    }
}

/// Duplex streaming client for the Gemini Live API.
///
/// Manages exactly one WebSocket connection at a time. Cloning is cheap
/// and shares the connection.
#[derive(Clone)]
pub struct GeminiLiveClient {
    inner: Arc<Inner>,
}

impl GeminiLiveClient {
    /// Create a disconnected client. Call [`VoiceTransport::connect`] to
    /// open the stream.
    pub fn new(api_key: SecretString, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api_key,
                config,
                session_id: uuid::Uuid::new_v4().to_string(),
                phase: parking_lot::Mutex::new(ConnectionPhase::Idle),
                sink: tokio::sync::Mutex::new(None),
                events,
                questions: AtomicU32::new(0),
                limit_fired: AtomicBool::new(false),
            }),
        }
    }

    /// Locally-unique id for this client, used in logs.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Current connection phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.lock()
    }

    async fn send_raw<T: Serialize>(&self, value: &T) -> Result<()> {
        let msg = serde_json::to_string(value)?;
        let mut sink = self.inner.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return Err(VoiceError::transport("stream is not open"));
        };
        sink.send(Message::Text(msg.into()))
            .await
            .map_err(|e| VoiceError::transport(format!("send error: {e}")))
    }

    async fn read_loop(inner: Arc<Inner>, mut source: WsSource) {
        loop {
            let message = source.next().await;
            match message {
                Some(Ok(Message::Text(text))) => Self::dispatch(&inner, &text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Self::dispatch(&inner, &text),
                    Err(err) => {
                        tracing::warn!(error = %err, "ignoring non-UTF-8 binary message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    inner.sink.lock().await.take();
                    if inner.mark_closed() {
                        inner.emit(TransportEvent::Disconnected);
                    }
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::error!(error = %err, "websocket receive error");
                    inner.sink.lock().await.take();
                    inner.mark_closed();
                    inner.emit(TransportEvent::Error("Connection error occurred.".to_string()));
                    return;
                }
            }
        }
    }

    fn dispatch(inner: &Inner, raw: &str) {
        tracing::debug!(raw_len = raw.len(), "inbound server message");
        match parse_server_message(raw) {
            Ok(events) => {
                for event in events {
                    inner.emit(event);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "malformed server payload");
                inner.emit(TransportEvent::Error("Connection error occurred.".to_string()));
            }
        }
    }
}

#[async_trait]
impl VoiceTransport for GeminiLiveClient {
    fn is_open(&self) -> bool {
        *self.inner.phase.lock() == ConnectionPhase::Open
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                ConnectionPhase::Open | ConnectionPhase::Connecting => return Ok(()),
                ConnectionPhase::Idle | ConnectionPhase::Closed => {
                    *phase = ConnectionPhase::Connecting;
                }
            }
        }

        let mut url = Url::parse(GEMINI_LIVE_URL)
            .map_err(|e| VoiceError::config(format!("bad live URL: {e}")))?;
        url.query_pairs_mut().append_pair("key", self.inner.api_key.expose_secret());

        let request = url.as_str().into_client_request().map_err(|e| {
            self.inner.mark_closed();
            VoiceError::transport(format!("failed to build client request: {e}"))
        })?;

        let (stream, _response) = connect_async(request).await.map_err(|e| {
            self.inner.mark_closed();
            VoiceError::transport(format!("websocket connect error: {e}"))
        })?;

        let (sink, source) = stream.split();
        *self.inner.sink.lock().await = Some(sink);
        *self.inner.phase.lock() = ConnectionPhase::Open;

        // Fresh connection, fresh question budget.
        self.inner.questions.store(0, Ordering::SeqCst);
        self.inner.limit_fired.store(false, Ordering::SeqCst);

        tracing::info!(session_id = %self.inner.session_id, model = %self.inner.config.model, "sending setup message");
        if let Err(err) = self.send_raw(&setup_message(&self.inner.config)).await {
            self.inner.sink.lock().await.take();
            self.inner.mark_closed();
            return Err(err);
        }

        tokio::spawn(Self::read_loop(Arc::clone(&self.inner), source));
        Ok(())
    }

    async fn send_audio_chunk(&self, base64_pcm: &str) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.send_raw(&audio_message(base64_pcm)).await
    }

    async fn interrupt(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.send_raw(&interrupt_message()).await?;
        self.inner.emit(TransportEvent::Interrupted);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let was_live = self.inner.mark_closed();
        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            if let Err(err) = sink.send(Message::Close(None)).await {
                tracing::debug!(error = %err, "close frame send failed");
            }
        }
        if was_live {
            self.inner.emit(TransportEvent::Disconnected);
        }
        Ok(())
    }

    fn register_question(&self) {
        let count = self.inner.questions.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.inner.config.max_questions {
            return;
        }
        if self.inner.limit_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session_id = %self.inner.session_id, count, "question limit reached");
        self.inner.emit(TransportEvent::LimitReached(self.inner.config.limit_message.clone()));

        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(LIMIT_GRACE).await;
            if let Err(err) = client.disconnect().await {
                tracing::warn!(error = %err, "limit-triggered disconnect failed");
            }
        });
    }
}

impl std::fmt::Debug for GeminiLiveClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiLiveClient")
            .field("session_id", &self.inner.session_id)
            .field("phase", &*self.inner.phase.lock())
            .finish()
    }
}
