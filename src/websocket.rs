//! # WebSocket Detection Handler
//!
//! Per-connection message loop for real-time audio deepfake detection.
//! Clients connect to `/ws/detect`, stream encoded audio chunks, and receive
//! detection verdicts asynchronously.
//!
//! ## WebSocket Protocol:
//! 1. **Handshake**: the first JSON message supplies a `client_id` (one is
//!    generated when absent) and the session is registered
//! 2. **Streaming**: `audio_chunk` messages feed the session's stream buffer;
//!    a `detection_result` is emitted whenever a processing window completes
//!    (no reply otherwise; silent accumulation is intentional)
//! 3. **Control**: `config`, `ping` and `stats` messages get synchronous
//!    replies; unknown types get an `error` envelope and the loop continues
//! 4. **Teardown**: transport close or error stops the actor, which removes
//!    the session from the registry exactly once
//!
//! Connection states: `Handshaking → Active → Closed`. Protocol, decode and
//! detection failures never close the connection; only the transport does.

use crate::audio::codec;
use crate::audio::session::{unix_now, EnvelopeSink, Session, SessionRegistry, SessionStats};
use crate::detection::detector::DetectionResult;
use crate::detection::engine::DetectionEngine;
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often the server pings idle connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How long without any client traffic before the connection is dropped.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Client → server message envelope.
///
/// Deliberately permissive: `type` is routed on as a plain string so that
/// unknown types can be echoed back in the error message, and every other
/// field is optional with defaults applied at the point of use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,

    #[serde(default)]
    pub client_id: Option<String>,

    /// Audio payload: a base64 string or a JSON array of numbers
    #[serde(default)]
    pub audio_data: Option<serde_json::Value>,

    /// Defaults to 16000 when absent
    #[serde(default)]
    pub sample_rate: Option<u32>,

    /// `"base64"` (default) or `"json"`
    #[serde(default)]
    pub encoding: Option<String>,

    /// Only meaningful on `config` messages
    #[serde(default)]
    pub chunk_duration: Option<f64>,

    #[serde(default)]
    pub timestamp: Option<f64>,
}

fn default_message_type() -> String {
    "unknown".to_string()
}

/// Server → client message envelope, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connected {
        client_id: String,
        timestamp: f64,
    },
    DetectionResult {
        result: DetectionResult,
        processing_time_ms: f64,
        timestamp: f64,
    },
    Error {
        message: String,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
    ConfigUpdated {
        timestamp: f64,
    },
    Stats {
        stats: SessionStats,
        timestamp: f64,
    },
}

impl ServerEnvelope {
    pub fn connected(client_id: String) -> Self {
        ServerEnvelope::Connected {
            client_id,
            timestamp: unix_now(),
        }
    }

    pub fn detection_result(result: DetectionResult, processing_time_ms: f64) -> Self {
        ServerEnvelope::DetectionResult {
            result,
            processing_time_ms,
            timestamp: unix_now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            message: message.into(),
            timestamp: unix_now(),
        }
    }

    pub fn pong() -> Self {
        ServerEnvelope::Pong {
            timestamp: unix_now(),
        }
    }

    pub fn config_updated() -> Self {
        ServerEnvelope::ConfigUpdated {
            timestamp: unix_now(),
        }
    }

    pub fn stats(stats: SessionStats) -> Self {
        ServerEnvelope::Stats {
            stats,
            timestamp: unix_now(),
        }
    }
}

/// Outcome of dispatching one Active-state message.
#[derive(Debug)]
pub enum Dispatch {
    /// Send a single reply envelope
    Reply(ServerEnvelope),

    /// A processing window is ready; classify it off the connection loop
    Detect { window: Vec<f32>, sample_rate: u32 },

    /// No reply (audio accumulated below the extraction gates)
    Silent,
}

/// Route one parsed envelope for an active session.
///
/// Pure with respect to the transport: replies and detection requests are
/// returned to the caller, never sent from here, which keeps the protocol
/// logic unit-testable without an actix runtime.
pub fn dispatch(session: &Session, envelope: ClientEnvelope, now: f64) -> Dispatch {
    session.record_message();

    match envelope.message_type.as_str() {
        "audio_chunk" => dispatch_audio_chunk(session, envelope, now),
        "config" => {
            let mut buffer = session.buffer();
            if let Some(sample_rate) = envelope.sample_rate {
                buffer.set_sample_rate(sample_rate);
            }
            if let Some(chunk_duration) = envelope.chunk_duration {
                buffer.set_chunk_duration(chunk_duration);
            }
            Dispatch::Reply(ServerEnvelope::config_updated())
        }
        "ping" => Dispatch::Reply(ServerEnvelope::pong()),
        "stats" => Dispatch::Reply(ServerEnvelope::stats(session.stats())),
        other => Dispatch::Reply(ServerEnvelope::error(format!(
            "Unknown message type: {}",
            other
        ))),
    }
}

fn dispatch_audio_chunk(session: &Session, envelope: ClientEnvelope, now: f64) -> Dispatch {
    // An empty string or array is as useless as an absent field
    let payload = match envelope.audio_data {
        Some(payload) if !payload_is_empty(&payload) => payload,
        _ => return Dispatch::Reply(ServerEnvelope::error("Missing audio_data")),
    };

    let encoding = envelope.encoding.as_deref().unwrap_or("base64");
    let samples = match codec::decode_audio_data(&payload, encoding) {
        Ok(samples) => samples,
        Err(err) => return Dispatch::Reply(ServerEnvelope::error(err.to_string())),
    };

    let sample_rate = envelope.sample_rate.unwrap_or(16000);
    let mut buffer = session.buffer();
    buffer.set_sample_rate(sample_rate);
    buffer.add_chunk(&samples);

    match buffer.try_extract(now) {
        Some(window) => Dispatch::Detect {
            window,
            sample_rate,
        },
        None => Dispatch::Silent,
    }
}

fn payload_is_empty(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::String(text) => text.is_empty(),
        serde_json::Value::Array(values) => values.is_empty(),
        serde_json::Value::Null => true,
        _ => false,
    }
}

/// Mailbox message carrying one outbound envelope.
#[derive(Message)]
#[rtype(result = "()")]
pub struct SendEnvelope(pub ServerEnvelope);

/// Registry-facing delivery handle backed by the actor's mailbox.
///
/// `try_send` fails once the actor has stopped, which is exactly the
/// "send after disconnect returns false" contract.
struct MailboxSink(Recipient<SendEnvelope>);

impl EnvelopeSink for MailboxSink {
    fn deliver(&self, envelope: ServerEnvelope) -> bool {
        self.0.try_send(SendEnvelope(envelope)).is_ok()
    }
}

/// WebSocket actor for one detection connection.
pub struct DetectionWebSocket {
    /// Set once the handshake registered a session
    client_id: Option<String>,

    /// The session owned by this connection
    session: Option<Arc<Session>>,

    registry: Arc<SessionRegistry>,
    engine: Arc<DetectionEngine>,

    /// Completion signal of the most recently submitted window's reply.
    /// Each new detection task waits on it before delivering, so replies go
    /// out in submission order.
    delivery_tail: Option<oneshot::Receiver<()>>,

    last_heartbeat: Instant,
}

impl DetectionWebSocket {
    pub fn new(registry: Arc<SessionRegistry>, engine: Arc<DetectionEngine>) -> Self {
        Self {
            client_id: None,
            session: None,
            registry,
            engine,
            delivery_tail: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_envelope(&self, envelope: &ServerEnvelope, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(envelope) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize envelope: {}", err),
        }
    }

    /// Handshaking state: the first text frame supplies (or triggers
    /// generation of) the client id. The frame is consumed here and not
    /// re-dispatched as a protocol message.
    fn handle_handshake(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("Malformed handshake message: {}", err);
                self.send_envelope(
                    &ServerEnvelope::error(format!("Invalid handshake: {}", err)),
                    ctx,
                );
                ctx.stop();
                return;
            }
        };

        let client_id = envelope.client_id.unwrap_or_else(|| {
            let generated = Uuid::new_v4().to_string();
            warn!("No client_id provided, generated: {}", generated);
            generated
        });

        let sink = Box::new(MailboxSink(ctx.address().recipient()));
        match self.registry.connect(&client_id, sink) {
            Ok(session) => {
                self.session = Some(session);
                self.send_envelope(&ServerEnvelope::connected(client_id.clone()), ctx);
                self.client_id = Some(client_id);
            }
            Err(err) => {
                warn!("Rejected connection for {}: {}", client_id, err);
                self.send_envelope(&ServerEnvelope::error(err.to_string()), ctx);
                ctx.stop();
            }
        }
    }

    /// Active state: parse, route, reply. Parse and handling failures become
    /// `error` envelopes; the connection stays open.
    fn handle_active(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let session = match &self.session {
            Some(session) => session.clone(),
            None => return,
        };

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.send_envelope(
                    &ServerEnvelope::error(format!("Invalid JSON: {}", err)),
                    ctx,
                );
                return;
            }
        };

        match dispatch(&session, envelope, unix_now()) {
            Dispatch::Reply(reply) => self.send_envelope(&reply, ctx),
            Dispatch::Detect {
                window,
                sample_rate,
            } => self.spawn_detection(window, sample_rate),
            Dispatch::Silent => {}
        }
    }

    /// Classify a completed window off the connection loop.
    ///
    /// Windows from this session may classify concurrently, but their replies
    /// are chained through oneshot completion signals so they always reach
    /// the client in submission order.
    fn spawn_detection(&mut self, window: Vec<f32>, sample_rate: u32) {
        let client_id = match &self.client_id {
            Some(id) => id.clone(),
            None => return,
        };

        let previous = self.delivery_tail.take();
        let (done, tail) = oneshot::channel();
        self.delivery_tail = Some(tail);

        tokio::spawn(classify_and_deliver(
            self.engine.clone(),
            self.registry.clone(),
            client_id,
            window,
            sample_rate,
            previous,
            done,
        ));
    }
}

/// Classify one window and deliver the verdict through the registry.
///
/// Delivery waits for the previous window's reply to go out first, so a slow
/// classification is never overtaken by a faster later one from the same
/// session. If this client disconnects while the classifier is running, the
/// result is discarded (send returns false) rather than erroring.
async fn classify_and_deliver(
    engine: Arc<DetectionEngine>,
    registry: Arc<SessionRegistry>,
    client_id: String,
    window: Vec<f32>,
    sample_rate: u32,
    previous: Option<oneshot::Receiver<()>>,
    done: oneshot::Sender<()>,
) {
    let outcome = engine.detect(window, sample_rate).await;

    // A dropped sender (previous task gone) unblocks immediately
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    match outcome {
        Ok((result, elapsed_ms)) => {
            if let Some(session) = registry.get(&client_id) {
                session.record_detection();
            }
            let delivered = registry.send(
                &client_id,
                ServerEnvelope::detection_result(result, elapsed_ms),
            );
            if !delivered {
                debug!("Discarding detection result for {}: client gone", client_id);
            }
        }
        Err(err) => {
            error!("Error processing audio for {}: {}", client_id, err);
            registry.send(&client_id, ServerEnvelope::error(err.to_string()));
        }
    }

    let _ = done.send(());
}

impl Actor for DetectionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("WebSocket connection started");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// Closed state: remove the session exactly once, no matter how the
    /// connection ended.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(client_id) = &self.client_id {
            self.registry.disconnect(client_id);
        }
        info!("WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DetectionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                if self.session.is_none() {
                    self.handle_handshake(&text, ctx);
                } else {
                    self.handle_active(&text, ctx);
                }
            }
            Ok(ws::Message::Binary(_)) => {
                // The protocol is JSON-over-text in both directions
                self.send_envelope(
                    &ServerEnvelope::error("Binary frames are not supported; send JSON envelopes"),
                    ctx,
                );
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<SendEnvelope> for DetectionWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendEnvelope, ctx: &mut Self::Context) {
        self.send_envelope(&msg.0, ctx);
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to a fresh actor sharing the app-wide registry and engine.
pub async fn detect_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        "New WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );

    let websocket = DetectionWebSocket::new(app_state.registry.clone(), app_state.engine.clone());
    ws::start(websocket, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::StreamBufferConfig;
    use serde_json::json;

    struct NullSink;

    impl EnvelopeSink for NullSink {
        fn deliver(&self, _envelope: ServerEnvelope) -> bool {
            true
        }
    }

    fn test_session() -> (SessionRegistry, Arc<Session>) {
        let registry = SessionRegistry::new(StreamBufferConfig::default());
        let session = registry.connect("client-1", Box::new(NullSink)).unwrap();
        (registry, session)
    }

    fn envelope(value: serde_json::Value) -> ClientEnvelope {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unknown_message_type_yields_error_reply() {
        let (_registry, session) = test_session();
        let outcome = dispatch(&session, envelope(json!({"type": "foo"})), 0.0);

        match outcome {
            Dispatch::Reply(ServerEnvelope::Error { message, .. }) => {
                assert_eq!(message, "Unknown message type: foo");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_type_defaults_to_unknown() {
        let (_registry, session) = test_session();
        let outcome = dispatch(&session, envelope(json!({})), 0.0);

        match outcome {
            Dispatch::Reply(ServerEnvelope::Error { message, .. }) => {
                assert_eq!(message, "Unknown message type: unknown");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_chunk_without_payload_is_an_error() {
        let (_registry, session) = test_session();
        let outcome = dispatch(&session, envelope(json!({"type": "audio_chunk"})), 0.0);

        match outcome {
            Dispatch::Reply(ServerEnvelope::Error { message, .. }) => {
                assert_eq!(message, "Missing audio_data");
            }
            other => panic!("expected error reply, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_chunk_with_empty_payload_is_missing() {
        let (_registry, session) = test_session();

        for payload in [json!(""), json!([])] {
            let outcome = dispatch(
                &session,
                envelope(json!({
                    "type": "audio_chunk",
                    "audio_data": payload,
                })),
                0.0,
            );
            match outcome {
                Dispatch::Reply(ServerEnvelope::Error { message, .. }) => {
                    assert_eq!(message, "Missing audio_data");
                }
                other => panic!("expected error reply, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_audio_chunk_with_bad_payload_keeps_connection_semantics() {
        let (_registry, session) = test_session();
        let outcome = dispatch(
            &session,
            envelope(json!({
                "type": "audio_chunk",
                "audio_data": "!!not-base64!!",
            })),
            0.0,
        );

        // An error reply, not a Detect or a panic: the loop stays Active
        assert!(matches!(
            outcome,
            Dispatch::Reply(ServerEnvelope::Error { .. })
        ));
    }

    #[test]
    fn test_audio_chunk_accumulates_silently_until_window_ready() {
        let (_registry, session) = test_session();

        // 0.25s of audio at 16 kHz: below min_duration, no reply at all
        let quarter_second = codec::encode_base64(&vec![0.0f32; 4000]);
        let outcome = dispatch(
            &session,
            envelope(json!({
                "type": "audio_chunk",
                "audio_data": quarter_second,
            })),
            100.0,
        );
        assert!(matches!(outcome, Dispatch::Silent));

        // Another 0.25s reaches min_duration: a window is extracted
        let quarter_second = codec::encode_base64(&vec![0.0f32; 4000]);
        let outcome = dispatch(
            &session,
            envelope(json!({
                "type": "audio_chunk",
                "audio_data": quarter_second,
            })),
            100.0,
        );
        match outcome {
            Dispatch::Detect {
                window,
                sample_rate,
            } => {
                assert_eq!(window.len(), 8000);
                assert_eq!(sample_rate, 16000);
            }
            other => panic!("expected a detection window, got {:?}", other),
        }
    }

    #[test]
    fn test_config_updates_buffer_in_place() {
        let (_registry, session) = test_session();
        let outcome = dispatch(
            &session,
            envelope(json!({
                "type": "config",
                "sample_rate": 8000,
                "chunk_duration": 2.0,
            })),
            0.0,
        );

        assert!(matches!(
            outcome,
            Dispatch::Reply(ServerEnvelope::ConfigUpdated { .. })
        ));
        assert_eq!(session.buffer().sample_rate(), 8000);
    }

    #[test]
    fn test_ping_yields_pong() {
        let (_registry, session) = test_session();
        let outcome = dispatch(&session, envelope(json!({"type": "ping"})), 0.0);
        assert!(matches!(
            outcome,
            Dispatch::Reply(ServerEnvelope::Pong { .. })
        ));
    }

    #[test]
    fn test_stats_reply_counts_messages() {
        let (_registry, session) = test_session();
        dispatch(&session, envelope(json!({"type": "ping"})), 0.0);
        dispatch(&session, envelope(json!({"type": "ping"})), 0.0);
        let outcome = dispatch(&session, envelope(json!({"type": "stats"})), 0.0);

        match outcome {
            Dispatch::Reply(ServerEnvelope::Stats { stats, .. }) => {
                assert_eq!(stats.total_messages, 3);
                assert_eq!(stats.total_detections, 0);
                assert_eq!(stats.buffer.buffer_size, 0);
            }
            other => panic!("expected stats reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detection_replies_keep_submission_order() {
        use crate::detection::detector::{ClassScores, Detector};

        /// Latency proportional to the window length, verdict tagged with it.
        struct VariableLatencyDetector;

        impl Detector for VariableLatencyDetector {
            fn name(&self) -> &str {
                "variable"
            }

            fn detect(&self, samples: &[f32], _sample_rate: u32) -> crate::error::AppResult<DetectionResult> {
                std::thread::sleep(Duration::from_millis(samples.len() as u64));
                Ok(DetectionResult {
                    label: "bonafide".to_string(),
                    score: 1.0,
                    all_scores: ClassScores {
                        spoof: 0.0,
                        bonafide: 1.0,
                    },
                    logits: Some(vec![samples.len() as f32]),
                })
            }
        }

        struct CollectingSink(Arc<std::sync::Mutex<Vec<ServerEnvelope>>>);

        impl EnvelopeSink for CollectingSink {
            fn deliver(&self, envelope: ServerEnvelope) -> bool {
                self.0.lock().unwrap().push(envelope);
                true
            }
        }

        let registry = Arc::new(SessionRegistry::new(StreamBufferConfig::default()));
        let delivered = Arc::new(std::sync::Mutex::new(Vec::new()));
        registry
            .connect("client-1", Box::new(CollectingSink(delivered.clone())))
            .unwrap();

        let engine = Arc::new(DetectionEngine::new(Arc::new(VariableLatencyDetector), 4));

        // First window classifies slowly (150 ms), second quickly (1 ms),
        // chained the way spawn_detection chains them
        let (first_done, after_first) = oneshot::channel();
        let (second_done, _tail) = oneshot::channel();
        let first = tokio::spawn(classify_and_deliver(
            engine.clone(),
            registry.clone(),
            "client-1".to_string(),
            vec![0.0; 150],
            16000,
            None,
            first_done,
        ));
        let second = tokio::spawn(classify_and_deliver(
            engine,
            registry,
            "client-1".to_string(),
            vec![0.0; 1],
            16000,
            Some(after_first),
            second_done,
        ));
        first.await.unwrap();
        second.await.unwrap();

        let delivered = delivered.lock().unwrap();
        let window_lengths: Vec<f32> = delivered
            .iter()
            .map(|envelope| match envelope {
                ServerEnvelope::DetectionResult { result, .. } => {
                    result.logits.as_ref().unwrap()[0]
                }
                other => panic!("unexpected envelope: {:?}", other),
            })
            .collect();
        assert_eq!(window_lengths, vec![150.0, 1.0]);
    }

    #[test]
    fn test_server_envelope_wire_shape() {
        let connected = ServerEnvelope::connected("client-1".to_string());
        let json = serde_json::to_value(&connected).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["client_id"], "client-1");
        assert!(json["timestamp"].is_f64());

        let error = ServerEnvelope::error("boom");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_client_envelope_defaults() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"type": "audio_chunk", "audio_data": "AAAA"}"#).unwrap();
        assert_eq!(envelope.message_type, "audio_chunk");
        assert!(envelope.sample_rate.is_none());
        assert!(envelope.encoding.is_none());
        assert!(envelope.client_id.is_none());
    }
}
