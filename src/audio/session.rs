//! # Session Management
//!
//! Tracks the set of active detection sessions. Each connected client owns
//! exactly one [`Session`]: its stream buffer, a handle for delivering
//! envelopes back over the connection, and per-connection counters. The
//! [`SessionRegistry`] is shared across all connection actors and the HTTP
//! handlers, so every mutating operation goes through an `RwLock`-guarded
//! map; no lock is ever held across a detector call.

use crate::audio::buffer::{BufferStats, StreamBuffer, StreamBufferConfig};
use crate::error::{AppError, AppResult};
use crate::websocket::ServerEnvelope;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Current Unix time as fractional seconds, the timestamp unit used on the
/// wire protocol.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Delivery seam between the registry and the transport.
///
/// The WebSocket actor contributes a mailbox-backed implementation; tests use
/// recording stubs. Delivery returns `false` instead of failing so that a
/// send to a closing connection never crashes a dispatcher loop.
pub trait EnvelopeSink: Send + Sync {
    fn deliver(&self, envelope: ServerEnvelope) -> bool;
}

/// Per-session metadata and buffer snapshot, sent in `stats` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub connected_at: f64,
    pub total_messages: u64,
    pub total_detections: u64,
    #[serde(flatten)]
    pub buffer: BufferStats,
}

/// Server-side state for one connected client.
///
/// The buffer is mutated only from the owning connection's task; the `Mutex`
/// exists because the registry hands out `Arc<Session>` and detection result
/// delivery happens from spawned tasks.
pub struct Session {
    pub client_id: String,

    /// Sliding-window accumulator for this client's audio
    buffer: Mutex<StreamBuffer>,

    /// Connection handle, valid for the connection's lifetime
    sink: Box<dyn EnvelopeSink>,

    connected_at: f64,
    total_messages: AtomicU64,
    total_detections: AtomicU64,
}

impl Session {
    fn new(client_id: String, sink: Box<dyn EnvelopeSink>, config: StreamBufferConfig) -> Self {
        Self {
            client_id,
            buffer: Mutex::new(StreamBuffer::new(config)),
            sink,
            connected_at: unix_now(),
            total_messages: AtomicU64::new(0),
            total_detections: AtomicU64::new(0),
        }
    }

    /// Access the session's stream buffer.
    ///
    /// A poisoned lock is recovered rather than propagated: the buffer holds
    /// only counters and samples, all valid after any partial mutation, and a
    /// panicking dispatcher must not take the whole session down with it.
    pub fn buffer(&self) -> MutexGuard<'_, StreamBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one dispatched protocol message.
    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one completed detection for this session.
    pub fn record_detection(&self) {
        self.total_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            connected_at: self.connected_at,
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_detections: self.total_detections.load(Ordering::Relaxed),
            buffer: self.buffer().stats(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

/// Thread-safe registry of all active sessions.
///
/// ## Concurrency Contract:
/// `connect`/`disconnect`/`get`/`send` may be called concurrently from every
/// connection task. Map access is the only critical section; envelope
/// delivery happens on the sink after the read guard is dropped.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    /// Buffer configuration applied to every new session
    default_config: StreamBufferConfig,
}

impl SessionRegistry {
    pub fn new(default_config: StreamBufferConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    /// Register a new session.
    ///
    /// Fails with [`AppError::DuplicateSession`] if the client id is already
    /// active; an existing session is never silently replaced.
    pub fn connect(
        &self,
        client_id: &str,
        sink: Box<dyn EnvelopeSink>,
    ) -> AppResult<Arc<Session>> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.contains_key(client_id) {
            return Err(AppError::DuplicateSession(client_id.to_string()));
        }

        let session = Arc::new(Session::new(
            client_id.to_string(),
            sink,
            self.default_config.clone(),
        ));
        sessions.insert(client_id.to_string(), session.clone());

        info!("Client {} connected", client_id);
        Ok(session)
    }

    /// Remove a session and its buffer. Idempotent: removing an absent id is
    /// a no-op.
    pub fn disconnect(&self, client_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(client_id).is_some();
        if removed {
            info!("Client {} disconnected", client_id);
        }
        removed
    }

    /// Look up a session without side effects.
    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(client_id).cloned()
    }

    /// Attempt delivery over the session's connection handle.
    ///
    /// Returns `false` (and logs) when the session is gone or the connection
    /// is closed; the caller must not assume delivery succeeded. A result
    /// from an in-flight detection for a disconnected client is simply
    /// discarded this way.
    pub fn send(&self, client_id: &str, envelope: ServerEnvelope) -> bool {
        let session = match self.get(client_id) {
            Some(session) => session,
            None => return false,
        };

        let delivered = session.sink.deliver(envelope);
        if !delivered {
            warn!("Error sending message to {}: connection closed", client_id);
        }
        delivered
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Per-session stats keyed by client id, for the `/stats` endpoint.
    pub fn stats_snapshot(&self) -> HashMap<String, SessionStats> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .iter()
            .map(|(id, session)| (id.clone(), session.stats()))
            .collect()
    }
}
