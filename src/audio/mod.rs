//! # Audio Streaming Module
//!
//! The streaming session layer: frame transcoding, per-session sliding-window
//! buffering, and session registry.
//!
//! ## Key Components:
//! - **Frame Codec**: base64/JSON payloads to float samples and back
//! - **Stream Buffer**: fixed-capacity ring with dual-gated window extraction
//! - **Session Registry**: thread-safe lookup, creation, and teardown of
//!   per-connection sessions
//!
//! The WebSocket dispatcher that drives these lives in `src/websocket.rs`.

pub mod buffer;
pub mod codec;
pub mod session;
