//! # Detection Module
//!
//! The classifier side of the pipeline: the [`detector::Detector`] trait and
//! its baseline implementation, and the bounded [`engine::DetectionEngine`]
//! that the WebSocket dispatcher submits processing windows through.

pub mod detector;
pub mod engine;
