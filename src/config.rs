//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_STREAM_SAMPLE_RATE, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use crate::audio::buffer::StreamBufferConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub detection: DetectionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Defaults applied to every new session's stream buffer.
///
/// ## Fields:
/// - `sample_rate`: audio sample rate in Hz (clients may override per message)
/// - `chunk_duration`: length of each processing window in seconds
/// - `overlap_duration`: overlap between consecutive windows in seconds; the
///   processing interval is `chunk_duration - overlap_duration`
/// - `min_duration`: minimum buffered audio before a window may be emitted
/// - `max_buffer_seconds`: ring capacity; oldest samples are evicted beyond it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub chunk_duration: f64,
    pub overlap_duration: f64,
    pub min_duration: f64,
    pub max_buffer_seconds: f64,
}

/// Detector-related settings.
///
/// ## Fields:
/// - `model`: which registered detector to build at startup
/// - `max_concurrent_detections`: upper bound on classifier calls running at
///   once; further windows wait on the semaphore instead of piling up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub model: String,
    pub max_concurrent_detections: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8765,
            },
            stream: StreamConfig {
                sample_rate: 16000,
                chunk_duration: 1.0,
                overlap_duration: 0.5,
                min_duration: 0.5,
                max_buffer_seconds: 10.0,
            },
            detection: DetectionConfig {
                model: "energy".to_string(),
                max_concurrent_detections: 4,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_STREAM_SAMPLE_RATE=8000`: Override default sample rate
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Sample rate is non-zero
    /// - Window geometry is usable (positive chunk, overlap shorter than chunk)
    /// - At least one detection slot exists
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.stream.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }

        if self.stream.chunk_duration <= 0.0 {
            return Err(anyhow::anyhow!("Chunk duration must be greater than 0"));
        }

        if self.stream.overlap_duration < 0.0
            || self.stream.overlap_duration >= self.stream.chunk_duration
        {
            return Err(anyhow::anyhow!(
                "Overlap duration must be in [0, chunk_duration)"
            ));
        }

        if self.stream.max_buffer_seconds <= 0.0 {
            return Err(anyhow::anyhow!("Buffer capacity must be greater than 0"));
        }

        if self.detection.max_concurrent_detections == 0 {
            return Err(anyhow::anyhow!(
                "Max concurrent detections must be greater than 0"
            ));
        }

        Ok(())
    }
}

impl StreamConfig {
    /// Convert to the per-session buffer configuration.
    pub fn to_buffer_config(&self) -> StreamBufferConfig {
        StreamBufferConfig {
            sample_rate: self.sample_rate,
            chunk_duration: self.chunk_duration,
            overlap_duration: self.overlap_duration,
            min_duration: self.min_duration,
            max_buffer_seconds: self.max_buffer_seconds,
        }
    }
}
