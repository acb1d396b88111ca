//! # Deepfake Detection Backend
//!
//! Real-time audio deepfake detection server. Clients stream audio over a
//! WebSocket at `/ws/detect`; the server accumulates each client's samples in
//! a sliding-window buffer, classifies completed windows off the connection
//! loop, and pushes verdicts back asynchronously. HTTP endpoints expose
//! health, per-connection streaming stats, and request metrics.
//!
//! ## Modules:
//! - **config**: layered configuration (config.toml + APP_ environment variables)
//! - **state**: shared application state and HTTP metrics
//! - **audio**: wire codec, stream buffer, session registry
//! - **detection**: detector trait, registry, bounded detection engine
//! - **websocket**: per-connection actor and protocol dispatch
//! - **health**: health, stats and metrics endpoints
//! - **middleware**: metrics collection
//! - **error**: error types and HTTP error responses

mod audio;
mod config;
mod detection;
mod error;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!(
        "Starting deepfake-detection-backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Configuration loaded: {}:{}",
        config.server.host, config.server.port
    );

    // One registry and one bounded engine shared by every connection
    let registry = Arc::new(audio::session::SessionRegistry::new(
        config.stream.to_buffer_config(),
    ));
    let detector = detection::detector::build_detector(&config.detection.model)?;
    info!("Detector '{}' ready", detector.name());
    let engine = Arc::new(detection::engine::DetectionEngine::new(
        detector,
        config.detection.max_concurrent_detections,
    ));

    let app_state = AppState::new(config.clone(), registry, engine);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestMetrics)
            .route("/health", web::get().to(health::health_check))
            .route("/stats", web::get().to(health::server_stats))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/ws/detect", web::get().to(websocket::detect_websocket))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging via tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deepfake_detection_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Flip the shutdown flag on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
