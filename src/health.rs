use crate::audio::session::unix_now;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();
    let engine_metrics = state.engine.metrics_snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": unix_now(),
        "uptime_seconds": uptime_seconds,
        "active_connections": state.registry.active_count(),
        "service": {
            "name": "deepfake-detection-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "detection": {
            "model": state.engine.detector_name(),
            "max_concurrent": config.detection.max_concurrent_detections,
            "total_requests": engine_metrics.total_requests,
            "failed_requests": engine_metrics.failed_requests,
            "average_processing_time_ms": if engine_metrics.total_requests > 0 {
                engine_metrics.total_processing_time_ms / engine_metrics.total_requests as f64
            } else {
                0.0
            }
        },
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        }
    }))
}

/// Aggregate and per-connection streaming statistics.
pub async fn server_stats(state: web::Data<AppState>) -> HttpResponse {
    let connections = state.registry.stats_snapshot();

    HttpResponse::Ok().json(json!({
        "timestamp": unix_now(),
        "active_connections": connections.len(),
        "connections": connections
    }))
}

/// Per-endpoint HTTP metrics.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": unix_now(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::StreamBufferConfig;
    use crate::audio::session::SessionRegistry;
    use crate::config::AppConfig;
    use crate::detection::detector::build_detector;
    use crate::detection::engine::DetectionEngine;
    use actix_web::body::to_bytes;
    use std::sync::Arc;

    fn state() -> web::Data<AppState> {
        let registry = Arc::new(SessionRegistry::new(StreamBufferConfig::default()));
        let detector = build_detector("energy").unwrap();
        let engine = Arc::new(DetectionEngine::new(detector, 2));
        web::Data::new(AppState::new(AppConfig::default(), registry, engine))
    }

    #[actix_web::test]
    async fn test_health_check_reports_healthy() {
        let response = health_check(state()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);

        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_connections"], 0);
        assert_eq!(json["detection"]["model"], "energy");
    }

    #[actix_web::test]
    async fn test_server_stats_lists_connections() {
        use crate::audio::session::EnvelopeSink;
        use crate::websocket::ServerEnvelope;

        struct NullSink;
        impl EnvelopeSink for NullSink {
            fn deliver(&self, _envelope: ServerEnvelope) -> bool {
                true
            }
        }

        let state = state();
        state
            .registry
            .connect("client-1", Box::new(NullSink))
            .unwrap();

        let response = server_stats(state).await;
        let body = to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["active_connections"], 1);
        assert!(json["connections"]["client-1"]["total_messages"].is_u64());
    }
}
