use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Records request counts, per-endpoint timings, and error totals into
/// [`AppState`] for the `/metrics` endpoint.
///
/// Requests are bucketed by label: WebSocket upgrade requests as
/// `WS <path>` (only the upgrade itself is timed, not the session), plain
/// HTTP requests as `<METHOD> <path>`.
pub struct RequestMetrics;

impl<S, B> Transform<S, ServiceRequest> for RequestMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestMetricsService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestMetricsService { service }))
    }
}

pub struct RequestMetricsService<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestMetricsService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let endpoint = endpoint_label(&req);
        let start = Instant::now();

        if let Some(state) = req.app_data::<web::Data<AppState>>() {
            state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let response = fut.await?;
            let duration_ms = start.elapsed().as_millis() as u64;

            // 101 Switching Protocols is a successful upgrade
            let status = response.status();
            let is_error = status.is_client_error() || status.is_server_error();

            if let Some(state) = response.request().app_data::<web::Data<AppState>>() {
                state.record_endpoint_request(&endpoint, duration_ms, is_error);
                if is_error {
                    state.increment_error_count();
                }
            }

            Ok(response)
        })
    }
}

/// Metrics bucket for one request.
fn endpoint_label(req: &ServiceRequest) -> String {
    let is_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if is_upgrade {
        format!("WS {}", req.uri().path())
    } else {
        format!("{} {}", req.method(), req.uri().path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_plain_requests_bucket_by_method_and_path() {
        let req = TestRequest::get().uri("/health").to_srv_request();
        assert_eq!(endpoint_label(&req), "GET /health");
    }

    #[test]
    fn test_websocket_upgrades_bucket_separately() {
        let req = TestRequest::get()
            .uri("/ws/detect")
            .insert_header((header::UPGRADE, "websocket"))
            .to_srv_request();
        assert_eq!(endpoint_label(&req), "WS /ws/detect");
    }

    #[test]
    fn test_non_websocket_upgrade_is_a_plain_request() {
        let req = TestRequest::get()
            .uri("/health")
            .insert_header((header::UPGRADE, "h2c"))
            .to_srv_request();
        assert_eq!(endpoint_label(&req), "GET /health");
    }
}
