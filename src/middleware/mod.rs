//! Custom actix middleware. Request logging itself comes from
//! `tracing_actix_web::TracingLogger`; this module adds metrics collection.

pub mod metrics;

pub use metrics::RequestMetrics;
