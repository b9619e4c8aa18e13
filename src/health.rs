//! # Health and Metrics Endpoints
//!
//! - `/health` and `/api/v1/health`: a short status document for load balancers and humans
//! - `/api/v1/metrics`: per-endpoint HTTP statistics plus the relay counters

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let relay = state.relay.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "calls": {
            "active": metrics.active_calls,
            "total": relay.calls_total,
            "rejected": metrics.rejected_calls,
            "mean_mark_rtt_ms": relay.mean_mark_rtt_ms
        },
        "session": {
            "agent_id": config.session.agent_id,
            "sample_rate": config.session.sample_rate
        },
        "system": load_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
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
        "endpoints": endpoint_stats,
        "calls": {
            "active": metrics.active_calls,
            "accepted": metrics.accepted_calls,
            "rejected": metrics.rejected_calls,
            "max_concurrent_calls": state.get_config().performance.max_concurrent_calls
        },
        "relay": state.relay.snapshot()
    }))
}

/// Classify how close the relay is to its call limit.
fn load_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_calls = config.performance.max_concurrent_calls;
    let usage = if max_calls > 0 {
        metrics.active_calls as f64 / max_calls as f64
    } else {
        0.0
    };

    let status = if usage >= 1.0 {
        "at_capacity"
    } else if usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "call_usage_percent": (usage * 100.0).round(),
        "max_calls": max_calls,
        "current_calls": metrics.active_calls
    })
}
