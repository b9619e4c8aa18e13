//! # Application State Management
//!
//! Shared state every HTTP handler and WebSocket connection can reach.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//! - Used for the configuration (read on every call, written by `PUT /api/v1/config`) and
//!   for the HTTP metrics (written by the middleware on every request)
//!
//! ### Atomics for Hot Counters
//! The relay counters change on every media frame, so they are plain atomics behind an
//! `Arc` instead of sitting behind the lock.
//!
//! ### RAII Call Permits
//! Admission to the call limit is a [`CallPermit`]. Dropping the permit gives the slot
//! back, so no exit path of a call can leak a slot.

use crate::config::AppConfig;
use crate::conversation::SessionFactory;
use crate::relay::{RelayCounters, RelayObserver};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP metrics and the active call gauge
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Relay counters shared by every call
    pub relay: Arc<RelayCounters>,

    /// Builds a conversation session for each call
    pub sessions: Arc<dyn SessionFactory>,

    /// Extra observer attached to every call (the transcript console, when enabled)
    pub console: Option<Arc<dyn RelayObserver>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and calls.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of failed HTTP requests
    pub error_count: u64,

    /// Calls currently connected
    pub active_calls: usize,

    /// Calls accepted since server start
    pub accepted_calls: u64,

    /// Calls refused because of the call limit
    pub rejected_calls: u64,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// A slot under the call limit. The slot is released when the permit is dropped.
#[derive(Debug)]
pub struct CallPermit {
    metrics: Arc<RwLock<AppMetrics>>,
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_calls = metrics.active_calls.saturating_sub(1);
    }
}

impl AppState {
    pub fn new(
        config: AppConfig,
        sessions: Arc<dyn SessionFactory>,
        console: Option<Arc<dyn RelayObserver>>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            relay: Arc::new(RelayCounters::new()),
            sessions,
            console,
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately; each call works from its own snapshot.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record one request against `endpoint` (e.g. "GET /health").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Claim a call slot, or `None` when `max_calls` calls are already active.
    ///
    /// The check and the increment happen under one write lock, so concurrent upgrades
    /// cannot overshoot the limit.
    pub fn try_acquire_call(&self, max_calls: usize) -> Option<CallPermit> {
        let mut metrics = self.metrics_mut();
        if metrics.active_calls >= max_calls {
            metrics.rejected_calls += 1;
            return None;
        }

        metrics.active_calls += 1;
        metrics.accepted_calls += 1;
        Some(CallPermit {
            metrics: self.metrics.clone(),
        })
    }

    pub fn active_calls(&self) -> usize {
        self.metrics_ref().active_calls
    }

    /// Get a snapshot of current metrics (for `/health` and `/api/v1/metrics`).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
