//! # Application State
//!
//! Shared by every HTTP request handler. The worker's long-lived pieces (configuration
//! and the session registry) are immutable `Arc`s; only the request metrics change,
//! and they sit behind a `parking_lot::Mutex` whose critical sections are a few
//! integer updates.
//!
//! Room sessions do not live here. They are owned by the registry and run on their own
//! tasks; handlers only ask the registry to join or report.

use crate::config::AppConfig;
use crate::session::registry::SessionRegistry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub metrics: Arc<Mutex<AppMetrics>>,
    /// When the worker started.
    pub start_time: Instant,
}

/// Request metrics collected by the telemetry middleware.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by `"METHOD /path"`.
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            registry,
            metrics: Arc::new(Mutex::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn increment_request_count(&self) {
        self.metrics.lock().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.lock().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.lock();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the metrics, so the lock is not held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.lock().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
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

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::generator::tests::ScriptedModel;
    use crate::session::room_session::tests::{harness, Harness};

    /// State over a registry backed by in-memory fakes.
    pub(crate) fn test_state() -> (AppState, Harness) {
        let h = harness(ScriptedModel::replying(&["Hello."]));
        let registry = Arc::new(SessionRegistry::new(h.deps.clone()));
        let state = AppState::new(Arc::new(crate::config::test_config()), registry);
        (state, h)
    }

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let (state, _h) = test_state();
        state.record_endpoint_request("POST /join", 10, false);
        state.record_endpoint_request("POST /join", 30, true);
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();

        let snapshot = state.get_metrics_snapshot();
        let join = &snapshot.endpoint_metrics["POST /join"];
        assert_eq!(join.request_count, 2);
        assert_eq!(join.average_duration_ms(), 20.0);
        assert_eq!(join.error_rate(), 0.5);
        assert_eq!(snapshot.error_rate(), 0.5);
    }
}
