//! Prometheus instrumentation for the gateway.
//!
//! One process-wide [`prometheus::Registry`] behind a [`MetricsCollector`], held as a
//! `lazy_static`-backed process static rather than a DI-passed registry, the same way
//! [`crate::clients::support::shared_http_client`] holds its pooled client. [`TimedOperation`] is
//! an RAII stand-in for the original's `with TimedOperation(...) as t:` context manager —
//! dropping it records the duration, and, if armed with an error type via
//! [`TimedOperation::fail`], an error counter increment too.

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    static ref LLM_REQUESTS_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("llm_requests_total", "Total number of LLM requests"),
            &["provider", "model", "tier", "cache_status"],
        )
        .expect("metric options are valid");
        REGISTRY.register(Box::new(c.clone())).expect("first registration of llm_requests_total");
        c
    };

    static ref LLM_REQUEST_DURATION: HistogramVec = {
        let opts = prometheus::HistogramOpts::new(
            "llm_request_duration_seconds",
            "Time spent on LLM requests",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 60.0, 120.0]);
        let h = HistogramVec::new(opts, &["provider", "model", "cache_status"])
            .expect("metric options are valid");
        REGISTRY.register(Box::new(h.clone())).expect("first registration of llm_request_duration_seconds");
        h
    };

    static ref LLM_TOKENS_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("llm_tokens_total", "Total tokens processed"),
            &["provider", "model", "type"],
        )
        .expect("metric options are valid");
        REGISTRY.register(Box::new(c.clone())).expect("first registration of llm_tokens_total");
        c
    };

    static ref LLM_COST_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("llm_cost_total", "Total cost of LLM requests in USD"),
            &["provider", "model"],
        )
        .expect("metric options are valid");
        REGISTRY.register(Box::new(c.clone())).expect("first registration of llm_cost_total");
        c
    };

    static ref ACTIVE_CONNECTIONS: Gauge = {
        let g = Gauge::new("llm_service_active_connections", "Number of active HTTP connections")
            .expect("metric options are valid");
        REGISTRY.register(Box::new(g.clone())).expect("first registration of llm_service_active_connections");
        g
    };

    static ref ERROR_REQUESTS_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("llm_service_errors_total", "Total number of errors"),
            &["error_type", "component"],
        )
        .expect("metric options are valid");
        REGISTRY.register(Box::new(c.clone())).expect("first registration of llm_service_errors_total");
        c
    };

    static ref MCP_REQUESTS_TOTAL: CounterVec = {
        let c = CounterVec::new(
            Opts::new("llm_mcp_requests_total", "Total number of MCP requests"),
            &["name", "function", "status"],
        )
        .expect("metric options are valid");
        REGISTRY.register(Box::new(c.clone())).expect("first registration of llm_mcp_requests_total");
        c
    };

    static ref MCP_REQUEST_DURATION: HistogramVec = {
        let opts = prometheus::HistogramOpts::new(
            "llm_mcp_request_duration_seconds",
            "Time spent on MCP requests",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
        let h = HistogramVec::new(opts, &["name", "function", "status"])
            .expect("metric options are valid");
        REGISTRY.register(Box::new(h.clone())).expect("first registration of llm_mcp_request_duration_seconds");
        h
    };
}

/// Façade over the process-wide metric set. Cheap to construct (every method reaches into the
/// `lazy_static` registry above); kept as a struct so call sites read like the original's
/// `metrics.record_llm_request(...)` rather than a pile of free functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one completed (non-streaming) LLM request: counters, duration histogram, token and
    /// cost totals. `cache_hit` selects the `cache_status` label.
    #[allow(clippy::too_many_arguments)]
    pub fn record_llm_request(
        &self,
        provider: &str,
        model: &str,
        tier: &str,
        cache_hit: bool,
        duration_seconds: f64,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost: f64,
    ) {
        let cache_status = if cache_hit { "hit" } else { "miss" };

        LLM_REQUESTS_TOTAL.with_label_values(&[provider, model, tier, cache_status]).inc();
        LLM_REQUEST_DURATION
            .with_label_values(&[provider, model, cache_status])
            .observe(duration_seconds);
        LLM_TOKENS_TOTAL
            .with_label_values(&[provider, model, "prompt"])
            .inc_by(prompt_tokens as f64);
        LLM_TOKENS_TOTAL
            .with_label_values(&[provider, model, "completion"])
            .inc_by(completion_tokens as f64);
        LLM_COST_TOTAL.with_label_values(&[provider, model]).inc_by(cost);
    }

    pub fn record_error(&self, error_type: &str, component: &str) {
        ERROR_REQUESTS_TOTAL.with_label_values(&[error_type, component]).inc();
    }

    pub fn set_active_connections(&self, count: i64) {
        ACTIVE_CONNECTIONS.set(count as f64);
    }

    pub fn record_mcp_request(&self, name: &str, function: &str, status: &str, duration_seconds: f64) {
        MCP_REQUESTS_TOTAL.with_label_values(&[name, function, status]).inc();
        MCP_REQUEST_DURATION
            .with_label_values(&[name, function, status])
            .observe(duration_seconds);
    }

    /// Render the registry in the Prometheus text exposition format, for a `/metrics` handler.
    pub fn render(&self) -> String {
        let metric_families = REGISTRY.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf).expect("text encoding never fails for valid metrics");
        String::from_utf8(buf).expect("prometheus text encoder always emits valid utf-8")
    }
}

/// RAII stand-in for the original's `TimedOperation` context manager: records a duration on
/// drop, and, if [`fail`](Self::fail) was called first, an error count against `component` too.
pub struct TimedOperation {
    component: &'static str,
    start: Instant,
    error_type: Option<String>,
}

impl TimedOperation {
    pub fn start(component: &'static str) -> Self {
        Self {
            component,
            start: Instant::now(),
            error_type: None,
        }
    }

    /// Mark this operation as having failed with `error_type`; recorded against
    /// [`ERROR_REQUESTS_TOTAL`] when the guard drops.
    pub fn fail(&mut self, error_type: impl Into<String>) {
        self.error_type = Some(error_type.into());
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if let Some(error_type) = self.error_type.take() {
            MetricsCollector::new().record_error(&error_type, self.component);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_llm_request_and_renders() {
        let m = MetricsCollector::new();
        m.record_llm_request("openai", "gpt-4o-mini", "small", true, 0.42, 120, 30, 0.0009);
        let rendered = m.render();
        assert!(rendered.contains("llm_requests_total"));
        assert!(rendered.contains("llm_request_duration_seconds"));
    }

    #[test]
    fn timed_operation_records_error_on_fail() {
        let before = {
            let text = MetricsCollector::new().render();
            count_metric_line(&text, "llm_service_errors_total", "tool_validation", "tools")
        };
        {
            let mut t = TimedOperation::start("tools");
            t.fail("tool_validation");
        }
        let after = {
            let text = MetricsCollector::new().render();
            count_metric_line(&text, "llm_service_errors_total", "tool_validation", "tools")
        };
        assert!(after > before);
    }

    fn count_metric_line(text: &str, metric: &str, error_type: &str, component: &str) -> f64 {
        for line in text.lines() {
            if line.starts_with(metric)
                && line.contains(&format!("error_type=\"{error_type}\""))
                && line.contains(&format!("component=\"{component}\""))
            {
                if let Some(value) = line.split_whitespace().last() {
                    return value.parse().unwrap_or(0.0);
                }
            }
        }
        0.0
    }
}
