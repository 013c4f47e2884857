//! Metrics and observability utilities
//!
//! Prometheus-style metrics through the `metrics` facade with
//! standardized naming conventions.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Chatforge metrics
pub const METRICS_PREFIX: &str = "chatforge";

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Query metrics
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of RAG queries"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "RAG query latency in seconds"
    );

    describe_counter!(
        format!("{}_query_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total query errors (including timeouts)"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_documents_indexed_total", METRICS_PREFIX),
        Unit::Count,
        "Total documents indexed"
    );

    describe_counter!(
        format!("{}_chunks_stored_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks stored in the vector store"
    );

    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document indexing latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    // Conversation metrics
    describe_counter!(
        format!("{}_messages_total", METRICS_PREFIX),
        Unit::Count,
        "Messages persisted, by sender type"
    );

    describe_counter!(
        format!("{}_handovers_total", METRICS_PREFIX),
        Unit::Count,
        "Handover verdicts, by reason"
    );

    describe_gauge!(
        format!("{}_waiting_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Rooms waiting for an agent"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record query metrics
pub fn record_query(duration_secs: f64, route: &str, error: bool) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "route" => route.to_string()
    )
    .increment(1);

    if error {
        counter!(
            format!("{}_query_errors_total", METRICS_PREFIX),
            "route" => route.to_string()
        )
        .increment(1);
    } else {
        histogram!(
            format!("{}_query_duration_seconds", METRICS_PREFIX),
            "route" => route.to_string()
        )
        .record(duration_secs);
    }
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }

    let _ = batch_size;
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

/// Helper to record ingestion metrics
pub fn record_ingestion(duration_secs: f64, chunks_stored: usize, tenant_id: &str) {
    counter!(
        format!("{}_documents_indexed_total", METRICS_PREFIX),
        "tenant" => tenant_id.to_string()
    )
    .increment(1);

    counter!(
        format!("{}_chunks_stored_total", METRICS_PREFIX),
        "tenant" => tenant_id.to_string()
    )
    .increment(chunks_stored as u64);

    histogram!(format!("{}_ingestion_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Helper to record a persisted message
pub fn record_message(sender_type: &str) {
    counter!(
        format!("{}_messages_total", METRICS_PREFIX),
        "sender" => sender_type.to_string()
    )
    .increment(1);
}

/// Helper to record a handover verdict
pub fn record_handover(reason: &str, immediate: bool) {
    counter!(
        format!("{}_handovers_total", METRICS_PREFIX),
        "reason" => reason.to_string(),
        "immediate" => immediate.to_string()
    )
    .increment(1);
}

/// Helper to publish the waiting-queue depth
pub fn record_queue_depth(depth: usize) {
    gauge!(format!("{}_waiting_queue_depth", METRICS_PREFIX)).set(depth as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metrics() {
        let metrics = RequestMetrics::start("POST", "/chat/message");
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.finish(200);
        // Just verify it runs without panic
    }

    #[test]
    fn test_record_helpers() {
        record_query(0.1, "vector", false);
        record_query(0.1, "vector", true);
        record_cache(true, "answers");
        record_ingestion(1.2, 10, "acme");
        record_message("customer");
        record_handover("explicit_request", true);
        record_queue_depth(3);
    }
}
