//! Health handler
//!
//! Aggregates vector-store and LLM reachability. Returns 503 when any
//! dependency is down so load balancers rotate the instance out.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub services: ServiceChecks,
    pub uptime_s: u64,
    pub memory_mb: Option<u64>,
    pub environment: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ServiceChecks {
    pub vector: CheckResult,
    pub llm: CheckResult,
    pub database: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn run_check<F, Fut>(f: F) -> CheckResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = chatforge_common::Result<()>>,
{
    let start = std::time::Instant::now();
    match f().await {
        Ok(_) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            error: None,
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(e.to_string()),
        },
    }
}

/// Resident set size in megabytes, when the platform exposes it.
fn memory_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / 1024)
}

/// Aggregate health; 503 when degraded.
pub async fn health(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let (vector, llm, database) = tokio::join!(
        run_check(|| state.vector.health()),
        run_check(|| state.llm.health()),
        run_check(|| state.repo.ping()),
    );

    let all_up = [&vector, &llm, &database]
        .iter()
        .all(|c| c.status == "up");

    let response = HealthResponse {
        status: if all_up { "healthy" } else { "degraded" }.to_string(),
        services: ServiceChecks {
            vector,
            llm,
            database,
        },
        uptime_s: state.started_at.elapsed().as_secs(),
        memory_mb: memory_mb(),
        environment: state.config.observability.environment.clone(),
        version: chatforge_common::VERSION.to_string(),
    };

    let code = if all_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}
