//! Source health monitor and circuit breaker.
//!
//! Health lives in the store, not in memory, so routing decisions survive
//! process restarts and horizontally-scaled deployments. The breaker is
//! derived from two persisted counters: `consecutive_failures` and
//! `skipped_cycles`.

use sqlx::SqlitePool;
use tracing::{info, warn};

use vodsync_core::types::HealthStatus;
use vodsync_db::repo::{health, sources};
use vodsync_spider::client::{ProbeResult, SpiderClient};
use vodsync_spider::SourceRef;

/// Failures before the circuit opens.
pub const FAILURE_THRESHOLD: i64 = 3;

/// Probes slower than this are `slow`, not `healthy`.
const SLOW_THRESHOLD_MS: i64 = 2000;

/// EWMA weight for the newest probe outcome.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Eligible for collection.
    Closed,
    /// Skipped for one full orchestrator cycle.
    Open,
    /// One trial run before full reinstatement.
    HalfOpen,
}

/// Breaker state as a pure function of the stored health row.
pub fn circuit_state(row: &health::HealthRow) -> CircuitState {
    if row.consecutive_failures < FAILURE_THRESHOLD {
        CircuitState::Closed
    } else if row.skipped_cycles == 0 {
        CircuitState::Open
    } else {
        CircuitState::HalfOpen
    }
}

/// Fold one probe outcome into the stored health row.
pub async fn record_result(
    pool: &SqlitePool,
    source_id: &str,
    probe: &ProbeResult,
) -> Result<health::HealthRow, sqlx::Error> {
    let mut row = health::get(pool, source_id).await?;
    let was_half_open = circuit_state(&row) == CircuitState::HalfOpen;

    let outcome = if probe.healthy { 1.0 } else { 0.0 };
    row.success_rate = if row.probed_ts.is_none() {
        outcome
    } else {
        (1.0 - EWMA_ALPHA) * row.success_rate + EWMA_ALPHA * outcome
    };
    row.latency_ms = Some(probe.latency_ms);
    row.probed_ts = Some(chrono::Utc::now().timestamp());

    if probe.healthy {
        row.status = if probe.latency_ms > SLOW_THRESHOLD_MS {
            HealthStatus::Slow.as_str().to_string()
        } else {
            HealthStatus::Healthy.as_str().to_string()
        };
        row.last_error = None;
        if row.consecutive_failures >= FAILURE_THRESHOLD {
            info!(source = source_id, "source recovered, circuit closed");
        }
        row.consecutive_failures = 0;
        row.skipped_cycles = 0;
    } else {
        row.status = match probe.error.as_deref() {
            Some("timeout") => HealthStatus::Timeout.as_str().to_string(),
            _ => HealthStatus::Error.as_str().to_string(),
        };
        row.last_error = probe.error.clone();
        row.consecutive_failures += 1;
        // A failed half-open trial re-opens the circuit for another cycle.
        if was_half_open {
            row.skipped_cycles = 0;
        }
        if row.consecutive_failures == FAILURE_THRESHOLD {
            warn!(
                source = source_id,
                failures = row.consecutive_failures,
                "circuit opened for source"
            );
        }
    }

    health::upsert(pool, &row).await?;
    Ok(row)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub probed: i64,
    pub healthy: i64,
}

/// Probe every active source and record the results. Run on a cadence by
/// the scheduler; this is also what moves open circuits to half-open via
/// recovery probes.
pub async fn sweep(pool: &SqlitePool, client: &SpiderClient) -> Result<SweepSummary, sqlx::Error> {
    let sources = sources::list_active(pool).await?;
    if sources.is_empty() {
        warn!("health sweep found no active sources");
        return Ok(SweepSummary::default());
    }

    let mut summary = SweepSummary::default();
    for source in &sources {
        let source_ref = SourceRef {
            id: source.id.clone(),
            base_url: source.base_url.clone(),
        };
        let probe = client.probe(&source_ref).await;
        summary.probed += 1;
        if probe.healthy {
            summary.healthy += 1;
        }
        record_result(pool, &source.id, &probe).await?;
    }

    info!(
        probed = summary.probed,
        healthy = summary.healthy,
        "health sweep finished"
    );
    Ok(summary)
}
