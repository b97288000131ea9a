//! Drives repeated ticks with fixed pacing and cooperative abort.

use std::time::Duration;

use tracing::{error, info, warn};

use crate::cancellation::CancellationSignal;
use crate::engine::AssetEngine;
use crate::error::EngineError;
use crate::outcome::TickReport;

pub struct EngineLoopOptions {
    pub interval_ms: u64,
    pub single_tick: bool,
}

impl Default for EngineLoopOptions {
    fn default() -> Self {
        EngineLoopOptions {
            interval_ms: 60_000,
            single_tick: false,
        }
    }
}

/// Repeatedly ticks `engine`, sleeping `max(0, interval_ms - elapsed)`
/// between ticks, until `signal` is cancelled or `options.single_tick` is set.
/// `on_error` is invoked with any tick-level error (programmer errors only —
/// per-instance failures are captured in the returned `TickReport` and never
/// surface here); the loop keeps running after `on_error` unless `signal` is
/// cancelled from within it.
pub async fn run_engine_loop<F>(
    engine: &AssetEngine,
    options: EngineLoopOptions,
    signal: &CancellationSignal,
    mut on_error: F,
) where
    F: FnMut(&EngineError),
{
    loop {
        if signal.is_cancelled() {
            info!("engine loop cancelled before tick");
            break;
        }

        let started = tokio::time::Instant::now();
        match engine.tick(signal).await {
            Ok(report) => log_report(&report),
            Err(err) => {
                error!(error = %err, "tick failed");
                on_error(&err);
            }
        }

        if options.single_tick {
            break;
        }
        if signal.is_cancelled() {
            break;
        }

        let elapsed = started.elapsed();
        let interval = Duration::from_millis(options.interval_ms);
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        } else {
            warn!(elapsed_ms = elapsed.as_millis() as u64, interval_ms = options.interval_ms, "tick exceeded its interval");
        }
    }
}

fn log_report(report: &TickReport) {
    let errors = report
        .root_outcomes
        .iter()
        .chain(report.fanout_target_outcomes.iter())
        .filter(|o| matches!(o.status, crate::outcome::OutcomeStatus::Error))
        .count();
    info!(
        planner_run_id = %report.planner_run_id,
        roots = report.root_outcomes.len(),
        fanout_targets = report.fanout_target_outcomes.len(),
        errors,
        "tick report"
    );
}
