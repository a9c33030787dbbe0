//! # Monitor Daemon
//!
//! Drives [`Monitor::tick`] on a tokio interval until a stop signal arrives.
//!
//! Each tick runs on the blocking pool (registry and process work is
//! synchronous). The stop signal is only observed between ticks, so a
//! transition in progress always completes. A tick that panics is counted as
//! a failure and the loop carries on with the next one.

use modelops_core::primitives::now_millis;
use modelops_core::{Monitor, TickOutcome};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    pub ticks: u64,
    pub breaches: u64,
    pub retrains: u64,
    pub failures: u64,
}

impl MonitorSummary {
    fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Healthy(_) => {}
            TickOutcome::Breach { .. } => {
                self.breaches += 1;
                if outcome.retrained() {
                    self.retrains += 1;
                }
            }
            TickOutcome::Failed(_) => self.failures += 1,
        }
    }

    fn record_aborted(&mut self) {
        self.ticks += 1;
        self.failures += 1;
    }
}

/// Run the monitor every `interval` until `shutdown` becomes `true` (or its
/// sender is dropped), or until `max_ticks` ticks have run. The first tick
/// runs immediately.
pub async fn run_monitor(
    monitor: Monitor,
    interval: Duration,
    max_ticks: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorSummary {
    // tokio's interval rejects a zero period.
    let period = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = MonitorSummary::default();

    tracing::info!(
        model = %monitor.model(),
        interval_secs = period.as_secs_f64(),
        floor = monitor.thresholds().performance_floor,
        drift_sensitivity = monitor.thresholds().drift_sensitivity,
        "monitor loop started"
    );
    let monitor = Arc::new(Mutex::new(monitor));

    loop {
        if *shutdown.borrow() || max_ticks.is_some_and(|max| summary.ticks >= max) {
            break;
        }
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("monitor received stop signal");
                    break;
                }
            }

            _ = ticker.tick() => {
                let monitor = Arc::clone(&monitor);
                let joined = tokio::task::spawn_blocking(move || {
                    // A panicked tick poisons the lock; the monitor itself is
                    // still usable.
                    let mut monitor = monitor.lock().unwrap_or_else(PoisonError::into_inner);
                    monitor.tick(now_millis())
                })
                .await;
                match joined {
                    Ok(outcome) => summary.record(&outcome),
                    Err(e) => {
                        tracing::error!(error = %e, "monitor tick aborted, continuing");
                        summary.record_aborted();
                    }
                }
            }
        }
    }

    tracing::info!(
        ticks = summary.ticks,
        retrains = summary.retrains,
        failures = summary.failures,
        "monitor loop stopped"
    );
    summary
}

/// Stop signal flipped to `true` on Ctrl+C.
#[must_use]
pub fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl+C received, stopping after the current tick");
                let _ = tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for Ctrl+C");
                // Keep the sender alive; dropping it would stop the loop.
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });
    rx
}
