// src/cache_manager.rs
use super::worker::{SweepReport, WorkerPool};
use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub ttl: Duration,
    pub keep_min: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub workers: usize,
    pub evicted: usize,
    pub remaining: usize,
    pub forward_failures: usize,
}

impl SweepSummary {
    fn from_reports(reports: &[SweepReport]) -> Self {
        reports.iter().fold(
            SweepSummary {
                workers: reports.len(),
                ..Default::default()
            },
            |mut acc, r| {
                acc.evicted += r.evicted;
                acc.remaining += r.remaining;
                acc.forward_failures += r.forward_failures;
                acc
            },
        )
    }
}

/// Background sweep: evicts idle rooms and pulls live events into the rest.
/// The next sweep is only scheduled once every worker has reported.
pub async fn cache_manager_task(pool: WorkerPool, settings: SweepSettings) {
    info!(
        "🧹 Cache Manager started. TTL: {:?}, keep per worker: {}, sweep interval: {:?}",
        settings.ttl, settings.keep_min, settings.interval
    );

    let mut timer = interval_at(Instant::now() + settings.interval, settings.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        run_sweep(&pool, &settings).await;
    }
}

pub async fn run_sweep(pool: &WorkerPool, settings: &SweepSettings) -> SweepSummary {
    info!("[SWEEP] Forward paginating and evicting...");

    let ttl = ChronoDuration::from_std(settings.ttl).unwrap_or(ChronoDuration::MAX);
    let reports = pool.forward_paginate_and_evict(ttl, settings.keep_min).await;
    let summary = SweepSummary::from_reports(&reports);

    if summary.workers < pool.num_workers() {
        warn!(
            "[SWEEP] Only {}/{} workers reported",
            summary.workers,
            pool.num_workers()
        );
    }
    if summary.forward_failures > 0 {
        warn!(
            "[SWEEP] {} rooms failed to forward paginate",
            summary.forward_failures
        );
    }
    if summary.evicted > 0 {
        info!(
            "🧹 [SWEEP] Evicted {} idle rooms, {} still cached.",
            summary.evicted, summary.remaining
        );
    } else {
        info!("[SWEEP] {} rooms cached. No eviction needed.", summary.remaining);
    }
    summary
}
