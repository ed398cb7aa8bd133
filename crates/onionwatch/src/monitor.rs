//! Monitor Scheduler
//!
//! Periodic rescans of registered monitors. A single tick loop collects due
//! monitors and hands them to a bounded worker pool; one scan per monitor is
//! in flight at a time, pause is sticky, and an overdue monitor runs once
//! and reschedules from completion (missed ticks are never backfilled).

use crate::config::WatchConfig;
use crate::scanner::Scanner;
use crate::store::{Store, StoreError};
use crate::{
    fingerprint, Monitor, MonitorScanSummary, RiskLevel, ScanRecord, UrlStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info};

pub const MIN_INTERVAL_MINUTES: u32 = 1;
pub const MAX_INTERVAL_MINUTES: u32 = 1440;

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("interval out of range: {0} (allowed 1..=1440)")]
    InvalidInterval(u32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct MonitorScheduler {
    store: Arc<Store>,
    scanner: Arc<Scanner>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashMap<String, ()>>,
    tick_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
}

/// Releases the per-monitor flag when the worker finishes, unwinding included.
struct InFlightGuard {
    map: Arc<DashMap<String, ()>>,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.map.remove(&self.id);
    }
}

impl MonitorScheduler {
    pub fn new(config: &WatchConfig, store: Arc<Store>, scanner: Arc<Scanner>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            scanner,
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            in_flight: Arc::new(DashMap::new()),
            tick_interval: config.tick_interval,
            shutdown_tx,
        }
    }

    /// Register a monitor; the first scan is due immediately.
    pub fn register(
        &self,
        target: &str,
        interval_minutes: u32,
        owner: &str,
    ) -> Result<Monitor, RegisterError> {
        if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
            return Err(RegisterError::InvalidInterval(interval_minutes));
        }
        let now = Utc::now();
        let monitor = Monitor {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            fingerprint: fingerprint(target),
            owner: owner.to_string(),
            interval_minutes,
            paused: false,
            created_at: now,
            last_scan: None,
            next_scan: now,
            scan_count: 0,
            last_scan_summary: None,
        };
        Ok(self.store.create_monitor(monitor)?)
    }

    /// Tick loop. Runs until `shutdown` is signalled.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick_secs = self.tick_interval.as_secs(), "monitor scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for monitor in self.claim_due(Utc::now()) {
                        let scheduler = self.clone();
                        tokio::spawn(async move {
                            scheduler.run_monitor(monitor).await;
                        });
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("monitor scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Signal the tick loop to stop, then wait for in-flight workers.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        info!("monitor scheduler drained");
    }

    /// Due monitors not already in flight; claiming marks them in flight so
    /// the next tick skips them even if their interval elapses again.
    fn claim_due(&self, now: DateTime<Utc>) -> Vec<Monitor> {
        let mut claimed = Vec::new();
        for monitor in self.store.monitors_due(now) {
            if self.in_flight.contains_key(&monitor.id) {
                continue;
            }
            self.in_flight.insert(monitor.id.clone(), ());
            claimed.push(monitor);
        }
        claimed
    }

    async fn run_monitor(&self, monitor: Monitor) {
        let _guard = InFlightGuard {
            map: self.in_flight.clone(),
            id: monitor.id.clone(),
        };
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let dispatched = Utc::now();
        let result = self.scanner.scan(&monitor.target).await;
        if let Err(e) = &result {
            error!(monitor_id = %monitor.id, url = %monitor.target, "monitor scan failed: {}", e);
        }
        self.finish(&monitor, dispatched, Utc::now(), summary_for(&result));
    }

    /// Post-scan bookkeeping. Rescheduling is completion-relative, which
    /// both honours the interval and drops any backlog accrued while the
    /// monitor was paused or the process was down. A monitor deleted while
    /// in flight is left deleted; its scan record stands on its own.
    fn finish(
        &self,
        monitor: &Monitor,
        dispatched: DateTime<Utc>,
        completed: DateTime<Utc>,
        summary: MonitorScanSummary,
    ) {
        let next = completed + chrono::Duration::minutes(monitor.interval_minutes as i64);
        self.store.update_monitor(&monitor.id, |m| {
            m.last_scan = Some(dispatched);
            m.next_scan = next;
            m.scan_count += 1;
            m.last_scan_summary = Some(summary);
        });
    }
}

/// Condense a scan outcome for the monitor row; a store failure shows up as
/// an ERROR summary and the monitor is retried on its next tick.
fn summary_for(result: &Result<ScanRecord, StoreError>) -> MonitorScanSummary {
    match result {
        Ok(record) => MonitorScanSummary {
            status: record.url_status,
            threat_score: record.threat_score,
            risk_level: record.risk_level,
            category: record.category.clone(),
            email_count: record.emails.len(),
            crypto_count: record.crypto_addresses.len(),
            file_hash_count: record.file_analyses.len(),
            malware_detected: record.threat_indicators.malware_detected,
        },
        Err(_) => MonitorScanSummary {
            status: UrlStatus::Error,
            threat_score: 0,
            risk_level: RiskLevel::Low,
            category: "Unknown".to_string(),
            email_count: 0,
            crypto_count: 0,
            file_hash_count: 0,
            malware_detected: false,
        },
    }
}
