//! Document Store
//!
//! Four logical collections (scans, monitors, iocs, alerts) plus per-target
//! summary documents, kept in concurrent maps with ordered indexes. Backend
//! is either memory-only or a JSON snapshot directory; no on-disk format is
//! otherwise dictated. Individual operations are atomic; the scan/IOC/alert
//! triple is applied in write order (scan first) so a reader observing a
//! scan also observes its IOCs.

use crate::{
    Alert, AlertStatus, ChangeSet, CompareResult, IocRecord, IocType, Monitor, ScanRecord,
    StatusObservation, TargetSummary, UrlStatus,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::info;

pub const DEFAULT_HISTORY_PAGE: usize = 100;
const SNAPSHOT_FILE: &str = "onionwatch.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    NotFound(String),
    #[error("monitor cap reached for owner {owner} (cap {cap})")]
    MonitorCapReached { owner: String, cap: usize },
}

/// Reuse-set view returned by an IOC upsert.
#[derive(Debug, Clone)]
pub struct IocReuse {
    /// Distinct targets the value has been seen on, after this insert.
    pub targets: Vec<String>,
    /// Whether this insert added a previously-unseen target.
    pub target_is_new: bool,
}

impl IocReuse {
    pub fn reuse_count(&self) -> usize {
        self.targets.len()
    }
}

/// Aggregate counters for the stats surface.
#[derive(Debug, Clone, Serialize)]
pub struct WatchSnapshot {
    pub scans_total: usize,
    pub targets_total: usize,
    pub iocs_total: usize,
    pub iocs_by_type: BTreeMap<String, usize>,
    pub monitors_total: usize,
    pub monitors_paused: usize,
    pub alerts_total: usize,
    pub alerts_new: usize,
}

enum Backend {
    Memory,
    File { path: PathBuf },
}

/// On-disk snapshot shape for the `file://` backend.
#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    scans: Vec<ScanRecord>,
    summaries: Vec<TargetSummary>,
    iocs: Vec<IocRecord>,
    monitors: Vec<Monitor>,
    alerts: Vec<Alert>,
}

pub struct Store {
    scans: DashMap<String, ScanRecord>,
    /// Scan ids in completion order; history reads it back to front.
    scan_order: RwLock<Vec<String>>,
    /// Scan ids per fingerprint, oldest first.
    by_fingerprint: DashMap<String, Vec<String>>,
    summaries: DashMap<String, TargetSummary>,
    /// IOC rows keyed `type:value`.
    iocs: DashMap<String, Vec<IocRecord>>,
    monitors: DashMap<String, Monitor>,
    alerts: DashMap<String, Alert>,
    alert_order: RwLock<Vec<String>>,
    monitor_cap: usize,
    backend: Backend,
}

impl Store {
    /// Open a store with the default per-owner monitor cap.
    pub fn open(uri: &str) -> Result<Self, StoreError> {
        Self::open_with_cap(uri, 5)
    }

    pub fn open_with_cap(uri: &str, monitor_cap: usize) -> Result<Self, StoreError> {
        let backend = match uri {
            "" | "memory://" => Backend::Memory,
            _ if uri.starts_with("file://") => {
                let dir = PathBuf::from(uri.trim_start_matches("file://"));
                std::fs::create_dir_all(&dir)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;
                Backend::File {
                    path: dir.join(SNAPSHOT_FILE),
                }
            }
            other => {
                return Err(StoreError::Unavailable(format!(
                    "unsupported store uri: {}",
                    other
                )))
            }
        };

        let store = Self {
            scans: DashMap::new(),
            scan_order: RwLock::new(Vec::new()),
            by_fingerprint: DashMap::new(),
            summaries: DashMap::new(),
            iocs: DashMap::new(),
            monitors: DashMap::new(),
            alerts: DashMap::new(),
            alert_order: RwLock::new(Vec::new()),
            monitor_cap,
            backend,
        };
        store.load_snapshot()?;
        Ok(store)
    }

    fn load_snapshot(&self) -> Result<(), StoreError> {
        let Backend::File { path } = &self.backend else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;

        let mut scans = snapshot.scans;
        scans.sort_by_key(|s| s.timestamp);
        for record in scans {
            self.scan_order.write().push(record.id.clone());
            self.by_fingerprint
                .entry(record.fingerprint.clone())
                .or_default()
                .push(record.id.clone());
            self.scans.insert(record.id.clone(), record);
        }
        for summary in snapshot.summaries {
            self.summaries.insert(summary.fingerprint.clone(), summary);
        }
        for row in snapshot.iocs {
            self.iocs
                .entry(ioc_key(row.ioc_type, &row.ioc_value))
                .or_default()
                .push(row);
        }
        for monitor in snapshot.monitors {
            self.monitors.insert(monitor.id.clone(), monitor);
        }
        let mut alerts = snapshot.alerts;
        alerts.sort_by_key(|a| a.timestamp);
        for alert in alerts {
            self.alert_order.write().push(alert.id.clone());
            self.alerts.insert(alert.id.clone(), alert);
        }
        info!(scans = self.scans.len(), "store snapshot loaded");
        Ok(())
    }

    /// Write the snapshot for the `file://` backend; a no-op in memory mode.
    pub fn persist(&self) -> Result<(), StoreError> {
        let Backend::File { path } = &self.backend else {
            return Ok(());
        };
        let snapshot = Snapshot {
            scans: self.scans.iter().map(|r| r.clone()).collect(),
            summaries: self.summaries.iter().map(|r| r.clone()).collect(),
            iocs: self
                .iocs
                .iter()
                .flat_map(|rows| rows.clone())
                .collect(),
            monitors: self.monitors.iter().map(|r| r.clone()).collect(),
            alerts: self.alerts.iter().map(|r| r.clone()).collect(),
        };
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Append a scan record and fold its observation into the per-target
    /// summary's status history.
    pub fn put_scan(&self, record: &ScanRecord) -> Result<(), StoreError> {
        self.scans.insert(record.id.clone(), record.clone());
        self.scan_order.write().push(record.id.clone());
        self.by_fingerprint
            .entry(record.fingerprint.clone())
            .or_default()
            .push(record.id.clone());

        let observation = StatusObservation {
            timestamp: record.timestamp,
            url_status: record.url_status,
            status_code: record.status_code,
            response_time_seconds: record.response_time_seconds,
        };
        match self.summaries.entry(record.fingerprint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                let summary = e.get_mut();
                summary.last_seen = record.timestamp;
                summary.last_status = record.url_status;
                summary.status_history.push(observation);
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(TargetSummary {
                    fingerprint: record.fingerprint.clone(),
                    target: record.target.clone(),
                    first_seen: record.timestamp,
                    last_seen: record.timestamp,
                    last_status: record.url_status,
                    status_history: vec![observation],
                });
            }
        }
        Ok(())
    }

    pub fn get_scan(&self, id: &str) -> Option<ScanRecord> {
        self.scans.get(id).map(|r| r.clone())
    }

    pub fn latest_scan(&self, fingerprint: &str) -> Option<ScanRecord> {
        let ids = self.by_fingerprint.get(fingerprint)?;
        ids.last().and_then(|id| self.get_scan(id))
    }

    /// Most recent ONLINE record for a fingerprint.
    pub fn latest_online_scan(&self, fingerprint: &str) -> Option<ScanRecord> {
        let ids = self.by_fingerprint.get(fingerprint)?;
        ids.iter()
            .rev()
            .filter_map(|id| self.get_scan(id))
            .find(|r| r.url_status == UrlStatus::Online)
    }

    /// Most recent records for a fingerprint, newest first.
    pub fn scans_for(&self, fingerprint: &str, limit: usize) -> Vec<ScanRecord> {
        match self.by_fingerprint.get(fingerprint) {
            Some(ids) => ids
                .iter()
                .rev()
                .take(limit)
                .filter_map(|id| self.get_scan(id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Global reverse-chronological page of scan records.
    pub fn history(&self, limit: usize, offset: usize) -> Vec<ScanRecord> {
        let order = self.scan_order.read();
        order
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.get_scan(id))
            .collect()
    }

    pub fn target_summary(&self, fingerprint: &str) -> Option<TargetSummary> {
        self.summaries.get(fingerprint).map(|s| s.clone())
    }

    // =========================================================================
    // Comparison
    // =========================================================================

    /// Structured delta between the two most recent ONLINE records.
    pub fn compare(&self, fingerprint: &str) -> Result<CompareResult, StoreError> {
        let online: Vec<ScanRecord> = match self.by_fingerprint.get(fingerprint) {
            Some(ids) => ids
                .iter()
                .rev()
                .filter_map(|id| self.get_scan(id))
                .filter(|r| r.url_status == UrlStatus::Online)
                .take(2)
                .collect(),
            None => Vec::new(),
        };
        if online.len() < 2 {
            return Err(StoreError::NotFound(format!(
                "insufficient history for {}",
                fingerprint
            )));
        }
        let current = online[0].clone();
        let previous = online[1].clone();

        let new_emails = set_difference(&current.emails, &previous.emails);
        let new_crypto = set_difference(&current.crypto_addresses, &previous.crypto_addresses);
        let changes = ChangeSet {
            threat_score_delta: current.threat_score as i32 - previous.threat_score as i32,
            risk_level_changed: current.risk_level != previous.risk_level,
            status_changed: current.url_status != previous.url_status,
            category_changed: current.category != previous.category,
            new_emails,
            new_crypto,
        };

        let mut reasons = Vec::new();
        if changes.status_changed {
            reasons.push(format!(
                "status changed from {} to {}",
                previous.url_status, current.url_status
            ));
        }
        if changes.category_changed {
            reasons.push(format!(
                "category changed from {} to {}",
                previous.category, current.category
            ));
        }
        if changes.threat_score_delta != 0 {
            reasons.push(format!(
                "threat score changed by {:+}",
                changes.threat_score_delta
            ));
        }
        if changes.new_emails > 0 {
            reasons.push(format!("{} new email address(es)", changes.new_emails));
        }
        if changes.new_crypto > 0 {
            reasons.push(format!("{} new crypto address(es)", changes.new_crypto));
        }
        if current.threat_indicators.malware_detected && !previous.threat_indicators.malware_detected
        {
            reasons.push("malware detected in downloaded files".to_string());
        }
        if current.content_hash != previous.content_hash {
            reasons.push("page content changed".to_string());
        }

        Ok(CompareResult {
            current,
            previous,
            changes,
            reasons,
        })
    }

    // =========================================================================
    // IOCs
    // =========================================================================

    /// Append one IOC sighting and report the resulting reuse set.
    pub fn ioc_upsert(
        &self,
        ioc_type: IocType,
        ioc_value: &str,
        target: &str,
        timestamp: DateTime<Utc>,
    ) -> IocReuse {
        let mut rows = self.iocs.entry(ioc_key(ioc_type, ioc_value)).or_default();
        let target_is_new = !rows.iter().any(|r| r.target == target);
        rows.push(IocRecord {
            ioc_type,
            ioc_value: ioc_value.to_string(),
            target: target.to_string(),
            timestamp,
        });
        let targets: BTreeSet<String> = rows.iter().map(|r| r.target.clone()).collect();
        IocReuse {
            targets: targets.into_iter().collect(),
            target_is_new,
        }
    }

    pub fn iocs_for(&self, ioc_type: IocType, ioc_value: &str) -> Vec<IocRecord> {
        self.iocs
            .get(&ioc_key(ioc_type, ioc_value))
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    /// Register a monitor; rejected once the owner is at the cap.
    pub fn create_monitor(&self, monitor: Monitor) -> Result<Monitor, StoreError> {
        let owned = self
            .monitors
            .iter()
            .filter(|m| m.owner == monitor.owner)
            .count();
        if owned >= self.monitor_cap {
            return Err(StoreError::MonitorCapReached {
                owner: monitor.owner.clone(),
                cap: self.monitor_cap,
            });
        }
        self.monitors.insert(monitor.id.clone(), monitor.clone());
        Ok(monitor)
    }

    pub fn get_monitor(&self, id: &str) -> Option<Monitor> {
        self.monitors.get(id).map(|m| m.clone())
    }

    pub fn list_monitors(&self) -> Vec<Monitor> {
        let mut monitors: Vec<Monitor> = self.monitors.iter().map(|m| m.clone()).collect();
        monitors.sort_by_key(|m| m.created_at);
        monitors
    }

    pub fn delete_monitor(&self, id: &str) -> bool {
        self.monitors.remove(id).is_some()
    }

    pub fn delete_all_monitors(&self) -> usize {
        let n = self.monitors.len();
        self.monitors.clear();
        n
    }

    pub fn set_monitor_paused(&self, id: &str, paused: bool) -> Option<Monitor> {
        let mut monitor = self.monitors.get_mut(id)?;
        monitor.paused = paused;
        Some(monitor.clone())
    }

    /// Apply a mutation to a monitor if it still exists. Deleted monitors are
    /// left deleted; the mutation is dropped.
    pub fn update_monitor<F: FnOnce(&mut Monitor)>(&self, id: &str, f: F) -> Option<Monitor> {
        let mut monitor = self.monitors.get_mut(id)?;
        f(&mut monitor);
        Some(monitor.clone())
    }

    /// Monitors eligible for dispatch at `now` (unpaused, due).
    pub fn monitors_due(&self, now: DateTime<Utc>) -> Vec<Monitor> {
        let mut due: Vec<Monitor> = self
            .monitors
            .iter()
            .filter(|m| !m.paused && m.next_scan <= now)
            .map(|m| m.clone())
            .collect();
        due.sort_by_key(|m| m.next_scan);
        due
    }

    // =========================================================================
    // Alerts
    // =========================================================================

    pub fn put_alert(&self, alert: &Alert) -> Result<(), StoreError> {
        self.alerts.insert(alert.id.clone(), alert.clone());
        self.alert_order.write().push(alert.id.clone());
        Ok(())
    }

    pub fn get_alert(&self, id: &str) -> Option<Alert> {
        self.alerts.get(id).map(|a| a.clone())
    }

    /// Alerts newest first, optionally filtered by status.
    pub fn list_alerts(&self, status: Option<AlertStatus>) -> Vec<Alert> {
        let order = self.alert_order.read();
        order
            .iter()
            .rev()
            .filter_map(|id| self.get_alert(id))
            .filter(|a| status.map(|s| a.status == s).unwrap_or(true))
            .collect()
    }

    /// Transition an alert to acknowledged. Idempotent: acknowledging twice
    /// returns the same acknowledged alert.
    pub fn acknowledge_alert(&self, id: &str) -> Option<Alert> {
        let mut alert = self.alerts.get_mut(id)?;
        alert.status = AlertStatus::Acknowledged;
        Some(alert.clone())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    pub fn snapshot(&self) -> WatchSnapshot {
        let mut iocs_by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut iocs_total = 0usize;
        for rows in self.iocs.iter() {
            iocs_total += rows.len();
            if let Some(first) = rows.first() {
                *iocs_by_type
                    .entry(first.ioc_type.as_str().to_string())
                    .or_default() += rows.len();
            }
        }
        let monitors_paused = self.monitors.iter().filter(|m| m.paused).count();
        let alerts_new = self
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::New)
            .count();
        WatchSnapshot {
            scans_total: self.scans.len(),
            targets_total: self.summaries.len(),
            iocs_total,
            iocs_by_type,
            monitors_total: self.monitors.len(),
            monitors_paused,
            alerts_total: self.alerts.len(),
            alerts_new,
        }
    }
}

fn ioc_key(ioc_type: IocType, value: &str) -> String {
    format!("{}:{}", ioc_type.as_str(), value)
}

/// |a - b| for the string sets carried as sorted vectors.
fn set_difference(a: &[String], b: &[String]) -> usize {
    a.iter().filter(|x| !b.contains(x)).count()
}
