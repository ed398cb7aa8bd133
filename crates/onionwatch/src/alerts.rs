//! Alert Engine
//!
//! Applies the alert rules to a freshly-persisted scan against the
//! immediately-prior ONLINE record of the same target. At most one alert per
//! rule per scan, except IOC reuse which raises one per reused value.

use crate::correlator::ReuseSignal;
use crate::store::Store;
use crate::{Alert, AlertStatus, AlertType, RiskLevel, ScanRecord, Severity};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Minimum score climb that raises a threat-increase alert.
pub const THREAT_INCREASE_THRESHOLD: i32 = 20;

pub struct AlertEngine {
    store: Arc<Store>,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Evaluate all rules; returns the alerts to be written.
    pub fn evaluate(
        &self,
        curr: &ScanRecord,
        prev: Option<&ScanRecord>,
        reuse_signals: &[ReuseSignal],
    ) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if curr.threat_indicators.malware_detected {
            let names: Vec<String> = curr
                .file_analyses
                .iter()
                .flat_map(|a| a.malware.threats.iter().map(|t| t.name.clone()))
                .collect();
            alerts.push(base_alert(
                curr,
                AlertType::MalwareDetected,
                Severity::High,
                format!("malware detected: {}", names.join(", ")),
            ));
        }

        let mut threat_increased = false;
        if let Some(prev) = prev {
            let increase = curr.threat_score as i32 - prev.threat_score as i32;
            if increase >= THREAT_INCREASE_THRESHOLD {
                threat_increased = true;
                let mut alert = base_alert(
                    curr,
                    AlertType::ThreatIncrease,
                    severity_for_risk(curr.risk_level),
                    format!(
                        "threat score climbed from {} to {}",
                        prev.threat_score, curr.threat_score
                    ),
                );
                alert.threat_score = Some(curr.threat_score);
                alert.previous_score = Some(prev.threat_score);
                alert.score_increase = Some(increase);
                alerts.push(alert);
            }

            if prev.url_status != curr.url_status {
                alerts.push(base_alert(
                    curr,
                    AlertType::StatusChange,
                    Severity::Medium,
                    format!(
                        "status changed from {} to {}",
                        prev.url_status, curr.url_status
                    ),
                ));
            }
        }

        // A LOW content-change alongside a threat increase adds nothing; the
        // increase alert absorbs it.
        if curr.content_changed && !threat_increased {
            alerts.push(base_alert(
                curr,
                AlertType::ContentChange,
                Severity::Low,
                "page content changed since the previous scan".to_string(),
            ));
        }

        for signal in reuse_signals {
            let mut alert = base_alert(
                curr,
                AlertType::IocReuse,
                signal.severity,
                format!(
                    "{} {} seen on {} distinct targets",
                    signal.ioc_type, signal.ioc_value, signal.reuse_count
                ),
            );
            alert.details = serde_json::json!({
                "ioc_type": signal.ioc_type,
                "ioc_value": signal.ioc_value,
                "reuse_count": signal.reuse_count,
                "targets": signal.targets,
            });
            alerts.push(alert);
        }

        alerts
    }

    /// Write alerts. A failed write is retried once, then dropped with a log
    /// entry; alerting never fails a scan.
    pub fn emit(&self, alerts: Vec<Alert>) -> Vec<Alert> {
        let mut written = Vec::new();
        for alert in alerts {
            match self
                .store
                .put_alert(&alert)
                .or_else(|_| self.store.put_alert(&alert))
            {
                Ok(()) => written.push(alert),
                Err(e) => {
                    warn!(alert_id = %alert.id, "alert write dropped after retry: {}", e);
                }
            }
        }
        written
    }
}

fn base_alert(curr: &ScanRecord, alert_type: AlertType, severity: Severity, reason: String) -> Alert {
    Alert {
        id: uuid::Uuid::new_v4().to_string(),
        target: curr.target.clone(),
        alert_type,
        severity,
        reason,
        threat_score: Some(curr.threat_score),
        previous_score: None,
        score_increase: None,
        details: serde_json::json!({}),
        timestamp: Utc::now(),
        status: AlertStatus::New,
    }
}

fn severity_for_risk(risk: RiskLevel) -> Severity {
    match risk {
        RiskLevel::Low => Severity::Low,
        RiskLevel::Medium => Severity::Medium,
        RiskLevel::High => Severity::High,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CarvingReport, FileAnalysis, IocType, MalwareReport, MetadataReport, StringsReport,
        ThreatMatch, UrlStatus,
    };

    fn engine() -> AlertEngine {
        AlertEngine::new(Arc::new(Store::open("memory://").unwrap()))
    }

    fn online(score: u8) -> ScanRecord {
        let mut r = ScanRecord::empty(
            "http://example1.onion/",
            UrlStatus::Online,
            Some(200),
            Some(0.2),
        );
        r.threat_score = score;
        r.risk_level = RiskLevel::from_score(score);
        r
    }

    fn infected(score: u8) -> ScanRecord {
        let mut r = online(score);
        r.threat_indicators.malware_detected = true;
        r.file_analyses.push(FileAnalysis {
            file_url: "http://example1.onion/tool.zip".to_string(),
            file_name: "tool.zip".to_string(),
            content_type: None,
            file_size: 10,
            file_hash: "ab".repeat(32),
            malware: MalwareReport {
                success: true,
                error: None,
                status: "infected".to_string(),
                detected: true,
                threats: vec![ThreatMatch {
                    name: "Eicar-Test-Signature".to_string(),
                    kind: "test".to_string(),
                }],
            },
            strings: StringsReport::not_available(),
            metadata: MetadataReport::not_available(),
            carving: CarvingReport::not_available(),
        });
        r
    }

    #[test]
    fn test_malware_alert_lists_threat_names() {
        let alerts = engine().evaluate(&infected(40), None, &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::MalwareDetected);
        assert_eq!(alerts[0].severity, Severity::High);
        assert!(alerts[0].reason.contains("Eicar-Test-Signature"));
    }

    #[test]
    fn test_threat_increase_threshold() {
        let prev = online(30);
        // One below the threshold: quiet.
        let alerts = engine().evaluate(&online(49), Some(&prev), &[]);
        assert!(alerts.is_empty());
        // At the threshold: alert with populated score fields.
        let curr = online(50);
        let alerts = engine().evaluate(&curr, Some(&prev), &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ThreatIncrease);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].previous_score, Some(30));
        assert_eq!(alerts[0].threat_score, Some(50));
        assert_eq!(alerts[0].score_increase, Some(20));
    }

    #[test]
    fn test_status_change_alert() {
        let prev = online(10);
        let curr = ScanRecord::empty(
            "http://example1.onion/",
            UrlStatus::Timeout,
            None,
            Some(30.0),
        );
        let alerts = engine().evaluate(&curr, Some(&prev), &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::StatusChange);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert!(alerts[0].reason.contains("ONLINE"));
        assert!(alerts[0].reason.contains("TIMEOUT"));
    }

    #[test]
    fn test_content_change_alert_and_absorption() {
        let prev = online(30);
        let mut curr = online(35);
        curr.content_changed = true;
        let alerts = engine().evaluate(&curr, Some(&prev), &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ContentChange);
        assert_eq!(alerts[0].severity, Severity::Low);

        // Combined with a threat increase, the LOW alert is absorbed.
        let mut spiking = online(80);
        spiking.content_changed = true;
        let alerts = engine().evaluate(&spiking, Some(&prev), &[]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ThreatIncrease);
    }

    #[test]
    fn test_ioc_reuse_alert_details() {
        let signal = ReuseSignal {
            ioc_type: IocType::Email,
            ioc_value: "admin@x.test".to_string(),
            severity: Severity::High,
            reuse_count: 2,
            targets: vec![
                "http://site-a.onion/".to_string(),
                "http://site-b.onion/".to_string(),
            ],
        };
        let alerts = engine().evaluate(&online(10), None, &[signal]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::IocReuse);
        assert_eq!(alerts[0].details["reuse_count"], 2);
        assert_eq!(alerts[0].details["ioc_type"], "email");
    }

    #[test]
    fn test_first_scan_is_quiet() {
        let alerts = engine().evaluate(&online(74), None, &[]);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_emit_writes_alerts() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let engine = AlertEngine::new(store.clone());
        let prev = online(10);
        let mut curr = infected(25);
        curr.content_changed = true;
        let alerts = engine.evaluate(&curr, Some(&prev), &[]);
        let written = engine.emit(alerts);
        assert_eq!(written.len(), 2);
        assert_eq!(store.list_alerts(None).len(), 2);
    }
}
