//! IOC Correlator
//!
//! Inserts every IOC a scan extracted and watches reuse sets grow across
//! distinct targets. A signal is raised only when the set reaches two or
//! more targets AND this scan contributed a previously-unseen one, so the
//! same page rescanned forever never re-alerts.

use crate::store::Store;
use crate::{IocType, ScanRecord, Severity};
use std::sync::Arc;
use tracing::info;

/// A reuse-threshold crossing for one IOC value.
#[derive(Debug, Clone)]
pub struct ReuseSignal {
    pub ioc_type: IocType,
    pub ioc_value: String,
    pub severity: Severity,
    pub reuse_count: usize,
    pub targets: Vec<String>,
}

pub struct Correlator {
    store: Arc<Store>,
}

impl Correlator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Upsert every IOC the record carries; return the reuse signals the
    /// inserts produced.
    pub fn record_iocs(&self, record: &ScanRecord) -> Vec<ReuseSignal> {
        let mut signals = Vec::new();

        for email in &record.emails {
            self.upsert(record, IocType::Email, email, &mut signals);
        }
        for address in &record.crypto_addresses {
            self.upsert(record, IocType::Crypto, address, &mut signals);
        }
        for analysis in &record.file_analyses {
            self.upsert(record, IocType::FileHash, &analysis.file_hash, &mut signals);
        }

        signals
    }

    fn upsert(
        &self,
        record: &ScanRecord,
        ioc_type: IocType,
        value: &str,
        signals: &mut Vec<ReuseSignal>,
    ) {
        let reuse = self
            .store
            .ioc_upsert(ioc_type, value, &record.target, record.timestamp);
        if reuse.reuse_count() >= 2 && reuse.target_is_new {
            info!(
                %ioc_type,
                value,
                reuse_count = reuse.reuse_count(),
                "ioc reused across targets"
            );
            signals.push(ReuseSignal {
                ioc_type,
                ioc_value: value.to_string(),
                severity: reuse_severity(ioc_type),
                reuse_count: reuse.reuse_count(),
                targets: reuse.targets,
            });
        }
    }
}

/// Email and crypto reuse is a strong operator link; shared files are weaker.
fn reuse_severity(ioc_type: IocType) -> Severity {
    match ioc_type {
        IocType::Email | IocType::Crypto => Severity::High,
        IocType::FileHash => Severity::Medium,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ScanRecord, UrlStatus};

    fn online_record(target: &str, emails: &[&str]) -> ScanRecord {
        let mut r = ScanRecord::empty(target, UrlStatus::Online, Some(200), Some(0.1));
        r.emails = emails.iter().map(|e| e.to_string()).collect();
        r
    }

    #[test]
    fn test_reuse_signal_on_second_target() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let correlator = Correlator::new(store.clone());

        let first = correlator.record_iocs(&online_record("http://site-a.onion/", &["admin@x.test"]));
        assert!(first.is_empty());

        let second =
            correlator.record_iocs(&online_record("http://site-b.onion/", &["admin@x.test"]));
        assert_eq!(second.len(), 1);
        let signal = &second[0];
        assert_eq!(signal.ioc_type, IocType::Email);
        assert_eq!(signal.reuse_count, 2);
        assert_eq!(signal.severity, Severity::High);
        assert_eq!(signal.targets.len(), 2);

        // Both sightings are rows in the collection.
        assert_eq!(store.iocs_for(IocType::Email, "admin@x.test").len(), 2);
    }

    #[test]
    fn test_no_signal_for_repeat_of_same_target() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let correlator = Correlator::new(store);
        let record = online_record("http://site-a.onion/", &["admin@x.test"]);
        assert!(correlator.record_iocs(&record).is_empty());
        assert!(correlator.record_iocs(&record).is_empty());
    }

    #[test]
    fn test_file_hash_reuse_is_medium() {
        assert_eq!(reuse_severity(IocType::FileHash), Severity::Medium);
        assert_eq!(reuse_severity(IocType::Crypto), Severity::High);
    }
}
