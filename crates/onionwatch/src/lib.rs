//! OnionWatch Dark-Web Monitoring Platform (OWMP)
//!
//! Fetches hidden-service and clearnet pages, extracts indicators of
//! compromise, classifies content, persists versioned scan records,
//! correlates IOCs across targets and raises alerts. A periodic scheduler
//! drives rescans of registered monitors.
//!
//! # Features
//! - SOCKS5-routed acquisition of `.onion` targets
//! - IOC extraction (emails, Bitcoin/Ethereum/Monero addresses, file hashes)
//! - Tiered rule-based threat scoring and category classification
//! - Append-only scan history with content-change detection
//! - Cross-target IOC reuse correlation and alerting
//! - Multi-tenant monitor scheduling with bounded concurrency
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ONIONWATCH PLATFORM                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ ┌─────────────┐   ┌─────────────┐   ┌──────────────┐           │
//! │ │   Fetcher   │──▶│   Parser    │──▶│  Downloader  │           │
//! │ │ (SOCKS5/.onion) └─────────────┘   │ File Analyser│           │
//! │ └─────────────┘          │          └──────┬───────┘           │
//! │                          ▼                 │                    │
//! │               ┌─────────────────────┐      │                    │
//! │               │  Content Analyser   │◀─────┘                    │
//! │               │ (IOC, score, class) │                           │
//! │               └──────────┬──────────┘                           │
//! │                          ▼                                      │
//! │  ┌──────────────────────────────────────────────────────┐      │
//! │  │                   Document Store                      │      │
//! │  │    scans | summaries | iocs | monitors | alerts      │      │
//! │  └────────────┬──────────────────────────┬──────────────┘      │
//! │               ▼                          ▼                      │
//! │        ┌──────────────┐          ┌──────────────┐              │
//! │        │  Correlator  │─────────▶│ Alert Engine │              │
//! │        └──────────────┘          └──────────────┘              │
//! │                                                                  │
//! │  ┌──────────────────┐        ┌─────────────────────┐           │
//! │  │ Scan Orchestrator│◀───────│  Monitor Scheduler  │           │
//! │  └──────────────────┘        └─────────────────────┘           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod alerts;
pub mod config;
pub mod content;
pub mod correlator;
pub mod downloader;
pub mod fetcher;
pub mod files;
pub mod monitor;
pub mod parser;
pub mod scanner;
pub mod store;

pub use config::{ConfigError, WatchConfig};
pub use store::{Store, StoreError};

// =============================================================================
// Target identity
// =============================================================================

/// True when the target's host is a Tor hidden service.
pub fn is_onion(target: &str) -> bool {
    match url::Url::parse(target.trim()) {
        Ok(u) => u
            .host_str()
            .map(|h| h.to_ascii_lowercase().ends_with(".onion"))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Stable lowercase-normalised form of a target URL, used as the grouping
/// key across scans. Fragments are dropped, default ports elided and the
/// trailing slash stripped so `http://X.onion/` and `http://x.onion` collide.
pub fn fingerprint(target: &str) -> String {
    match url::Url::parse(target.trim()) {
        Ok(u) => {
            let host = u.host_str().unwrap_or("").to_ascii_lowercase();
            let port = u
                .port()
                .map(|p| format!(":{}", p))
                .unwrap_or_default();
            let path = u.path().trim_end_matches('/');
            let query = u.query().map(|q| format!("?{}", q)).unwrap_or_default();
            format!("{}://{}{}{}{}", u.scheme(), host, port, path, query)
        }
        Err(_) => target.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

// =============================================================================
// Scan record model
// =============================================================================

/// Outcome classification of one HTTP acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UrlStatus {
    Online,
    Offline,
    Timeout,
    Error,
}

impl std::fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "ONLINE"),
            Self::Offline => write!(f, "OFFLINE"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Risk bands derived from the threat score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// Pure mapping from threat score: LOW <= 30, MEDIUM 31-70, HIGH 71-100.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=30 => Self::Low,
            31..=70 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// A hyperlink found on the page, with its visible text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub url: String,
    pub anchor_text: String,
}

/// A link whose URL path ends in a downloadable-file extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLink {
    pub url: String,
    pub extension: String,
}

/// Signal bag assembled by the content analyser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatIndicators {
    pub keyword_matches: u32,
    pub matched_keywords: Vec<String>,
    pub crypto_detected: bool,
    pub email_detected: bool,
    pub malware_detected: bool,
}

/// One observation of a target. Append-only; never mutated after `put_scan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: String,
    pub target: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub url_status: UrlStatus,
    pub status_code: Option<u16>,
    pub response_time_seconds: Option<f64>,
    pub title: Option<String>,
    pub content_preview: String,
    /// SHA-256 of the normalised page text. None unless ONLINE with text.
    pub content_hash: Option<String>,
    pub keywords: Vec<String>,
    pub emails: Vec<String>,
    pub crypto_addresses: Vec<String>,
    pub pgp_detected: bool,
    pub links: Vec<Link>,
    pub file_links: Vec<FileLink>,
    pub file_analyses: Vec<FileAnalysis>,
    pub threat_score: u8,
    pub risk_level: RiskLevel,
    pub category: String,
    pub confidence: f64,
    pub threat_indicators: ThreatIndicators,
    /// True iff a previous ONLINE record exists for this fingerprint and its
    /// content hash differs.
    pub content_changed: bool,
}

impl ScanRecord {
    /// Record with no analysable content: a failed acquisition or a binary
    /// payload. Analysis fields stay at their empty defaults; the record is
    /// still persisted.
    pub fn empty(
        target: &str,
        status: UrlStatus,
        status_code: Option<u16>,
        response_time_seconds: Option<f64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            fingerprint: fingerprint(target),
            timestamp: Utc::now(),
            url_status: status,
            status_code,
            response_time_seconds,
            title: None,
            content_preview: String::new(),
            content_hash: None,
            keywords: Vec::new(),
            emails: Vec::new(),
            crypto_addresses: Vec::new(),
            pgp_detected: false,
            links: Vec::new(),
            file_links: Vec::new(),
            file_analyses: Vec::new(),
            threat_score: 0,
            risk_level: RiskLevel::Low,
            category: "Unknown".to_string(),
            confidence: 0.0,
            threat_indicators: ThreatIndicators::default(),
            content_changed: false,
        }
    }
}

/// One status observation in a target's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusObservation {
    pub timestamp: DateTime<Utc>,
    pub url_status: UrlStatus,
    pub status_code: Option<u16>,
    pub response_time_seconds: Option<f64>,
}

/// Per-target summary document holding the status trend log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    pub fingerprint: String,
    pub target: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_status: UrlStatus,
    pub status_history: Vec<StatusObservation>,
}

// =============================================================================
// File analysis model
// =============================================================================

/// A malware signature hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatMatch {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Signature-scanner output for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalwareReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: String,
    pub detected: bool,
    pub threats: Vec<ThreatMatch>,
}

impl MalwareReport {
    pub fn not_available() -> Self {
        Self {
            success: false,
            error: Some("not_available".to_string()),
            status: "unavailable".to_string(),
            detected: false,
            threats: Vec::new(),
        }
    }
}

/// Printable-strings extraction output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringsReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub count: usize,
    pub samples: Vec<String>,
}

impl StringsReport {
    pub fn not_available() -> Self {
        Self {
            success: false,
            error: Some("not_available".to_string()),
            count: 0,
            samples: Vec::new(),
        }
    }
}

/// Flat key/value file metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fields: std::collections::BTreeMap<String, String>,
}

impl MetadataReport {
    pub fn not_available() -> Self {
        Self {
            success: false,
            error: Some("not_available".to_string()),
            fields: Default::default(),
        }
    }
}

/// An embedded format marker found by the carving sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarvedSignature {
    pub format: String,
    pub offset: usize,
}

/// Carving sweep output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarvingReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub signatures: Vec<CarvedSignature>,
}

impl CarvingReport {
    pub fn not_available() -> Self {
        Self {
            success: false,
            error: Some("not_available".to_string()),
            signatures: Vec::new(),
        }
    }
}

/// Analysis of one downloaded file. At most one entry per file hash within a
/// scan record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnalysis {
    pub file_url: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub file_size: u64,
    pub file_hash: String,
    pub malware: MalwareReport,
    pub strings: StringsReport,
    pub metadata: MetadataReport,
    pub carving: CarvingReport,
}

// =============================================================================
// IOC model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IocType {
    Email,
    Crypto,
    FileHash,
}

impl IocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Crypto => "crypto",
            Self::FileHash => "file_hash",
        }
    }
}

impl std::fmt::Display for IocType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sighting of an IOC on a target. Append-only; the distinct targets for
/// a `(type, value)` pair form its reuse set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocRecord {
    pub ioc_type: IocType,
    pub ioc_value: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Monitor model
// =============================================================================

/// Condensed result of a monitor's latest scheduled scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorScanSummary {
    pub status: UrlStatus,
    pub threat_score: u8,
    pub risk_level: RiskLevel,
    pub category: String,
    pub email_count: usize,
    pub crypto_count: usize,
    pub file_hash_count: usize,
    pub malware_detected: bool,
}

/// A registered periodic rescan of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: String,
    pub target: String,
    pub fingerprint: String,
    pub owner: String,
    pub interval_minutes: u32,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub last_scan: Option<DateTime<Utc>>,
    pub next_scan: DateTime<Utc>,
    pub scan_count: u64,
    pub last_scan_summary: Option<MonitorScanSummary>,
}

// =============================================================================
// Alert model
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ThreatIncrease,
    StatusChange,
    ContentChange,
    MalwareDetected,
    IocReuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    New,
    Acknowledged,
}

/// Immutable after creation except for `status`, which transitions
/// `new -> acknowledged` exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub target: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_increase: Option<i32>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub status: AlertStatus,
}

// =============================================================================
// Comparison model
// =============================================================================

/// Structured delta between the two most recent ONLINE records of a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub threat_score_delta: i32,
    pub risk_level_changed: bool,
    pub status_changed: bool,
    pub category_changed: bool,
    pub new_emails: usize,
    pub new_crypto: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResult {
    pub current: ScanRecord,
    pub previous: ScanRecord,
    pub changes: ChangeSet,
    pub reasons: Vec<String>,
}

// =============================================================================
// Platform service
// =============================================================================

/// Startup failures, split so the binary can map them to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Composition root wiring the store, orchestrator and scheduler together.
pub struct WatchService {
    pub config: WatchConfig,
    pub store: Arc<Store>,
    pub scanner: Arc<scanner::Scanner>,
    pub scheduler: Arc<monitor::MonitorScheduler>,
}

impl WatchService {
    pub fn new(config: WatchConfig) -> Result<Self, StartupError> {
        let store = Arc::new(Store::open_with_cap(
            &config.store_uri,
            config.monitor_cap_per_owner,
        )?);
        let scanner = Arc::new(scanner::Scanner::new(&config, store.clone())?);
        let scheduler = Arc::new(monitor::MonitorScheduler::new(
            &config,
            store.clone(),
            scanner.clone(),
        ));
        Ok(Self {
            config,
            store,
            scanner,
            scheduler,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_bands() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(30), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(31), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(71), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::High);
    }

    #[test]
    fn test_fingerprint_normalisation() {
        assert_eq!(
            fingerprint("http://Example1.ONION/"),
            "http://example1.onion"
        );
        assert_eq!(
            fingerprint("http://example1.onion"),
            fingerprint("http://example1.onion/")
        );
        // Fragments never distinguish targets, query strings do.
        assert_eq!(
            fingerprint("http://a.onion/x#frag"),
            "http://a.onion/x"
        );
        assert_ne!(
            fingerprint("http://a.onion/x?p=1"),
            fingerprint("http://a.onion/x")
        );
    }

    #[test]
    fn test_is_onion_routing_decision() {
        assert!(is_onion("http://example1.onion/"));
        assert!(is_onion("https://sub.Market.ONION/listing"));
        assert!(!is_onion("https://example.com/"));
        assert!(!is_onion("not a url"));
    }

    #[test]
    fn test_status_serde_tags() {
        assert_eq!(
            serde_json::to_string(&UrlStatus::Online).unwrap(),
            "\"ONLINE\""
        );
        assert_eq!(
            serde_json::to_string(&AlertType::IocReuse).unwrap(),
            "\"ioc_reuse\""
        );
        assert_eq!(
            serde_json::to_string(&AlertStatus::Acknowledged).unwrap(),
            "\"acknowledged\""
        );
        assert_eq!(serde_json::to_string(&IocType::FileHash).unwrap(), "\"file_hash\"");
    }
}
