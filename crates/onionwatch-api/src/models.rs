//! API Data Models

use chrono::{DateTime, Utc};
use onionwatch::{RiskLevel, ScanRecord, UrlStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct MonitorCreateRequest {
    pub url: String,
    pub interval: u32,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CompareQuery {
    #[allow(dead_code)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub status: Option<String>,
}

/// Condensed record for history listings.
#[derive(Debug, Serialize)]
pub struct ScanSummary {
    pub id: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
    pub url_status: UrlStatus,
    pub status_code: Option<u16>,
    pub title: Option<String>,
    pub threat_score: u8,
    pub risk_level: RiskLevel,
    pub category: String,
    pub content_changed: bool,
}

impl From<&ScanRecord> for ScanSummary {
    fn from(record: &ScanRecord) -> Self {
        Self {
            id: record.id.clone(),
            target: record.target.clone(),
            timestamp: record.timestamp,
            url_status: record.url_status,
            status_code: record.status_code,
            title: record.title.clone(),
            threat_score: record.threat_score,
            risk_level: record.risk_level,
            category: record.category.clone(),
            content_changed: record.content_changed,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<ScanSummary>,
}

#[derive(Debug, Serialize)]
pub struct MonitorsResponse {
    pub monitors: Vec<onionwatch::Monitor>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<onionwatch::Alert>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct DeletedCountResponse {
    pub deleted: usize,
}
