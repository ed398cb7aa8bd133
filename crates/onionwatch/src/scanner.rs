//! Scan Orchestrator
//!
//! Composes fetch, parse, download, file analysis, content analysis,
//! persistence, correlation and alerting into one `scan` operation. The
//! orchestrator never throws for acquisition or analysis problems; every
//! failure mode still yields a persisted record. Only store errors surface.

use crate::alerts::AlertEngine;
use crate::config::{ConfigError, WatchConfig};
use crate::content::ContentAnalyzer;
use crate::correlator::Correlator;
use crate::downloader::{DownloadedFile, Downloader};
use crate::fetcher::{FetchOutcome, Fetcher};
use crate::files::{sha256_hex, FileAnalyzer};
use crate::parser::PageParser;
use crate::store::{Store, StoreError};
use crate::{fingerprint, ScanRecord, UrlStatus};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Scanner {
    fetcher: Fetcher,
    parser: PageParser,
    analyzer: ContentAnalyzer,
    downloader: Downloader,
    file_analyzer: FileAnalyzer,
    correlator: Correlator,
    alert_engine: AlertEngine,
    store: Arc<Store>,
    max_file_downloads: usize,
}

impl Scanner {
    pub fn new(config: &WatchConfig, store: Arc<Store>) -> Result<Self, ConfigError> {
        Ok(Self {
            fetcher: Fetcher::new(config)?,
            parser: PageParser::new(),
            analyzer: ContentAnalyzer::new(config.scoring.clone(), config.confidence.clone()),
            downloader: Downloader::new(config)?,
            file_analyzer: FileAnalyzer::new(&config.providers),
            correlator: Correlator::new(store.clone()),
            alert_engine: AlertEngine::new(store.clone()),
            store,
            max_file_downloads: config.max_file_downloads,
        })
    }

    /// Scan one target end to end. Each invocation appends exactly one scan
    /// record; repeated invocations append new records.
    pub async fn scan(&self, target: &str) -> Result<ScanRecord, StoreError> {
        let fp = fingerprint(target);
        let prev_online = self.store.latest_online_scan(&fp);

        let outcome = self.fetcher.fetch(target).await;
        let mut record = match (outcome.url_status, outcome.text.clone()) {
            (UrlStatus::Online, Some(text)) => self.analyze_online(target, &outcome, &text).await,
            _ => {
                // Failed or binary acquisition: persist a bare observation.
                let mut r = ScanRecord::empty(
                    target,
                    outcome.url_status,
                    outcome.status_code,
                    outcome.response_time_seconds,
                );
                r.fingerprint = fp.clone();
                r
            }
        };

        // Change detection is an ONLINE-to-ONLINE comparison; failed
        // acquisitions say nothing about the content.
        record.content_changed = record.url_status == UrlStatus::Online
            && prev_online
                .as_ref()
                .map(|prev| prev.content_hash != record.content_hash)
                .unwrap_or(false);

        // Write order: scan, then its IOCs, then alerts. A reader observing
        // the scan always observes its IOCs; alerts may trail briefly.
        self.store.put_scan(&record)?;
        let reuse_signals = if record.url_status == UrlStatus::Online {
            self.correlator.record_iocs(&record)
        } else {
            Vec::new()
        };
        let alerts = self
            .alert_engine
            .evaluate(&record, prev_online.as_ref(), &reuse_signals);
        let written = self.alert_engine.emit(alerts);

        info!(
            url = target,
            status = %record.url_status,
            threat_score = record.threat_score,
            alerts = written.len(),
            "scan complete"
        );
        Ok(record)
    }

    async fn analyze_online(
        &self,
        target: &str,
        outcome: &FetchOutcome,
        text: &str,
    ) -> ScanRecord {
        let parsed = self.parser.parse(text);
        let emails = self.analyzer.extract_emails(&parsed.text);
        let crypto_addresses = self.analyzer.extract_crypto_addresses(&parsed.text);

        let files = self.download_candidates(target, &parsed.file_links).await;
        let file_analyses = self.file_analyzer.analyze_all(&files);
        let malware_detected = file_analyses.iter().any(|a| a.malware.detected);

        let verdict = self.analyzer.analyze(
            &parsed.keywords,
            &emails,
            &crypto_addresses,
            parsed.pgp_detected,
            malware_detected,
        );

        let content_hash = if parsed.text.is_empty() {
            None
        } else {
            Some(sha256_hex(parsed.text.as_bytes()))
        };
        let content_preview: String = parsed.text.chars().take(500).collect();

        ScanRecord {
            id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            fingerprint: fingerprint(target),
            timestamp: Utc::now(),
            url_status: UrlStatus::Online,
            status_code: outcome.status_code,
            response_time_seconds: outcome.response_time_seconds,
            title: parsed.title.clone(),
            content_preview,
            content_hash,
            keywords: parsed.keywords.clone(),
            emails,
            crypto_addresses,
            pgp_detected: parsed.pgp_detected,
            links: parsed.links,
            file_links: parsed.file_links,
            file_analyses,
            threat_score: verdict.threat_score,
            risk_level: verdict.risk_level,
            category: verdict.category,
            confidence: verdict.confidence,
            threat_indicators: verdict.indicators,
            content_changed: false,
        }
    }

    /// Retrieve file-link candidates up to the per-scan cap, skipping
    /// duplicate URLs. Individual failures drop the candidate only.
    async fn download_candidates(
        &self,
        target: &str,
        file_links: &[crate::FileLink],
    ) -> Vec<DownloadedFile> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut files = Vec::new();
        for link in file_links {
            if files.len() >= self.max_file_downloads {
                debug!(url = target, "file download cap reached");
                break;
            }
            let Some(absolute) = Downloader::resolve(target, &link.url) else {
                continue;
            };
            if !seen.insert(absolute.clone()) {
                continue;
            }
            if let Some(file) = self.downloader.download(&absolute).await {
                files.push(file);
            }
        }
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AlertType, IocType, RiskLevel, Severity};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> WatchConfig {
        WatchConfig {
            request_timeout: Duration::from_secs(5),
            ..WatchConfig::default()
        }
    }

    fn scanner(store: Arc<Store>) -> Scanner {
        Scanner::new(&test_config(), store).unwrap()
    }

    fn html_response(body: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    /// Serve a scripted sequence of HTML bodies on one address; the last
    /// body repeats for any further requests.
    async fn serve_pages(bodies: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut served = 0usize;
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = bodies[served.min(bodies.len() - 1)].clone();
                served += 1;
                let _ = socket.write_all(&html_response(&body)).await;
            }
        });
        format!("http://{}/", addr)
    }

    const MARKET_BODY: &str =
        "<html><title>Dark Market</title><body><p>Dark Market buy carding escrow \
         contact: admin@shop.test BTC 1BoatSLRHtKNngkdXEeobR76b53LETtpyT</p></body></html>";

    #[tokio::test]
    async fn test_marketplace_scan_end_to_end() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());
        let url = serve_pages(vec![MARKET_BODY.to_string()]).await;

        let record = scanner.scan(&url).await.unwrap();
        assert_eq!(record.url_status, UrlStatus::Online);
        assert_eq!(record.title.as_deref(), Some("Dark Market"));
        assert!(record.keywords.iter().any(|k| k == "marketplace"));
        assert!(record.keywords.iter().any(|k| k == "carding"));
        assert!(record.keywords.iter().any(|k| k == "escrow"));
        assert_eq!(record.emails, vec!["admin@shop.test"]);
        assert_eq!(
            record.crypto_addresses,
            vec!["1BoatSLRHtKNngkdXEeobR76b53LETtpyT"]
        );
        assert_eq!(record.threat_score, 74);
        assert_eq!(record.risk_level, RiskLevel::High);
        assert_eq!(record.category, "Illegal Marketplace");
        assert!(!record.content_changed);

        // Persisted, with IOC rows for every extracted value.
        assert!(store.get_scan(&record.id).is_some());
        assert_eq!(
            store.iocs_for(IocType::Email, "admin@shop.test").len(),
            1
        );
        // First observation of the target raises nothing.
        assert!(store.list_alerts(None).is_empty());
    }

    #[tokio::test]
    async fn test_ioc_reuse_across_two_targets() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());
        let body = "<p>reach us: admin@x.test</p>".to_string();
        let site_a = serve_pages(vec![body.clone()]).await;
        let site_b = serve_pages(vec![body]).await;

        scanner.scan(&site_a).await.unwrap();
        scanner.scan(&site_b).await.unwrap();

        assert_eq!(store.iocs_for(IocType::Email, "admin@x.test").len(), 2);
        let alerts = store.list_alerts(None);
        let reuse: Vec<_> = alerts
            .iter()
            .filter(|a| a.alert_type == AlertType::IocReuse)
            .collect();
        assert_eq!(reuse.len(), 1);
        assert_eq!(reuse[0].severity, Severity::High);
        assert_eq!(reuse[0].details["reuse_count"], 2);
    }

    #[tokio::test]
    async fn test_content_change_sequence() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());
        let url = serve_pages(vec![
            "<p>A</p>".to_string(),
            "<p>B</p>".to_string(),
            "<p>B</p>".to_string(),
        ])
        .await;

        let first = scanner.scan(&url).await.unwrap();
        assert!(!first.content_changed);

        let second = scanner.scan(&url).await.unwrap();
        assert!(second.content_changed);
        let changes: Vec<_> = store
            .list_alerts(None)
            .into_iter()
            .filter(|a| a.alert_type == AlertType::ContentChange)
            .collect();
        assert_eq!(changes.len(), 1);

        let third = scanner.scan(&url).await.unwrap();
        assert!(!third.content_changed);
        assert_eq!(third.content_hash, second.content_hash);
        let changes = store
            .list_alerts(None)
            .into_iter()
            .filter(|a| a.alert_type == AlertType::ContentChange)
            .count();
        assert_eq!(changes, 1);
    }

    #[tokio::test]
    async fn test_offline_after_online_raises_status_change() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}/", addr);
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&html_response("<p>up</p>")).await;
            }
            // Listener drops here; the port then refuses connections.
        });

        let first = scanner.scan(&url).await.unwrap();
        assert_eq!(first.url_status, UrlStatus::Online);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = scanner.scan(&url).await.unwrap();
        assert_eq!(second.url_status, UrlStatus::Offline);
        assert!(second.content_hash.is_none());
        assert!(second.emails.is_empty());

        let alerts = store.list_alerts(None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::StatusChange);
        // Both observations land in the target's status history.
        let summary = store.target_summary(&first.fingerprint).unwrap();
        assert_eq!(summary.status_history.len(), 2);
    }

    #[tokio::test]
    async fn test_malware_pivot_through_downloaded_file() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());

        // One server, two routes: the page and the flagged binary.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut payload = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR".to_vec();
        payload.extend_from_slice(b"-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                if request.starts_with("GET /tool.exe") {
                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&payload).await;
                } else {
                    let _ = socket
                        .write_all(&html_response(
                            "<p>free tool</p><a href=\"/tool.exe\">download</a>",
                        ))
                        .await;
                }
            }
        });

        let record = scanner.scan(&format!("http://{}/", addr)).await.unwrap();
        assert_eq!(record.file_analyses.len(), 1);
        assert!(record.threat_indicators.malware_detected);
        // Malware bonus alone puts the bare page at 25.
        assert_eq!(record.threat_score, 25);

        let alerts = store.list_alerts(None);
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::MalwareDetected && a.severity == Severity::High));
        // The file hash joined the IOC collection.
        let hash = record.file_analyses[0].file_hash.clone();
        assert_eq!(store.iocs_for(IocType::FileHash, &hash).len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_is_analytically_stable() {
        let store = Arc::new(Store::open("memory://").unwrap());
        let scanner = scanner(store.clone());
        let url = serve_pages(vec![MARKET_BODY.to_string()]).await;

        let first = scanner.scan(&url).await.unwrap();
        let second = scanner.scan(&url).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.threat_score, second.threat_score);
        assert_eq!(first.category, second.category);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.emails, second.emails);
        assert_eq!(store.history(10, 0).len(), 2);
    }
}
