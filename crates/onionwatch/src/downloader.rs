//! File Downloader
//!
//! Bounded retrieval of file-link candidates. Routing mirrors the page
//! fetcher: hidden-service URLs go through the SOCKS5 proxy. A file at
//! exactly the byte cap is accepted; one byte over is rejected.

use crate::config::{ConfigError, WatchConfig};
use crate::is_onion;
use tracing::debug;

/// A retrieved file candidate, ready for analysis.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub file_url: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

pub struct Downloader {
    direct: reqwest::Client,
    proxied: reqwest::Client,
    max_bytes: u64,
}

impl Downloader {
    pub fn new(config: &WatchConfig) -> Result<Self, ConfigError> {
        let direct = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Proxy(e.to_string()))?;
        let proxy = reqwest::Proxy::all(config.proxy_url())
            .map_err(|e| ConfigError::Proxy(format!("{}: {}", config.proxy_url(), e)))?;
        let proxied = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| ConfigError::Proxy(e.to_string()))?;
        Ok(Self {
            direct,
            proxied,
            max_bytes: config.download_max_bytes,
        })
    }

    /// Resolve `href` against the page URL it appeared on.
    pub fn resolve(page_url: &str, href: &str) -> Option<String> {
        if href.contains("://") {
            return Some(href.to_string());
        }
        let base = url::Url::parse(page_url).ok()?;
        base.join(href).ok().map(|u| u.to_string())
    }

    /// Retrieve one file candidate. Any failure (transport, HTTP status,
    /// size cap) drops the candidate with a log line; the scan goes on.
    pub async fn download(&self, file_url: &str) -> Option<DownloadedFile> {
        let client = if is_onion(file_url) {
            &self.proxied
        } else {
            &self.direct
        };

        let response = match client.get(file_url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(file_url, "download failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(file_url, status = response.status().as_u16(), "download rejected");
            return None;
        }

        // An over-cap Content-Length saves us from reading the body at all.
        if let Some(len) = response.content_length() {
            if len > self.max_bytes {
                debug!(file_url, len, "download exceeds size cap");
                return None;
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut response = response;
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if bytes.len() as u64 + chunk.len() as u64 > self.max_bytes {
                        debug!(file_url, "download exceeds size cap mid-stream");
                        return None;
                    }
                    bytes.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(file_url, "download read failed: {}", e);
                    return None;
                }
            }
        }

        Some(DownloadedFile {
            file_name: file_name_of(file_url),
            file_url: file_url.to_string(),
            content_type,
            bytes,
        })
    }
}

fn file_name_of(file_url: &str) -> String {
    let path = file_url.split(['?', '#']).next().unwrap_or(file_url);
    let name = path.rsplit('/').next().unwrap_or("");
    if name.is_empty() {
        "download".to_string()
    } else {
        name.to_string()
    }
}
