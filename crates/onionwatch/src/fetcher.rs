//! Page Fetcher
//!
//! Single-attempt HTTP acquisition with SOCKS5 routing for hidden services.
//! Never fails outward: every exceptional condition maps to a status.

use crate::config::{ConfigError, WatchConfig};
use crate::{is_onion, UrlStatus};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Result of one acquisition attempt.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url_status: UrlStatus,
    pub status_code: Option<u16>,
    pub response_time_seconds: Option<f64>,
    pub content_type: Option<String>,
    pub response_headers: BTreeMap<String, String>,
    /// Raw body bytes; present on ONLINE even for binary payloads.
    pub body: Option<Vec<u8>>,
    /// Decoded text, only when the content type is text-like.
    pub text: Option<String>,
}

impl FetchOutcome {
    fn failure(status: UrlStatus, response_time_seconds: Option<f64>) -> Self {
        Self {
            url_status: status,
            status_code: None,
            response_time_seconds,
            content_type: None,
            response_headers: BTreeMap::new(),
            body: None,
            text: None,
        }
    }
}

pub struct Fetcher {
    direct: reqwest::Client,
    proxied: reqwest::Client,
    max_body_bytes: usize,
}

impl Fetcher {
    pub fn new(config: &WatchConfig) -> Result<Self, ConfigError> {
        let direct = client_builder(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Proxy(e.to_string()))?;
        let proxy = reqwest::Proxy::all(config.proxy_url())
            .map_err(|e| ConfigError::Proxy(format!("{}: {}", config.proxy_url(), e)))?;
        let proxied = client_builder(config.request_timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| ConfigError::Proxy(e.to_string()))?;
        Ok(Self {
            direct,
            proxied,
            max_body_bytes: config.fetch_max_bytes,
        })
    }

    fn client_for(&self, target: &str) -> &reqwest::Client {
        if is_onion(target) {
            &self.proxied
        } else {
            &self.direct
        }
    }

    /// One acquisition attempt. Retries are a scheduler concern.
    pub async fn fetch(&self, target: &str) -> FetchOutcome {
        let start = Instant::now();
        let response = match self.client_for(target).get(target).send().await {
            Ok(r) => r,
            Err(e) => {
                let status = classify_transport_error(&e);
                debug!(url = target, %status, "fetch failed: {}", e);
                let elapsed = (status == UrlStatus::Timeout)
                    .then(|| start.elapsed().as_secs_f64());
                return FetchOutcome::failure(status, elapsed);
            }
        };

        let status_code = response.status().as_u16();
        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).to_string(),
                )
            })
            .collect();
        let content_type = response_headers.get("content-type").cloned();

        if !(response.status().is_success() || response.status().is_redirection()) {
            return FetchOutcome {
                url_status: UrlStatus::Error,
                status_code: Some(status_code),
                response_time_seconds: Some(start.elapsed().as_secs_f64()),
                content_type,
                response_headers,
                body: None,
                text: None,
            };
        }

        let body = match self.read_capped(response).await {
            Ok(b) => b,
            Err(status) => {
                return FetchOutcome {
                    url_status: status,
                    status_code: Some(status_code),
                    response_time_seconds: Some(start.elapsed().as_secs_f64()),
                    content_type,
                    response_headers,
                    body: None,
                    text: None,
                };
            }
        };
        let response_time_seconds = Some(start.elapsed().as_secs_f64());

        if !is_text_content_type(content_type.as_deref()) {
            return FetchOutcome {
                url_status: UrlStatus::Online,
                status_code: Some(status_code),
                response_time_seconds,
                content_type,
                response_headers,
                body: Some(body),
                text: None,
            };
        }

        match String::from_utf8(body.clone()) {
            Ok(text) => FetchOutcome {
                url_status: UrlStatus::Online,
                status_code: Some(status_code),
                response_time_seconds,
                content_type,
                response_headers,
                body: Some(body),
                text: Some(text),
            },
            // Undecodable text payload: the page is up but unusable.
            Err(_) => FetchOutcome {
                url_status: UrlStatus::Error,
                status_code: Some(status_code),
                response_time_seconds,
                content_type,
                response_headers,
                body: Some(body),
                text: None,
            },
        }
    }

    /// Read the body while enforcing the response size cap.
    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, UrlStatus> {
        let mut body: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if body.len() + chunk.len() > self.max_body_bytes {
                        return Err(UrlStatus::Error);
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => return Ok(body),
                Err(e) if e.is_timeout() => return Err(UrlStatus::Timeout),
                Err(_) => return Err(UrlStatus::Error),
            }
        }
    }
}

fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder().timeout(timeout)
}

/// Transport taxonomy: timeouts are TIMEOUT, refused/unreachable is OFFLINE,
/// anything else on the wire is ERROR. Connect timeouts classify as TIMEOUT,
/// so the timeout check runs first.
fn classify_transport_error(e: &reqwest::Error) -> UrlStatus {
    if e.is_timeout() {
        UrlStatus::Timeout
    } else if e.is_connect() {
        UrlStatus::Offline
    } else {
        UrlStatus::Error
    }
}

/// A decoded text body is produced only for text-like content types (or when
/// the header is absent).
fn is_text_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.trim().to_ascii_lowercase();
            ct.starts_with("text/")
                || ct.starts_with("application/json")
                || ct.starts_with("application/xml")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(timeout_ms: u64) -> WatchConfig {
        WatchConfig {
            request_timeout: Duration::from_millis(timeout_ms),
            ..WatchConfig::default()
        }
    }

    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_online_classification() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 20\r\n\r\n<p>Dark Market</p>\r\n",
        )
        .await;
        let fetcher = Fetcher::new(&test_config(5000)).unwrap();
        let out = fetcher.fetch(&url).await;
        assert_eq!(out.url_status, UrlStatus::Online);
        assert_eq!(out.status_code, Some(200));
        assert!(out.text.as_deref().unwrap().contains("Dark Market"));
        assert!(out.response_time_seconds.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_offline_on_refused_connection() {
        // Bind then drop to learn a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = Fetcher::new(&test_config(5000)).unwrap();
        let out = fetcher.fetch(&format!("http://{}/", addr)).await;
        assert_eq!(out.url_status, UrlStatus::Offline);
        assert_eq!(out.status_code, None);
    }

    #[tokio::test]
    async fn test_timeout_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let fetcher = Fetcher::new(&test_config(300)).unwrap();
        let out = fetcher.fetch(&format!("http://{}/", addr)).await;
        assert_eq!(out.url_status, UrlStatus::Timeout);
        assert_eq!(out.status_code, None);
        // Wall clock spent is roughly the configured bound.
        assert!(out.response_time_seconds.unwrap() >= 0.29);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let url = serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n").await;
        let fetcher = Fetcher::new(&test_config(5000)).unwrap();
        let out = fetcher.fetch(&url).await;
        assert_eq!(out.url_status, UrlStatus::Error);
        assert_eq!(out.status_code, Some(500));
        assert!(out.text.is_none());
    }

    #[tokio::test]
    async fn test_binary_payload_gate() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: 4\r\n\r\n\x01\x02\x03\x04",
        )
        .await;
        let fetcher = Fetcher::new(&test_config(5000)).unwrap();
        let out = fetcher.fetch(&url).await;
        assert_eq!(out.url_status, UrlStatus::Online);
        assert!(out.body.is_some());
        assert!(out.text.is_none());
    }

    #[tokio::test]
    async fn test_body_size_cap() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 64\r\n\r\n0123456789012345678901234567890123456789012345678901234567890123",
        )
        .await;
        let mut config = test_config(5000);
        config.fetch_max_bytes = 16;
        let fetcher = Fetcher::new(&config).unwrap();
        let out = fetcher.fetch(&url).await;
        assert_eq!(out.url_status, UrlStatus::Error);
    }

    #[test]
    fn test_content_type_gate() {
        assert!(is_text_content_type(None));
        assert!(is_text_content_type(Some("text/html; charset=utf-8")));
        assert!(is_text_content_type(Some("application/json")));
        assert!(is_text_content_type(Some("application/xml")));
        assert!(!is_text_content_type(Some("application/octet-stream")));
        assert!(!is_text_content_type(Some("image/png")));
    }
}
