//! Platform Configuration
//!
//! Environment-driven settings plus the tunable scoring/confidence weights.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
    #[error("invalid proxy address: {0}")]
    Proxy(String),
}

/// Top-level platform configuration.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// SOCKS5 endpoint used to reach hidden services.
    pub proxy_addr: String,
    /// Store backend: `memory://` or `file://<dir>`.
    pub store_uri: String,
    /// Wall-clock bound for one page fetch.
    pub request_timeout: Duration,
    /// Response body cap while reading a page.
    pub fetch_max_bytes: usize,
    /// Per-file download cap.
    pub download_max_bytes: u64,
    /// Maximum file links followed per scan.
    pub max_file_downloads: usize,
    /// Scheduler worker concurrency.
    pub pool_size: usize,
    /// Monitor admission cap per owner.
    pub monitor_cap_per_owner: usize,
    /// Scheduler tick granularity.
    pub tick_interval: Duration,
    /// API listen address.
    pub bind_addr: String,
    /// Optional plain log file directory.
    pub log_dir: Option<PathBuf>,
    pub providers: ProviderToggles,
    pub scoring: ScoringWeights,
    pub confidence: ConfidenceWeights,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            proxy_addr: "127.0.0.1:9050".to_string(),
            store_uri: "memory://".to_string(),
            request_timeout: Duration::from_secs(30),
            fetch_max_bytes: 10 * 1024 * 1024,
            download_max_bytes: 50 * 1024 * 1024,
            max_file_downloads: 10,
            pool_size: 4,
            monitor_cap_per_owner: 5,
            tick_interval: Duration::from_secs(30),
            bind_addr: "0.0.0.0:8080".to_string(),
            log_dir: None,
            providers: ProviderToggles::default(),
            scoring: ScoringWeights::default(),
            confidence: ConfidenceWeights::default(),
        }
    }
}

impl WatchConfig {
    /// Build configuration from the process environment. Unset variables fall
    /// back to defaults; malformed values are a startup error (exit code 2).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("ANON_PROXY_ADDR") {
            if v.trim().is_empty() {
                return Err(ConfigError::Proxy(v));
            }
            cfg.proxy_addr = v;
        }
        if let Ok(v) = std::env::var("STORE_URI") {
            cfg.store_uri = v;
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_SECONDS") {
            let secs: u64 = v.parse().map_err(|_| ConfigError::Invalid {
                var: "REQUEST_TIMEOUT_SECONDS",
                value: v,
            })?;
            cfg.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Ok(v) = std::env::var("DOWNLOAD_MAX_BYTES") {
            cfg.download_max_bytes = v.parse().map_err(|_| ConfigError::Invalid {
                var: "DOWNLOAD_MAX_BYTES",
                value: v,
            })?;
        }
        if let Ok(v) = std::env::var("MONITOR_POOL_SIZE") {
            let n: usize = v.parse().map_err(|_| ConfigError::Invalid {
                var: "MONITOR_POOL_SIZE",
                value: v,
            })?;
            if n == 0 {
                return Err(ConfigError::Invalid {
                    var: "MONITOR_POOL_SIZE",
                    value: "0".to_string(),
                });
            }
            cfg.pool_size = n;
        }
        if let Ok(v) = std::env::var("MONITOR_CAP_PER_OWNER") {
            let n: usize = v.parse().map_err(|_| ConfigError::Invalid {
                var: "MONITOR_CAP_PER_OWNER",
                value: v,
            })?;
            cfg.monitor_cap_per_owner = n;
        }
        if let Ok(v) = std::env::var("LOG_DIR") {
            if !v.trim().is_empty() {
                cfg.log_dir = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            cfg.bind_addr = v;
        }

        Ok(cfg)
    }

    /// `socks5h://` form of the proxy address; hostname resolution happens on
    /// the proxy side, which hidden-service addresses require.
    pub fn proxy_url(&self) -> String {
        if self.proxy_addr.contains("://") {
            self.proxy_addr.clone()
        } else {
            format!("socks5h://{}", self.proxy_addr)
        }
    }
}

/// Which capability providers are active. A disabled provider reports
/// `not_available` instead of failing the scan.
#[derive(Debug, Clone)]
pub struct ProviderToggles {
    pub signature: bool,
    pub strings: bool,
    pub metadata: bool,
    pub carving: bool,
}

impl Default for ProviderToggles {
    fn default() -> Self {
        Self {
            signature: true,
            strings: true,
            metadata: true,
            carving: true,
        }
    }
}

/// Additive threat-score weights. Defaults are the shipped rule set.
#[derive(Debug, Clone)]
pub struct ScoringWeights {
    pub critical_keyword: u32,
    pub high_keyword: u32,
    pub moderate_keyword: u32,
    /// Both an email and a crypto address on the same page.
    pub dual_indicator: u32,
    /// Contact channel present (contact keyword or any email); fires once.
    pub contact: u32,
    pub malware: u32,
    pub pgp: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            critical_keyword: 15,
            high_keyword: 8,
            moderate_keyword: 3,
            dual_indicator: 40,
            contact: 3,
            malware: 25,
            pgp: 2,
        }
    }
}

/// Additive classification-confidence weights, each term capped.
#[derive(Debug, Clone)]
pub struct ConfidenceWeights {
    pub keyword_unit: f64,
    pub keyword_cap: f64,
    pub crypto_unit: f64,
    pub crypto_cap: f64,
    pub email_unit: f64,
    pub email_cap: f64,
    pub malware: f64,
    pub category_unit: f64,
    pub category_cap: f64,
    /// Returned when no signal fires at all.
    pub floor: f64,
    pub ceiling: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            keyword_unit: 0.12,
            keyword_cap: 0.40,
            crypto_unit: 0.15,
            crypto_cap: 0.35,
            email_unit: 0.10,
            email_cap: 0.30,
            malware: 0.20,
            category_unit: 0.05,
            category_cap: 0.15,
            floor: 0.25,
            ceiling: 0.99,
        }
    }
}
