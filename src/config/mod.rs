//! Configuration
//!
//! Everything is read once at start from environment variables.
//! [`AppConfig::from_env`] delegates to [`AppConfig::from_lookup`] so tests
//! can supply a map instead of mutating the process environment.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::Level;

use crate::admission::AdmissionSettings;
use crate::limits::{QuotaConfig, RateLimitConfig};
use crate::logging::{LogConfig, LogFormat, LogOutput};
use crate::media::formats::{parse_quality_categories, Quality};
use crate::media::registry::RegistryConfig;
use crate::media::validate::DEFAULT_ALLOWED_DOMAINS;
use crate::media::worker::WorkerConfig;
use crate::server::http::HttpConfig;

const MIB: u64 = 1024 * 1024;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {var} ('{value}'): {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(var: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: SocketAddr,
    pub http: HttpConfig,
    pub registry: RegistryConfig,
    pub worker: WorkerConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub allowed_domains: Vec<String>,
    pub enabled_qualities: HashSet<Quality>,
    pub logging: LogConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` to resolve each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        // Server
        let host = env.string("SERVER_HOST", "0.0.0.0");
        let port: u16 = env.parse("SERVER_PORT", 8080)?;
        let ip: IpAddr = host
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::invalid("SERVER_HOST", &host, e.to_string()))?;
        let bind_address = SocketAddr::new(ip, port);
        let request_timeout = env.seconds("SERVER_TIMEOUT", 300)?;

        // Storage
        let download_dir = PathBuf::from(env.string("DOWNLOAD_DIR", "./downloads"));
        let max_video_mb: u64 = env.parse("MAX_VIDEO_SIZE_MB", 300)?;
        if max_video_mb == 0 {
            return Err(ConfigError::invalid(
                "MAX_VIDEO_SIZE_MB",
                "0",
                "must be greater than zero",
            ));
        }
        let ttl = env.seconds("FILE_TTL_SECONDS", 86_400)?;
        let storage_sweep = env.seconds("STORAGE_CLEANUP_INTERVAL", 3_600)?;

        // Worker
        let worker_host = env.string("WORKER_HOST", "localhost");
        let worker_port: u16 = env.parse("WORKER_PORT", 5000)?;
        let worker_timeout = env.seconds("WORKER_TIMEOUT", 60)?;

        // Validation
        let allowed_domains: Vec<String> = match env.get("ALLOWED_DOMAINS") {
            Some(raw) => raw
                .split(',')
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            None => DEFAULT_ALLOWED_DOMAINS.iter().map(|d| d.to_string()).collect(),
        };
        if allowed_domains.is_empty() {
            return Err(ConfigError::invalid(
                "ALLOWED_DOMAINS",
                "",
                "at least one domain is required",
            ));
        }
        let enabled_qualities = parse_quality_categories(
            &env.string("ENABLED_QUALITY_CATEGORIES", "Audio,FD,SD,HD,FHD"),
        );

        // Quota
        let quota_enabled = env.flag("QUOTA_ENABLED", false)?;
        let daily_limit_mb: u64 = env.parse("QUOTA_DAILY_LIMIT_MB", 1000)?;
        let reset_hour: u32 = env.parse("QUOTA_RESET_HOUR", 0)?;
        if reset_hour > 23 {
            return Err(ConfigError::invalid(
                "QUOTA_RESET_HOUR",
                &reset_hour.to_string(),
                "must be between 0 and 23",
            ));
        }
        let reset_minute: u32 = env.parse("QUOTA_RESET_MINUTE", 0)?;
        if reset_minute > 59 {
            return Err(ConfigError::invalid(
                "QUOTA_RESET_MINUTE",
                &reset_minute.to_string(),
                "must be between 0 and 59",
            ));
        }
        let quota_sweep = env.seconds("QUOTA_SWEEP_INTERVAL", 300)?;

        let mut quota = QuotaConfig::default()
            .with_daily_limit_bytes(daily_limit_mb.saturating_mul(MIB))
            .with_reset_time(reset_hour, reset_minute)
            .with_sweep_interval(quota_sweep);
        if quota_enabled {
            quota = quota.enabled();
        }

        // Rate limiting
        let rate_limit = RateLimitConfig::builder()
            .enabled(env.flag("RATELIMIT_ENABLED", true)?)
            .requests_per_window(env.parse("RATELIMIT_REQUESTS_PER_MINUTE", 60)?)
            .burst_size(env.parse("RATELIMIT_BURST_SIZE", 10)?)
            .sweep_interval(env.seconds("RATELIMIT_CLEANUP_INTERVAL", 1_800)?)
            .trust_proxy_headers(env.flag("TRUST_PROXY_HEADERS", false)?)
            .build();

        // Logging
        let level_raw = env.string("LOG_LEVEL", "info");
        let default_level = Level::from_str(&level_raw)
            .map_err(|_| ConfigError::invalid("LOG_LEVEL", &level_raw, "unknown log level"))?;
        let format_raw = env.string("LOG_FORMAT", "plaintext");
        let format = LogFormat::from_str(&format_raw)
            .map_err(|reason| ConfigError::invalid("LOG_FORMAT", &format_raw, reason))?;
        let output = match env.get("LOG_FILE") {
            Some(path) => LogOutput::File(PathBuf::from(path)),
            None => LogOutput::Stdout,
        };

        Ok(AppConfig {
            bind_address,
            http: HttpConfig {
                admin_token: env.get("ADMIN_TOKEN"),
                request_timeout,
                ..HttpConfig::default()
            },
            registry: RegistryConfig::default()
                .with_download_dir(download_dir)
                .with_max_artifact_bytes(max_video_mb.saturating_mul(MIB))
                .with_ttl(ttl)
                .with_sweep_interval(storage_sweep),
            worker: WorkerConfig::from_host_port(&worker_host, worker_port)
                .with_timeout(worker_timeout),
            quota,
            rate_limit,
            allowed_domains,
            enabled_qualities,
            logging: LogConfig {
                format,
                output,
                default_level,
            },
        })
    }

    /// Settings consumed by the admission façade
    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            allowed_domains: self.allowed_domains.clone(),
            enabled_qualities: self.enabled_qualities.clone(),
        }
    }

    /// JSON view of the resolved configuration. The admin token is never
    /// included, only whether one is set.
    pub fn summary(&self) -> Value {
        let qualities: Vec<&str> = Quality::selectable()
            .into_iter()
            .filter(|q| self.enabled_qualities.contains(q))
            .map(|q| q.as_str())
            .collect();

        json!({
            "server": {
                "bindAddress": self.bind_address.to_string(),
                "requestTimeoutSeconds": self.http.request_timeout.as_secs(),
                "adminTokenSet": self.http.admin_token.is_some(),
            },
            "storage": {
                "downloadDir": self.registry.download_dir.display().to_string(),
                "maxArtifactBytes": self.registry.max_artifact_bytes,
                "ttlSeconds": self.registry.ttl.as_secs(),
                "sweepIntervalSeconds": self.registry.sweep_interval.as_secs(),
            },
            "worker": {
                "baseUrl": self.worker.base_url,
                "timeoutSeconds": self.worker.timeout.as_secs(),
            },
            "quota": {
                "enabled": self.quota.enabled,
                "dailyLimitBytes": self.quota.daily_limit_bytes,
                "resetHour": self.quota.reset_hour,
                "resetMinute": self.quota.reset_minute,
                "sweepIntervalSeconds": self.quota.sweep_interval.as_secs(),
            },
            "rateLimit": {
                "enabled": self.rate_limit.enabled,
                "requestsPerWindow": self.rate_limit.requests_per_window,
                "burstSize": self.rate_limit.burst_size,
                "sweepIntervalSeconds": self.rate_limit.sweep_interval.as_secs(),
                "trustProxyHeaders": self.rate_limit.trust_proxy_headers,
            },
            "allowedDomains": self.allowed_domains,
            "enabledQualities": qualities,
            "logging": {
                "level": self.logging.default_level.as_str(),
                "format": self.logging.format.as_str(),
            },
        })
    }
}

/// Typed accessors over a variable lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, var: &str, default: &str) -> String {
        self.get(var).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(var, &raw, e.to_string())),
            None => Ok(default),
        }
    }

    /// Positive number of seconds.
    fn seconds(&self, var: &str, default: u64) -> Result<Duration, ConfigError> {
        let secs: u64 = self.parse(var, default)?;
        if secs == 0 {
            return Err(ConfigError::invalid(var, "0", "must be greater than zero"));
        }
        Ok(Duration::from_secs(secs))
    }

    fn flag(&self, var: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(var) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigError::invalid(var, &raw, "expected a boolean")),
            },
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.http.request_timeout, Duration::from_secs(300));
        assert!(config.http.admin_token.is_none());
        assert_eq!(config.registry.download_dir, PathBuf::from("./downloads"));
        assert_eq!(config.registry.max_artifact_bytes, 300 * MIB);
        assert_eq!(config.registry.ttl, Duration::from_secs(86_400));
        assert_eq!(config.registry.sweep_interval, Duration::from_secs(3_600));
        assert_eq!(config.worker.base_url, "http://localhost:5000");
        assert_eq!(config.worker.timeout, Duration::from_secs(60));
        assert!(!config.quota.enabled);
        assert_eq!(config.quota.daily_limit_bytes, 1000 * MIB);
        assert_eq!(config.quota.sweep_interval, Duration::from_secs(300));
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.requests_per_window, 60);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.rate_limit.sweep_interval, Duration::from_secs(1_800));
        assert!(!config.rate_limit.trust_proxy_headers);
        assert_eq!(config.enabled_qualities.len(), 5);
        assert_eq!(config.logging.format, LogFormat::Plaintext);
        assert_eq!(config.logging.default_level, Level::INFO);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("SERVER_HOST", "127.0.0.1"),
            ("SERVER_PORT", "9090"),
            ("MAX_VIDEO_SIZE_MB", "10"),
            ("QUOTA_ENABLED", "yes"),
            ("QUOTA_DAILY_LIMIT_MB", "100"),
            ("QUOTA_RESET_HOUR", "23"),
            ("QUOTA_RESET_MINUTE", "59"),
            ("RATELIMIT_BURST_SIZE", "0"),
            ("TRUST_PROXY_HEADERS", "1"),
            ("ADMIN_TOKEN", "s3cret"),
            ("ALLOWED_DOMAINS", " Example.com , ,vimeo.com"),
            ("ENABLED_QUALITY_CATEGORIES", "HD,FHD"),
            ("LOG_FORMAT", "json"),
            ("LOG_LEVEL", "debug"),
            ("LOG_FILE", "/tmp/mediagate.log"),
        ])
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.registry.max_artifact_bytes, 10 * MIB);
        assert!(config.quota.enabled);
        assert_eq!(config.quota.daily_limit_bytes, 100 * MIB);
        assert_eq!((config.quota.reset_hour, config.quota.reset_minute), (23, 59));
        assert_eq!(config.rate_limit.burst_size, 0);
        assert!(config.rate_limit.trust_proxy_headers);
        assert_eq!(config.http.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.allowed_domains, vec!["example.com", "vimeo.com"]);
        assert_eq!(
            config.enabled_qualities,
            [Quality::HD, Quality::FHD].into_iter().collect()
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.default_level, Level::DEBUG);
        assert_eq!(
            config.logging.output,
            LogOutput::File(PathBuf::from("/tmp/mediagate.log"))
        );
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[("SERVER_PORT", "eighty")]).unwrap_err();
        let ConfigError::Invalid { var, value, .. } = err;
        assert_eq!(var, "SERVER_PORT");
        assert_eq!(value, "eighty");
    }

    #[test]
    fn test_reset_time_out_of_range() {
        assert!(matches!(
            load(&[("QUOTA_RESET_HOUR", "24")]),
            Err(ConfigError::Invalid { var, .. }) if var == "QUOTA_RESET_HOUR"
        ));
        assert!(matches!(
            load(&[("QUOTA_RESET_MINUTE", "60")]),
            Err(ConfigError::Invalid { var, .. }) if var == "QUOTA_RESET_MINUTE"
        ));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for var in [
            "FILE_TTL_SECONDS",
            "STORAGE_CLEANUP_INTERVAL",
            "QUOTA_SWEEP_INTERVAL",
            "RATELIMIT_CLEANUP_INTERVAL",
            "SERVER_TIMEOUT",
        ] {
            assert!(
                matches!(load(&[(var, "0")]), Err(ConfigError::Invalid { var: v, .. }) if v == var),
                "{} = 0 should be rejected",
                var
            );
        }
    }

    #[test]
    fn test_ipv6_host() {
        let config = load(&[("SERVER_HOST", "::1"), ("SERVER_PORT", "81")]).unwrap();
        assert_eq!(config.bind_address, "[::1]:81".parse().unwrap());
        assert!(load(&[("SERVER_HOST", "not a host")]).is_err());
    }

    #[test]
    fn test_invalid_bool() {
        assert!(load(&[("QUOTA_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn test_invalid_log_settings() {
        assert!(load(&[("LOG_LEVEL", "chatty")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config = load(&[("SERVER_PORT", "  "), ("ALLOWED_DOMAINS", "")]).unwrap();
        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.allowed_domains.len(), DEFAULT_ALLOWED_DOMAINS.len());
    }

    #[test]
    fn test_only_separators_in_domains_rejected() {
        assert!(load(&[("ALLOWED_DOMAINS", " , ,")]).is_err());
    }

    #[test]
    fn test_summary_hides_admin_token() {
        let config = load(&[("ADMIN_TOKEN", "s3cret")]).unwrap();
        let summary = config.summary();
        assert_eq!(summary["server"]["adminTokenSet"], true);
        assert!(!summary.to_string().contains("s3cret"));
        assert_eq!(summary["enabledQualities"].as_array().unwrap().len(), 5);
    }
}
