use std::time::Duration;

use crate::extractor::ExtractorCommand;

const DEFAULT_PORT: u16 = 4000;
const DEFAULT_RATE_LIMIT_MAX: u32 = 10;
const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:8080";
const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn from_env() -> Self {
        match std::env::var("APP_ENV")
            .ok()
            .map(|value| value.trim().to_ascii_lowercase())
            .as_deref()
        {
            Some("development") => Self::Development,
            _ => Self::Production,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

/// Process-wide settings, resolved once at startup and injected through the
/// router state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub environment: Environment,
    pub rate_limit_max: u32,
    pub allowed_origins: Vec<String>,
    pub trust_proxy_headers: bool,
    pub extractor: ExtractorCommand,
    pub probe_timeout: Duration,
    /// Hard cap on a single extraction run. `None` leaves the subprocess
    /// bounded only by the executable's own size ceiling.
    pub max_stream_duration: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_ALLOWED_ORIGIN.to_string()]);

        let extractor = std::env::var("YT_DLP_COMMAND")
            .ok()
            .and_then(|value| ExtractorCommand::parse(&value))
            .unwrap_or_default();

        Self {
            bind_addr: resolve_bind_addr(),
            environment: Environment::from_env(),
            rate_limit_max: read_u64_env("RATE_LIMIT_MAX")
                .and_then(|value| u32::try_from(value).ok())
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
            allowed_origins,
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            extractor,
            probe_timeout: Duration::from_secs(
                read_u64_env("PROBE_TIMEOUT_SECS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_PROBE_TIMEOUT_SECONDS),
            ),
            max_stream_duration: read_u64_env("MAX_STREAM_SECS")
                .filter(|value| *value > 0)
                .map(Duration::from_secs),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            environment: Environment::Production,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            allowed_origins: vec![DEFAULT_ALLOWED_ORIGIN.to_string()],
            trust_proxy_headers: false,
            extractor: ExtractorCommand::default(),
            probe_timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECONDS),
            max_stream_duration: None,
        }
    }
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    parse_bool(&value)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(" YES "), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("Off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:4000");
        assert_eq!(config.rate_limit_max, 10);
        assert_eq!(config.allowed_origins, vec!["http://localhost:8080"]);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.extractor.program, "yt-dlp");
        assert!(config.max_stream_duration.is_none());
    }

    #[test]
    fn non_empty_trims() {
        assert_eq!(non_empty("  a "), Some("a"));
        assert_eq!(non_empty("   "), None);
    }
}
