use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use url::Url;
use uuid::Uuid;

use crate::error::ApiError;

const SUPPORTED_DOMAINS: [&str; 4] = ["youtube.com", "youtu.be", "instagram.com", "instagr.am"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Quality {
    #[default]
    Best,
    Uhd4k,
    P1080,
    P720,
    P480,
    P360,
}

impl Quality {
    pub const ALL: [Quality; 6] = [
        Quality::Best,
        Quality::Uhd4k,
        Quality::P1080,
        Quality::P720,
        Quality::P480,
        Quality::P360,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Uhd4k => "4k",
            Self::P1080 => "1080p",
            Self::P720 => "720p",
            Self::P480 => "480p",
            Self::P360 => "360p",
        }
    }
}

impl FromStr for Quality {
    type Err = Rejection;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Quality::ALL
            .into_iter()
            .find(|quality| quality.as_str() == value)
            .ok_or(Rejection::InvalidQuality)
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingUrl,
    UnsupportedUrl,
    InvalidQuality,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingUrl => "Invalid URL parameter",
            Self::UnsupportedUrl => "Unsupported platform or invalid URL",
            Self::InvalidQuality => "Invalid quality parameter",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        ApiError::bad_request(rejection.message())
    }
}

/// A URL/quality pair that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub url: Url,
    pub quality: Quality,
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub id: Uuid,
    pub url: Url,
    pub quality: Quality,
    pub client_address: String,
    pub received_at: DateTime<Utc>,
}

impl DownloadRequest {
    pub fn new(accepted: Accepted, client_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: accepted.url,
            quality: accepted.quality,
            client_address: client_address.into(),
            received_at: Utc::now(),
        }
    }
}

/// Decides whether a submitted URL/quality pair may reach the extractor.
/// An absent quality means `best`; an empty one is invalid.
pub fn validate(raw_url: Option<&str>, quality: Option<&str>) -> Result<Accepted, Rejection> {
    let raw_url = raw_url
        .filter(|value| !value.is_empty())
        .ok_or(Rejection::MissingUrl)?;

    let url = parse_supported_url(raw_url).ok_or(Rejection::UnsupportedUrl)?;

    let quality = match quality {
        Some(token) => token.parse::<Quality>()?,
        None => Quality::Best,
    };

    Ok(Accepted { url, quality })
}

fn parse_supported_url(input: &str) -> Option<Url> {
    let parsed = Url::parse(input).ok()?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    SUPPORTED_DOMAINS
        .iter()
        .any(|domain| host == *domain)
        .then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_allow_listed_hosts() {
        for url in [
            "https://youtube.com/watch?v=abc",
            "https://www.youtube.com/shorts/abc",
            "http://youtu.be/abc",
            "https://WWW.Instagram.com/reel/xyz/",
            "https://instagr.am/p/xyz",
        ] {
            let accepted = validate(Some(url), None).unwrap();
            assert_eq!(accepted.quality, Quality::Best, "{url}");
        }
    }

    #[test]
    fn rejects_hosts_outside_allow_list_for_any_scheme_and_quality() {
        let hosts = [
            "example.com",
            "youtube.com.evil.net",
            "notyoutube.com",
            "m.youtube.com",
            "www.www.youtube.com",
            "vimeo.com",
        ];
        for host in hosts {
            for scheme in ["http", "https", "ftp", "file"] {
                for quality in [None, Some("best"), Some("720p"), Some("8k")] {
                    let url = format!("{scheme}://{host}/watch?v=abc");
                    assert_eq!(
                        validate(Some(&url), quality),
                        Err(Rejection::UnsupportedUrl),
                        "{url} {quality:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn rejects_non_http_schemes_on_allowed_hosts() {
        assert_eq!(
            validate(Some("ftp://youtube.com/x"), None),
            Err(Rejection::UnsupportedUrl)
        );
        assert_eq!(
            validate(Some("ftp://example.com/x"), None),
            Err(Rejection::UnsupportedUrl)
        );
    }

    #[test]
    fn rejects_missing_or_unparseable_url() {
        assert_eq!(validate(None, None), Err(Rejection::MissingUrl));
        assert_eq!(validate(Some(""), None), Err(Rejection::MissingUrl));
        assert_eq!(
            validate(Some("youtube.com/watch?v=abc"), None),
            Err(Rejection::UnsupportedUrl)
        );
        assert_eq!(
            validate(Some("not a url"), None),
            Err(Rejection::UnsupportedUrl)
        );
    }

    #[test]
    fn checks_quality_after_url() {
        assert_eq!(
            validate(Some("https://youtube.com/x"), Some("8k")),
            Err(Rejection::InvalidQuality)
        );
        assert_eq!(
            validate(Some("https://youtube.com/x"), Some("")),
            Err(Rejection::InvalidQuality)
        );
        assert_eq!(
            validate(Some("https://youtube.com/x"), Some("720P")),
            Err(Rejection::InvalidQuality)
        );
        let accepted = validate(Some("https://youtube.com/x"), Some("720p")).unwrap();
        assert_eq!(accepted.quality, Quality::P720);
    }

    #[test]
    fn quality_tokens_round_trip_through_display() {
        for quality in Quality::ALL {
            assert_eq!(quality.to_string().parse::<Quality>(), Ok(quality));
        }
    }

    #[test]
    fn rejection_messages_match_api_contract() {
        assert_eq!(Rejection::MissingUrl.to_string(), "Invalid URL parameter");
        assert_eq!(
            Rejection::UnsupportedUrl.to_string(),
            "Unsupported platform or invalid URL"
        );
        assert_eq!(Rejection::InvalidQuality.to_string(), "Invalid quality parameter");
    }
}
