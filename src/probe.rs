use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::extractor::ExtractorCommand;

const FIELD_DELIMITER: &str = "|||";
const PRINT_TEMPLATE: &str = "%(title)s|||%(uploader)s";
const MAX_TITLE_CHARS: usize = 100;
const FORBIDDEN_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: String,
}

impl MediaMetadata {
    fn fallback() -> Self {
        Self {
            title: format!("video_{}", Utc::now().timestamp_millis()),
            uploader: "unknown".to_string(),
        }
    }
}

/// Asks the extractor for the title and uploader of `url`.
///
/// Never fails: a spawn error, timeout, nonzero exit or malformed output all
/// resolve to a synthetic `video_<millis>` title.
pub async fn probe(extractor: &ExtractorCommand, url: &Url, limit: Duration) -> MediaMetadata {
    let mut command = extractor.command([
        "--print",
        PRINT_TEMPLATE,
        "--no-playlist",
        url.as_str(),
    ]);

    let output = match timeout(limit, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => {
            warn!("Metadata probe could not start: {error}");
            return MediaMetadata::fallback();
        }
        Err(_) => {
            warn!(?limit, "Metadata probe timed out for {url}");
            return MediaMetadata::fallback();
        }
    };

    if !output.status.success() {
        debug!(
            status = ?output.status.code(),
            "Metadata probe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return MediaMetadata::fallback();
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
        .unwrap_or_else(MediaMetadata::fallback)
}

fn parse_probe_output(stdout: &str) -> Option<MediaMetadata> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut fields = trimmed.split(FIELD_DELIMITER);
    let (Some(title), Some(uploader), None) = (fields.next(), fields.next(), fields.next()) else {
        return None;
    };

    let uploader = uploader.trim();
    Some(MediaMetadata {
        title: sanitize_title(title),
        uploader: if uploader.is_empty() {
            "unknown".to_string()
        } else {
            uploader.to_string()
        },
    })
}

/// Makes a title safe to use as a file name: path-hostile and control
/// characters become `_`, the result is capped at 100 characters.
pub fn sanitize_title(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|character| {
            if FORBIDDEN_FILENAME_CHARS.contains(&character) || character.is_control() {
                '_'
            } else {
                character
            }
        })
        .take(MAX_TITLE_CHARS)
        .collect();

    let sanitized = sanitized.trim_end();
    if sanitized.is_empty() {
        "video".to_string()
    } else {
        sanitized.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> ExtractorCommand {
        ExtractorCommand {
            program: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string(), "yt-dlp".to_string()],
        }
    }

    fn target() -> Url {
        Url::parse("https://youtube.com/watch?v=abc").unwrap()
    }

    fn is_fallback(metadata: &MediaMetadata) -> bool {
        metadata.uploader == "unknown"
            && metadata
                .title
                .strip_prefix("video_")
                .is_some_and(|millis| millis.parse::<i64>().is_ok())
    }

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(
            sanitize_title(r#"a<b>c:d"e/f\g|h?i*j"#),
            "a_b_c_d_e_f_g_h_i_j"
        );
        assert_eq!(sanitize_title("tab\there"), "tab_here");
        assert_eq!(sanitize_title("  Café — live  "), "Café — live");
    }

    #[test]
    fn sanitize_truncates_by_characters() {
        let long = "é".repeat(250);
        let sanitized = sanitize_title(&long);
        assert_eq!(sanitized.chars().count(), 100);
    }

    #[test]
    fn sanitize_defaults_empty_titles() {
        assert_eq!(sanitize_title(""), "video");
        assert_eq!(sanitize_title("   "), "video");
    }

    #[test]
    fn sanitized_titles_never_contain_forbidden_characters() {
        let inputs = [
            "<<<>>>",
            "a/b/c",
            "NA",
            "?*?*?*?*",
            "\"quoted\" \\ title",
            "normal title",
        ];
        for input in inputs {
            let long = input.repeat(40);
            for candidate in [input, long.as_str()] {
                let sanitized = sanitize_title(candidate);
                assert!(sanitized.chars().count() <= 100);
                assert!(!sanitized.contains(FORBIDDEN_FILENAME_CHARS));
            }
        }
    }

    #[test]
    fn parse_requires_exactly_two_fields() {
        let parsed = parse_probe_output("My: Video?|||Some Channel\n").unwrap();
        assert_eq!(parsed.title, "My_ Video_");
        assert_eq!(parsed.uploader, "Some Channel");

        assert!(parse_probe_output("").is_none());
        assert!(parse_probe_output("just a title").is_none());
        assert!(parse_probe_output("a|||b|||c").is_none());
    }

    #[test]
    fn parse_defaults_blank_fields() {
        let parsed = parse_probe_output("|||   ").unwrap();
        assert_eq!(parsed.title, "video");
        assert_eq!(parsed.uploader, "unknown");
    }

    #[tokio::test]
    async fn probe_passes_print_template_and_url() {
        let script = r#"[ "$1" = "--print" ] && [ "$2" = '%(title)s|||%(uploader)s' ] && [ "$3" = "--no-playlist" ] || exit 9
echo "Title for $4|||Uploader""#;

        let metadata = probe(&shell(script), &target(), Duration::from_secs(10)).await;

        assert_eq!(
            metadata.title,
            "Title for https___youtube.com_watch_v=abc"
        );
        assert_eq!(metadata.uploader, "Uploader");
    }

    #[tokio::test]
    async fn probe_falls_back_on_nonzero_exit() {
        let metadata = probe(
            &shell("echo 'Title|||Uploader'; exit 1"),
            &target(),
            Duration::from_secs(10),
        )
        .await;
        assert!(is_fallback(&metadata), "{metadata:?}");
    }

    #[tokio::test]
    async fn probe_falls_back_on_empty_output() {
        let metadata = probe(&shell("exit 0"), &target(), Duration::from_secs(10)).await;
        assert!(is_fallback(&metadata), "{metadata:?}");
    }

    #[tokio::test]
    async fn probe_falls_back_when_executable_is_missing() {
        let missing = ExtractorCommand {
            program: "/nonexistent/yt-dlp".to_string(),
            base_args: Vec::new(),
        };
        let metadata = probe(&missing, &target(), Duration::from_secs(10)).await;
        assert!(is_fallback(&metadata), "{metadata:?}");
    }

    #[tokio::test]
    async fn probe_falls_back_on_timeout() {
        let metadata = probe(
            &shell("exec sleep 30"),
            &target(),
            Duration::from_millis(100),
        )
        .await;
        assert!(is_fallback(&metadata), "{metadata:?}");
    }
}
