use std::{fmt, io, time::Duration};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    error::ApiError,
    extractor::{ExtractionProcess, ExtractorCommand},
    probe::MediaMetadata,
    validate::DownloadRequest,
};

const CONTAINER_EXTENSION: &str = "mp4";
const CONTAINER_CONTENT_TYPE: &str = "video/mp4";
const FORMAT_SORT: &str = "vcodec:h264,acodec:m4a";
const MAX_FILESIZE: &str = "500M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    MetadataResolved,
    SubprocessSpawned,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamPhase {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::MetadataResolved => "metadata_resolved",
            Self::SubprocessSpawned => "subprocess_spawned",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Tracks where a download is in its lifecycle. Dropped before reaching a
/// terminal phase means the client went away.
struct Session {
    request_id: Uuid,
    received_at: DateTime<Utc>,
    phase: StreamPhase,
}

impl Session {
    fn new(request: &DownloadRequest) -> Self {
        Self {
            request_id: request.id,
            received_at: request.received_at,
            phase: StreamPhase::Idle,
        }
    }

    fn advance(&mut self, next: StreamPhase) {
        debug!(request_id = %self.request_id, from = %self.phase, to = %next, "Download phase");
        self.phase = next;
        if next == StreamPhase::Completed {
            let elapsed_ms = (Utc::now() - self.received_at).num_milliseconds();
            info!(request_id = %self.request_id, elapsed_ms, "Download completed");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.phase.is_terminal() {
            info!(
                request_id = %self.request_id,
                phase = %self.phase,
                "Client disconnected, killing extractor"
            );
            self.advance(StreamPhase::Cancelled);
        }
    }
}

struct ActiveDownload {
    session: Session,
    process: ExtractionProcess,
}

/// Runs the extraction subprocess and turns its stdout into the response
/// body.
///
/// Headers are only committed once the first chunk is available, so a
/// process that fails without output still yields a JSON 500. After that
/// a failure aborts the body instead.
pub async fn stream(
    request: &DownloadRequest,
    format_expression: &str,
    metadata: &MediaMetadata,
    extractor: &ExtractorCommand,
    max_duration: Option<Duration>,
) -> Result<Response, ApiError> {
    let mut session = Session::new(request);
    session.advance(StreamPhase::MetadataResolved);

    let headers = match download_headers(&metadata.title) {
        Ok(headers) => headers,
        Err(error) => {
            session.advance(StreamPhase::Failed);
            return Err(error);
        }
    };
    let args = extraction_args(format_expression, &request.url);

    let mut process = match ExtractionProcess::spawn(extractor, &args, max_duration, request.id) {
        Ok(process) => process,
        Err(error) => {
            warn!(request_id = %request.id, "Could not start {}: {error}", extractor.program);
            session.advance(StreamPhase::Failed);
            return Err(ApiError::download_failed());
        }
    };
    session.advance(StreamPhase::SubprocessSpawned);

    let first_chunk = match process.next_chunk().await {
        Some(Ok(chunk)) => chunk,
        Some(Err(error)) => {
            warn!(request_id = %request.id, "Could not read extractor output: {error}");
            process.terminate();
            session.advance(StreamPhase::Failed);
            return Err(ApiError::download_failed());
        }
        None => {
            let outcome = process.wait().await;
            if outcome.is_success() {
                session.advance(StreamPhase::Completed);
                return Ok((headers, Body::empty()).into_response());
            }
            warn!(request_id = %request.id, ?outcome, "Extractor failed before sending any data");
            session.advance(StreamPhase::Failed);
            return Err(ApiError::download_failed());
        }
    };

    session.advance(StreamPhase::Streaming);
    let body = Body::from_stream(body_stream(first_chunk, ActiveDownload { session, process }));

    Ok((headers, body).into_response())
}

fn body_stream(
    first_chunk: Bytes,
    download: ActiveDownload,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let rest = stream::unfold(Some(download), |download| async move {
        let mut download = download?;
        match download.process.next_chunk().await {
            Some(Ok(chunk)) => Some((Ok(chunk), Some(download))),
            Some(Err(error)) => {
                warn!(
                    request_id = %download.session.request_id,
                    "Extractor output broke mid-stream: {error}"
                );
                download.process.terminate();
                download.session.advance(StreamPhase::Failed);
                Some((Err(error), None))
            }
            None => {
                let outcome = download.process.wait().await;
                if outcome.is_success() {
                    download.session.advance(StreamPhase::Completed);
                    return None;
                }

                warn!(
                    request_id = %download.session.request_id,
                    ?outcome,
                    "Extractor failed mid-stream, truncating response"
                );
                download.session.advance(StreamPhase::Failed);
                Some((
                    Err(io::Error::other(format!("extractor ended with {outcome:?}"))),
                    None,
                ))
            }
        }
    });

    stream::iter([Ok::<_, io::Error>(first_chunk)]).chain(rest)
}

fn extraction_args(format_expression: &str, url: &Url) -> Vec<String> {
    vec![
        "-f".to_string(),
        format_expression.to_string(),
        "-o".to_string(),
        "-".to_string(),
        "--no-playlist".to_string(),
        "--no-part".to_string(),
        "--quiet".to_string(),
        "--no-warnings".to_string(),
        "--remux-video".to_string(),
        CONTAINER_EXTENSION.to_string(),
        "--merge-output-format".to_string(),
        CONTAINER_EXTENSION.to_string(),
        "--format-sort".to_string(),
        FORMAT_SORT.to_string(),
        "--max-filesize".to_string(),
        MAX_FILESIZE.to_string(),
        url.to_string(),
    ]
}

fn download_headers(title: &str) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTAINER_CONTENT_TYPE));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(title))
            .map_err(|_| ApiError::internal("Failed to process request"))?,
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    Ok(headers)
}

/// `title` must already be sanitized. Non-ASCII titles get an RFC 5987
/// `filename*` next to an ASCII-only `filename`.
fn content_disposition(title: &str) -> String {
    let filename = format!("{title}.{CONTAINER_EXTENSION}");
    if filename.is_ascii() {
        return format!("attachment; filename=\"{filename}\"");
    }

    let ascii_fallback: String = filename
        .chars()
        .map(|character| if character.is_ascii() { character } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{ascii_fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(&filename)
    )
}
