//! HTTP source client.
//!
//! Async HTTP client using `reqwest`. Failures are classified for the retry
//! policy: transport problems and temporarily unavailable servers are
//! `SourceUnreachable`, everything else the server refuses is
//! `SourceRejected`.

use std::time::Duration;

use bytes::Bytes;
use filerelay_transfer::{
    OpenedSource, Source, SourceDescriptor, SourceMetadata, TransferError,
    name_from_content_disposition,
};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::StatusCode;
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, HeaderName, HeaderValue,
    RANGE, USER_AGENT,
};
use tracing::debug;

const DEFAULT_USER_AGENT: &str = concat!("filerelay/", env!("CARGO_PKG_VERSION"));

/// Errors building the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid user agent")]
    InvalidUserAgent,
}

/// Client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub user_agent: String,
    pub connect_timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Source that fetches URL descriptors over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpSource {
    http: reqwest::Client,
}

impl HttpSource {
    pub fn new(config: &HttpSourceConfig) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).map_err(|_| Error::InvalidUserAgent)?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self { http })
    }
}

impl Source for HttpSource {
    fn probe<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
    ) -> BoxFuture<'a, Result<SourceMetadata, TransferError>> {
        Box::pin(async move {
            let url = url_of(descriptor)?;
            let resp = self
                .http
                .head(url)
                .send()
                .await
                .map_err(|e| classify_error(&e))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(status));
            }

            let headers = resp.headers();
            // `Response::content_length` reports the (empty) body of a HEAD.
            let total_bytes = header_u64(headers, CONTENT_LENGTH);
            let suggested_name = headers
                .get(CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok())
                .and_then(name_from_content_disposition);
            let ranges = headers
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("none");
            debug!(url, ?total_bytes, ?suggested_name, ranges, "probed http source");

            Ok(SourceMetadata {
                total_bytes,
                suggested_name,
            })
        })
    }

    fn open<'a>(
        &'a self,
        descriptor: &'a SourceDescriptor,
        offset: u64,
    ) -> BoxFuture<'a, Result<OpenedSource, TransferError>> {
        Box::pin(async move {
            let url = url_of(descriptor)?;
            let mut req = self.http.get(url);
            if offset > 0 {
                req = req.header(RANGE, format!("bytes={offset}-"));
            }
            let resp = req.send().await.map_err(|e| classify_error(&e))?;
            let status = resp.status();

            let (start, total_bytes) = match status {
                StatusCode::PARTIAL_CONTENT => {
                    let range = resp
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_content_range)
                        .ok_or_else(|| {
                            TransferError::SourceRejected(
                                "partial response without a valid Content-Range".into(),
                            )
                        })?;
                    match range.start {
                        Some(start) => (start, range.total),
                        None => {
                            return Err(TransferError::SourceRejected(
                                "unsatisfied partial response".into(),
                            ));
                        }
                    }
                }
                StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                    // Everything up to `offset` is already there when the
                    // resource is exactly that long.
                    let total = resp
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_content_range)
                        .and_then(|r| r.total);
                    if total == Some(offset) {
                        debug!(url, offset, "nothing left to fetch");
                        return Ok(OpenedSource {
                            stream: futures_util::stream::empty::<Result<Bytes, TransferError>>()
                                .boxed(),
                            offset,
                            total_bytes: total,
                        });
                    }
                    return Err(classify_status(status));
                }
                s if s.is_success() => (0, resp.content_length()),
                s => return Err(classify_status(s)),
            };

            debug!(url, requested = offset, start, ?total_bytes, status = status.as_u16(), "opened http source");
            let stream = resp
                .bytes_stream()
                .map_err(|e| classify_error(&e))
                .boxed();
            Ok(OpenedSource {
                stream,
                offset: start,
                total_bytes,
            })
        })
    }

    fn supports_resume(&self) -> bool {
        true
    }
}

fn url_of(descriptor: &SourceDescriptor) -> Result<&str, TransferError> {
    match descriptor {
        SourceDescriptor::Url(url) => Ok(url.as_str()),
        other => Err(TransferError::SourceRejected(format!(
            "not an http source: {other}"
        ))),
    }
}

/// Maps a non-success status to the transfer taxonomy.
///
/// 408, 429, 500, 502, 503 and 504 mean the server is temporarily
/// unavailable; any other status is a refusal.
pub(crate) fn classify_status(status: StatusCode) -> TransferError {
    let message = format!("HTTP {status}");
    match status {
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => TransferError::SourceUnreachable(message),
        _ => TransferError::SourceRejected(message),
    }
}

/// Maps a `reqwest` failure. Bad URLs and redirect loops are refusals; the
/// rest (connect, timeout, body) are transport failures.
pub(crate) fn classify_error(err: &reqwest::Error) -> TransferError {
    if err.is_builder() || err.is_redirect() {
        TransferError::SourceRejected(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        TransferError::SourceUnreachable(err.to_string())
    }
}

fn header_u64(headers: &HeaderMap, name: HeaderName) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    /// `None` for the unsatisfied form `bytes */total`.
    start: Option<u64>,
    total: Option<u64>,
}

/// Parses `bytes 6-10/11`, `bytes 6-10/*` and `bytes */11`.
fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => {
            let (start, end) = r.split_once('-')?;
            let start: u64 = start.trim().parse().ok()?;
            let end: u64 = end.trim().parse().ok()?;
            if end < start {
                return None;
            }
            Some(start)
        }
    };
    Some(ContentRange { start, total })
}
