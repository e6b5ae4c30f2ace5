use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use crate::api::response::ApiError;
use crate::backend::ByteRange;
use crate::AppState;

/// Serve a version's content, honoring a single `Range: bytes=` header.
/// The backend holding the bytes is resolved per request through the
/// version's storage tag.
/// Route: GET /attachments/:id/versions/:version/content
pub async fn serve_content(
    State(state): State<Arc<AppState>>,
    Path((id, version)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let record = state.lifecycle.record(&id)?;
    let total = record
        .versions
        .get(&version)
        .map(|entry| entry.size)
        .ok_or_else(|| ApiError::not_found(format!("No version '{version}'")))?;

    let requested = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| parse_range(h, total));

    if let Some(range) = requested {
        if total == 0 || range.offset >= total {
            return Err(ApiError::range_not_satisfiable(format!(
                "range starts at {} but the content is {total} bytes",
                range.offset
            )));
        }
    }

    let download = state.lifecycle.open_download(&id, &version, requested).await?;

    let status = if requested.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let body = Body::from_stream(ReaderStream::new(download.reader));
    let mut response = (status, body).into_response();
    let headers = response.headers_mut();

    headers.insert(
        header::CONTENT_TYPE,
        download
            .content_type
            .parse()
            .unwrap_or(header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from(download.length),
    );
    headers.insert(
        header::ACCEPT_RANGES,
        header::HeaderValue::from_static("bytes"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(download.cache_control),
    );

    if requested.is_some() {
        let end = download.offset + download.length.saturating_sub(1);
        if let Ok(value) = format!("bytes {}-{end}/{}", download.offset, download.total_size).parse()
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }

    let filename: String = download
        .file_name
        .chars()
        .filter(|c| *c != '"' && !c.is_control())
        .collect();
    if let Ok(value) = format!("inline; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// Parse a single-span `Range` header against a known total size.
/// Multi-span and malformed headers yield `None`, which serves the full
/// content -- ignoring a bad Range is what HTTP prescribes.
fn parse_range(value: &str, total: u64) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    match (start.trim(), end.trim()) {
        // bytes=-N : the last N bytes
        ("", suffix) => {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            let n = n.min(total);
            Some(ByteRange::span(total - n, n))
        }
        // bytes=N- : from N to the end
        (start, "") => {
            let offset: u64 = start.parse().ok()?;
            Some(ByteRange::from(offset))
        }
        // bytes=A-B : inclusive span
        (start, end) => {
            let offset: u64 = start.parse().ok()?;
            let last: u64 = end.parse().ok()?;
            if last < offset {
                return None;
            }
            Some(ByteRange::span(offset, last - offset + 1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inclusive_span() {
        assert_eq!(parse_range("bytes=0-9", 100), Some(ByteRange::span(0, 10)));
        assert_eq!(parse_range("bytes=5-5", 100), Some(ByteRange::span(5, 1)));
    }

    #[test]
    fn parses_open_and_suffix_forms() {
        assert_eq!(parse_range("bytes=10-", 100), Some(ByteRange::from(10)));
        assert_eq!(parse_range("bytes=-25", 100), Some(ByteRange::span(75, 25)));
        // Suffix longer than the content clamps to the whole thing
        assert_eq!(parse_range("bytes=-500", 100), Some(ByteRange::span(0, 100)));
    }

    #[test]
    fn rejects_malformed_and_multi_span() {
        assert_eq!(parse_range("bytes=9-0", 100), None);
        assert_eq!(parse_range("bytes=0-4,10-14", 100), None);
        assert_eq!(parse_range("items=0-4", 100), None);
        assert_eq!(parse_range("bytes=abc-", 100), None);
        assert_eq!(parse_range("bytes=-0", 100), None);
    }
}
