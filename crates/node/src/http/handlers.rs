//! Endpoint handlers.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use protocol::SealedIdentity;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use warp::http::header::{HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::reply::Response;

use super::filters::PathQuery;
use super::range::{content_range, parse_range_header};
use super::response::{self, negotiate_encoding, COMPRESSION_THRESHOLD, OCTET_STREAM};
use super::{HttpError, HttpState};

/// Full-file responses up to this size are buffered so they can be
/// compressed; larger ones are streamed as-is.
const COMPRESSIBLE_FILE_LIMIT: u64 = 4 * 1024 * 1024;

/// Server-sent events buffered ahead of a slow client.
const EVENT_QUEUE_DEPTH: usize = 4;

fn sealed<T: serde::Serialize>(
    state: &HttpState,
    value: &T,
    accept_encoding: Option<&str>,
) -> Result<Response, HttpError> {
    Ok(response::octets(state.cipher.seal(value)?, accept_encoding))
}

pub async fn ping(state: Arc<HttpState>) -> Result<Response, HttpError> {
    let identity = state.services.device.info().identity;
    let sealed = SealedIdentity::seal(&identity, &state.cipher)?;
    Ok(response::octets(sealed.0, None))
}

pub async fn bookmarks(
    state: Arc<HttpState>,
    token: String,
    accept_encoding: Option<String>,
) -> Result<Response, HttpError> {
    let bookmarks = state.services.bookmark.get_bookmarks(&token);
    sealed(&state, &bookmarks, accept_encoding.as_deref())
}

pub async fn root_paths(
    state: Arc<HttpState>,
    token: String,
    _body: PathQuery,
    accept_encoding: Option<String>,
) -> Result<Response, HttpError> {
    let roots = state.services.path.get_root_paths(&token);
    sealed(&state, &roots, accept_encoding.as_deref())
}

pub async fn list(
    state: Arc<HttpState>,
    token: String,
    body: PathQuery,
    accept_encoding: Option<String>,
) -> Result<Response, HttpError> {
    let entries = state.services.path.get_list(&token, &body.path)?;
    sealed(&state, &entries, accept_encoding.as_deref())
}

pub async fn traverse(
    state: Arc<HttpState>,
    token: String,
    body: PathQuery,
) -> Result<Response, HttpError> {
    let mut batches = state.services.path.traverse(&token, &body.path)?;
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let cipher = state.cipher.clone();

    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            let event = rmp_serde::to_vec_named(&batch)
                .map_err(protocol::ProtocolError::from)
                .and_then(|bytes| cipher.encrypt_to_base64(&bytes));
            match event {
                Ok(data) => {
                    if tx.send(data).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping traverse event: {}", e);
                }
            }
        }
    });

    Ok(response::events(rx))
}

pub async fn file(
    state: Arc<HttpState>,
    token: String,
    query: HashMap<String, String>,
    range: Option<String>,
    accept_encoding: Option<String>,
) -> Result<Response, HttpError> {
    let requested = query
        .get("path")
        .ok_or_else(|| HttpError::BadRequest("missing path parameter".to_string()))?;
    let (path, total) = state.services.file.readable_file(&token, requested)?;
    let mut file = tokio::fs::File::open(&path).await?;

    if let Some(spec) = range.as_deref().and_then(parse_range_header) {
        let (first, last) = spec
            .resolve(total)
            .ok_or(HttpError::RangeNotSatisfiable { total })?;
        file.seek(SeekFrom::Start(first)).await?;
        tracing::debug!(?path, first, last, total, "Serving range");

        let length = last - first + 1;
        let mut response = Response::new(response::file_body(file, length));
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let content_range = HeaderValue::from_str(&content_range(first, last, total))
            .map_err(|e| HttpError::Internal(e.to_string()))?;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        headers.insert(CONTENT_RANGE, content_range);
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        return Ok(response);
    }

    let compressible = accept_encoding
        .as_deref()
        .and_then(negotiate_encoding)
        .is_some()
        && (COMPRESSION_THRESHOLD as u64..=COMPRESSIBLE_FILE_LIMIT).contains(&total);
    let mut response = if compressible {
        let mut bytes = Vec::with_capacity(total as usize);
        file.read_to_end(&mut bytes).await?;
        response::octets(bytes, accept_encoding.as_deref())
    } else {
        let mut response = Response::new(response::file_body(file, total));
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
        response
    };
    response
        .headers_mut()
        .insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}
