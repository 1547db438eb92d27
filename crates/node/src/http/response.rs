//! Response bodies: sealed octets, file streams and server-sent events.

use std::convert::Infallible;
use std::io::Write;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures_util::{stream, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use warp::http::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, VARY};
use warp::hyper::Body;
use warp::reply::Response;
use warp::sse::Event;
use warp::Reply;

/// Bodies below this size are sent uncompressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// In-memory binary body, compressed when the client accepts an encoding
/// and the body is large enough to bother.
pub fn octets(bytes: Vec<u8>, accept_encoding: Option<&str>) -> Response {
    let encoding = accept_encoding
        .and_then(negotiate_encoding)
        .filter(|_| bytes.len() >= COMPRESSION_THRESHOLD);

    let (bytes, encoding) = match encoding.map(|e| (e, e.encode(&bytes))) {
        Some((encoding, Ok(encoded))) => (encoded, Some(encoding)),
        Some((_, Err(e))) => {
            tracing::debug!("Compression failed, sending identity: {}", e);
            (bytes, None)
        }
        None => (bytes, None),
    };

    let mut response = Response::new(Body::from(bytes));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
    if let Some(encoding) = encoding {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding.as_str()));
        headers.insert(VARY, HeaderValue::from_static("Accept-Encoding"));
    }
    response
}

/// `length` bytes from the current position of `file`, streamed.
pub fn file_body(file: tokio::fs::File, length: u64) -> Body {
    Body::wrap_stream(ReaderStream::new(file.take(length)))
}

/// Server-sent events, one `data:` field per item. A final `done` event
/// marks the end of the stream.
pub fn events(rx: mpsc::Receiver<String>) -> Response {
    let batches = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|data| (Ok::<_, Infallible>(Event::default().data(data)), rx))
    });
    let done = stream::once(async { Ok(Event::default().event("done").data("")) });
    warp::sse::reply(batches.chain(done)).into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }

    fn encode(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Encoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
                encoder.write_all(data)?;
                encoder.finish()
            }
            // HTTP "deflate" is the zlib format.
            Encoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
                encoder.write_all(data)?;
                encoder.finish()
            }
        }
    }
}

/// Pick gzip if acceptable, otherwise deflate. `q=0` excludes a coding.
pub fn negotiate_encoding(accept_encoding: &str) -> Option<Encoding> {
    let mut gzip = false;
    let mut deflate = false;
    for item in accept_encoding.split(',') {
        let mut parts = item.split(';');
        let coding = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let refused = parts.any(|p| {
            p.trim()
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q <= 0.0)
        });
        if refused {
            continue;
        }
        match coding.as_str() {
            "gzip" | "x-gzip" => gzip = true,
            "deflate" => deflate = true,
            "*" => {
                gzip = true;
                deflate = true;
            }
            _ => {}
        }
    }

    if gzip {
        Some(Encoding::Gzip)
    } else if deflate {
        Some(Encoding::Deflate)
    } else {
        None
    }
}
