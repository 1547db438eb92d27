//! Embedded HTTP server for file streaming and small queries.
//!
//! Endpoints:
//!
//! | Method | Path                  | Response                                   |
//! |--------|-----------------------|--------------------------------------------|
//! | GET    | `/ping`               | sealed device identity (no auth)           |
//! | GET    | `/api/bookmarks`      | sealed bookmark list                       |
//! | POST   | `/api/paths/list`     | sealed directory listing                   |
//! | POST   | `/api/paths/rootPaths`| sealed root path entries                   |
//! | POST   | `/api/paths/traverse` | `text/event-stream` of sealed batches      |
//! | GET    | `/api/files?path=`    | file bytes, honouring `Range`              |
//!
//! "Sealed" bodies are MessagePack encrypted with the node's payload cipher.
//! Every endpoint except `/ping` needs a token, from `Authorization: Bearer`
//! or `?token=`, and is checked against the permission layer.

mod error;
mod filters;
mod handlers;
mod range;
mod response;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use protocol::PayloadCipher;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::services::Services;
use filters::{path_body, query, token, with_state};

pub use error::HttpError;
pub use range::{parse_range_header, RangeSpec};
pub use response::{negotiate_encoding, Encoding};

/// How long `stop` waits for in-flight responses before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What request handlers need.
pub struct HttpState {
    pub services: Services,
    pub cipher: PayloadCipher,
}

/// Every endpoint, with leftover rejections turned into status responses.
pub fn routes(state: Arc<HttpState>) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let accept_encoding = || warp::header::optional::<String>("accept-encoding");

    let ping = warp::path!("ping")
        .and(warp::get())
        .and(with_state(state.clone()))
        .then(handlers::ping);

    let bookmarks = warp::path!("api" / "bookmarks")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and(token())
        .and(accept_encoding())
        .then(handlers::bookmarks);

    let root_paths = warp::path!("api" / "paths" / "rootPaths")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(token())
        .and(path_body())
        .and(accept_encoding())
        .then(handlers::root_paths);

    let list = warp::path!("api" / "paths" / "list")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(token())
        .and(path_body())
        .and(accept_encoding())
        .then(handlers::list);

    let traverse = warp::path!("api" / "paths" / "traverse")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(token())
        .and(path_body())
        .then(handlers::traverse);

    let files = warp::path!("api" / "files")
        .and(warp::get())
        .and(with_state(state))
        .and(token())
        .and(query())
        .and(warp::header::optional::<String>("range"))
        .and(accept_encoding())
        .then(handlers::file);

    ping.or(bookmarks)
        .unify()
        .or(root_paths)
        .unify()
        .or(list)
        .unify()
        .or(traverse)
        .unify()
        .or(files)
        .unify()
        .map(respond)
        .recover(recover)
        .unify()
        .with(warp::trace::request())
}

fn respond(result: Result<Response, HttpError>) -> Response {
    result.unwrap_or_else(|e| {
        debug!(status = %e.status(), "Request failed: {}", e);
        e.into_response()
    })
}

async fn recover(rejection: Rejection) -> Result<Response, Infallible> {
    let error = HttpError::from_rejection(&rejection);
    debug!(status = %error.status(), "Request rejected: {}", error);
    Ok(error.into_response())
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// The HTTP server. Its owner decides when it runs.
pub struct HttpServer {
    bind: SocketAddr,
    state: Arc<HttpState>,
    running: Mutex<Option<Running>>,
}

impl HttpServer {
    pub fn new(bind: SocketAddr, services: Services, cipher: PayloadCipher) -> Self {
        Self {
            bind,
            state: Arc::new(HttpState { services, cipher }),
            running: Mutex::new(None),
        }
    }

    /// Bind and start serving. Calling it again while running returns the
    /// address already bound.
    pub async fn start(&self) -> Result<SocketAddr, warp::Error> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.addr);
        }

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let (addr, server) = warp::serve(routes(self.state.clone()))
            .try_bind_with_graceful_shutdown(self.bind, async move { shutdown.cancelled().await })?;
        let task = tokio::spawn(server);
        info!(%addr, "HTTP server listening");

        *running = Some(Running { addr, cancel, task });
        Ok(addr)
    }

    /// Stop serving. Responses still streaming after a short grace period
    /// are cut off. No-op when stopped.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };
        running.cancel.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut running.task).await.is_err() {
            warn!(addr = %running.addr, "HTTP connections still open, aborting");
            running.task.abort();
        }
        info!(addr = %running.addr, "HTTP server stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}
