use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::blob::{blob_id, BlobRegistry};
use crate::error::MediaSDKError;

use super::config::BlobServerConfig;

type ResponseBody = BoxBody<Bytes, Infallible>;

const BLOB_PATH: &str = "/blob/";

struct RunningServer {
    addr: SocketAddr,
    cancel: CancellationToken,
}

/// Serves the blobs of a registry over loopback HTTP, for players that only take `http:` URLs.
/// Range requests are honored so video players can seek.
#[derive(uniffi::Object)]
pub struct BlobServer {
    registry: Arc<BlobRegistry>,
    configuration: BlobServerConfig,
    running: Mutex<Option<RunningServer>>,
}

#[uniffi::export(async_runtime = "tokio")]
impl BlobServer {
    #[uniffi::constructor]
    pub fn new(registry: Arc<BlobRegistry>, configuration: BlobServerConfig) -> Self {
        Self {
            registry,
            configuration,
            running: Mutex::new(None),
        }
    }

    /// Binds and starts accepting in the background. Returns the base URL, also when the
    /// server was already running.
    pub async fn start(&self) -> Result<String, MediaSDKError> {
        if let Some(addr) = self.local_addr() {
            return Ok(base_url(addr));
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.configuration.port));
        let listener = TcpListener::bind(&addr).await?;
        let addr = listener.local_addr()?;
        let cancel = CancellationToken::new();

        {
            let mut running = self.lock();
            // Lost a race against another start
            if let Some(existing) = running.as_ref() {
                return Ok(base_url(existing.addr));
            }
            *running = Some(RunningServer { addr, cancel: cancel.clone() });
        }

        let limit = match self.configuration.max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n.min(Semaphore::MAX_PERMITS as u64) as usize))),
        };
        tokio::spawn(accept_loop(listener, self.registry.clone(), limit, cancel));

        info!(%addr, "Blob server listening");
        Ok(base_url(addr))
    }

    pub fn stop(&self) {
        if let Some(server) = self.lock().take() {
            server.cancel.cancel();
            info!(addr = %server.addr, "Blob server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// The loopback URL of a `blob:` URL. `None` while stopped or for foreign URLs.
    pub fn http_url(&self, blob_url: String) -> Option<String> {
        let addr = self.local_addr()?;
        let id = blob_id(&blob_url)?;
        Some(format!("{}{}{}", base_url(addr), BLOB_PATH, id))
    }
}

impl BlobServer {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().map(|server| server.addr)
    }

    fn lock(&self) -> MutexGuard<'_, Option<RunningServer>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for BlobServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<BlobRegistry>,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) {
    loop {
        let permit = match &limit {
            Some(limit) => tokio::select! {
                _ = cancel.cancelled() => return,
                permit = limit.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
            },
            None => None,
        };

        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let registry = registry.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let connection = http1::Builder::new().serve_connection(
                io,
                service_fn(move |req| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(serve_blob(&registry, &req)) }
                }),
            );

            tokio::select! {
                _ = cancel.cancelled() => {}
                result = connection => {
                    if let Err(err) = result {
                        error!(%peer, error = %err, "Error serving connection");
                    }
                }
            }
        });
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ByteRange {
    Full,
    /// Inclusive bounds, as in `Content-Range`.
    Partial(u64, u64),
    Unsatisfiable,
}

/// Parses a single `bytes=` range. Multiple ranges and other units are answered with the whole
/// body, which the header semantics allow.
fn parse_range(header: Option<&str>, size: u64) -> ByteRange {
    let Some(ranges) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if ranges.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = ranges.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        // Suffix form: the last n bytes
        return match end.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(_) if size == 0 => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial(size.saturating_sub(n), size - 1),
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    let end = match end {
        "" => size - 1,
        end => match end.parse::<u64>() {
            Ok(end) if end < start => return ByteRange::Full,
            Ok(end) => end.min(size - 1),
            Err(_) => return ByteRange::Full,
        },
    };
    ByteRange::Partial(start, end)
}

fn serve_blob<B>(registry: &BlobRegistry, req: &Request<B>) -> Response<ResponseBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let Some(blob) = req
        .uri()
        .path()
        .strip_prefix(BLOB_PATH)
        .and_then(|id| registry.get_by_id(id))
    else {
        debug!(path = req.uri().path(), "No blob for request");
        return status_response(StatusCode::NOT_FOUND);
    };

    let size = blob.data.len() as u64;
    let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
    let mime_type = blob.mime_type.as_deref().unwrap_or("application/octet-stream");

    let builder = Response::builder()
        .header(CONTENT_TYPE, mime_type)
        .header(ACCEPT_RANGES, "bytes");

    let (builder, data) = match parse_range(range, size) {
        ByteRange::Full => (builder.status(StatusCode::OK), blob.data),
        ByteRange::Partial(start, end) => (
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, size)),
            blob.data.slice(start as usize..=end as usize),
        ),
        ByteRange::Unsatisfiable => {
            let builder = builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(CONTENT_RANGE, format!("bytes */{}", size));
            return finish(builder, empty_body());
        }
    };

    let builder = builder.header(CONTENT_LENGTH, data.len());
    let body = if req.method() == Method::HEAD {
        empty_body()
    } else {
        Full::new(data).boxed()
    };
    finish(builder, body)
}

fn empty_body() -> ResponseBody {
    Empty::<Bytes>::new().boxed()
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

fn finish(builder: hyper::http::response::Builder, body: ResponseBody) -> Response<ResponseBody> {
    builder.body(body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to build response");
        status_response(StatusCode::INTERNAL_SERVER_ERROR)
    })
}
