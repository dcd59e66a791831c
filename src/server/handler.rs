// Axum request handlers: translate HTTP range reads into progressive cache reads.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::engine::streamer::{ByteRange, StreamResponse, Streamer};
use crate::error::CacheError;

pub type AppState = Arc<Streamer>;

pub struct ProxyServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ProxyServer {
    /// Bind `addr` (port 0 picks a free one) and serve in the background.
    pub async fn start(addr: SocketAddr, streamer: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(streamer);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                error!("proxy server stopped: {}", e);
            }
        });

        info!("cache proxy listening on {}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Build a URL for reading a specific object.
    pub fn url_for_object(&self, id: &str) -> String {
        format!("http://127.0.0.1:{}/object/{}", self.port(), id)
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn router(streamer: AppState) -> Router {
    Router::new()
        .route(
            "/object/{id}",
            get(stream_handler)
                .head(head_handler)
                .options(preflight_handler),
        )
        // Legacy player path.
        .route(
            "/video/{id}",
            get(stream_handler)
                .head(head_handler)
                .options(preflight_handler),
        )
        .route("/stats", get(stats_handler))
        .layer(middleware::from_fn(cors_headers))
        .with_state(streamer)
}

/// Parse a single-range `Range` value: `bytes=a-b`, `bytes=a-` or `bytes=-n`.
/// Anything else (multiple ranges, other units, garbage) yields `None`.
pub fn parse_range_header(value: &str) -> Option<ByteRange> {
    let (first, last) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        return match last.parse::<u64>().ok()? {
            0 => None,
            len => Some(ByteRange::Suffix { len }),
        };
    }
    let end_inclusive = match last {
        "" => None,
        n => Some(n.parse::<u64>().ok()?),
    };
    Some(ByteRange::StartEnd {
        start: first.parse().ok()?,
        end_inclusive,
    })
}

/// Range to serve for a request, applying the missing-header policy.
/// `Err` carries the response to send instead.
fn requested_range(
    streamer: &Streamer,
    headers: &HeaderMap,
) -> Result<Option<ByteRange>, Response> {
    match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        // Unparseable ranges are ignored and the full object is served.
        Some(raw) => Ok(parse_range_header(raw)),
        None if streamer.config().require_range => {
            Err((StatusCode::BAD_REQUEST, "range header required").into_response())
        }
        None if streamer.config().default_open_range => Ok(Some(ByteRange::StartEnd {
            start: 0,
            end_inclusive: None,
        })),
        None => Ok(None),
    }
}

fn error_response(id: &str, e: CacheError) -> Response {
    let status = e.status_code();
    if status.is_server_error() {
        error!("read of {} failed: {}", id, e);
    } else {
        debug!("read of {} rejected: {}", id, e);
    }
    let mut resp = (status, e.to_string()).into_response();
    if let CacheError::RangeNotSatisfiable { size } = e {
        if let Ok(v) = HeaderValue::from_str(&format!("bytes */{}", size)) {
            resp.headers_mut().insert(header::CONTENT_RANGE, v);
        }
    }
    resp
}

fn content_headers(content_type: &str, len: u64, content_range: Option<String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(range) = content_range.and_then(|r| HeaderValue::from_str(&r).ok()) {
        headers.insert(header::CONTENT_RANGE, range);
    }
    headers
}

fn into_body(resp: StreamResponse) -> Body {
    let stream = futures_util::stream::unfold(resp.body, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Body::from_stream(stream)
}

/// GET /object/{id}: serve content with Range support.
async fn stream_handler(
    State(streamer): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = match requested_range(&streamer, &headers) {
        Ok(range) => range,
        Err(resp) => return resp,
    };
    debug!("read request id={} range={:?}", id, range);

    match streamer.open(&id, range).await {
        Ok(resp) => {
            let (status, content_range) = if resp.partial {
                (StatusCode::PARTIAL_CONTENT, Some(resp.content_range()))
            } else {
                (StatusCode::OK, None)
            };
            let resp_headers = content_headers(&resp.meta.content_type, resp.len, content_range);
            (status, resp_headers, into_body(resp)).into_response()
        }
        Err(e) => error_response(&id, e),
    }
}

/// HEAD /object/{id}: headers only, never starts a download.
async fn head_handler(
    State(streamer): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = match requested_range(&streamer, &headers) {
        Ok(range) => range,
        Err(resp) => return resp,
    };
    let meta = match streamer.metadata(&id).await {
        Ok(meta) => meta,
        Err(e) => return error_response(&id, e),
    };

    match range.map(|r| r.resolve(meta.size)) {
        None => (
            StatusCode::OK,
            content_headers(&meta.content_type, meta.size, None),
        )
            .into_response(),
        Some(Ok((start, end))) => {
            let content_range = format!("bytes {}-{}/{}", start, end, meta.size);
            (
                StatusCode::PARTIAL_CONTENT,
                content_headers(&meta.content_type, end - start + 1, Some(content_range)),
            )
                .into_response()
        }
        Some(Err(e)) => error_response(&id, e),
    }
}

async fn preflight_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// GET /stats: live counters as JSON.
async fn stats_handler(State(streamer): State<AppState>) -> impl IntoResponse {
    Json(streamer.snapshot())
}

/// Open CORS policy so a browser player on any origin can read ranges.
async fn cors_headers(req: Request, next: Next) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("content-range, content-length, accept-ranges"),
    );
    if preflight {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, HEAD, OPTIONS"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("range"),
        );
    }
    resp
}
