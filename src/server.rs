//! HTTP endpoints: still capture and MJPEG stream.
//!
//! - `GET /capture`: one full-resolution JPEG
//! - `GET /stream.mjpg`: `multipart/x-mixed-replace` live stream
//!
//! Every request, including unknown paths, must carry a valid
//! `X-Interservice-Authentication-Token` header or gets a bare 401.

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{AGE, CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{Bytes, BytesMut};
use flume::Sender;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::auth::{Verifier, AUTH_HEADER};
use crate::capture::{CaptureGate, Frame};
use crate::relay::{Relay, WaitOutcome};

/// Multipart boundary between stream parts
pub const BOUNDARY: &str = "FRAME";

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// Shared by every request handler
#[derive(Clone)]
pub struct AppState {
    relay: Relay,
    gate: CaptureGate,
    verifier: Arc<Verifier>,
    wait_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        relay: Relay,
        gate: CaptureGate,
        verifier: Verifier,
        wait_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            relay,
            gate,
            verifier: Arc::new(verifier),
            wait_timeout,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/capture", get(capture))
        .route("/stream.mjpg", get(stream))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_token))
        .with_state(state)
}

/// Serve until `shutdown` resolves; open streams end when the state's
/// shutdown flag flips.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok());

    if !state.verifier.verify(token) {
        metrics::counter!("hermes_auth_failures_total").increment(1);
        debug!(path = %request.uri().path(), "Rejected unauthenticated request");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

/// GET /capture: one still, 500 with the device error on failure
async fn capture(State(state): State<AppState>) -> Response {
    match state.gate.capture_still().await {
        Ok(frame) => ([(CONTENT_TYPE, "image/jpeg")], frame.data).into_response(),
        Err(e) => {
            error!("Still capture failed: {}", e);
            e.into_response()
        }
    }
}

/// GET /stream.mjpg: multipart stream fed from the relay
async fn stream(State(state): State<AppState>) -> Response {
    let client = NEXT_CLIENT.fetch_add(1, Ordering::Relaxed);
    info!(client, "Streaming client connected");

    // Capacity 1: at most one encoded part waits on a slow socket, anything
    // newer is picked up from the relay once it drains.
    let (parts, body) = flume::bounded::<Result<Bytes, Infallible>>(1);
    tokio::spawn(pump(
        state.relay.clone(),
        parts,
        state.wait_timeout,
        state.shutdown.clone(),
        client,
    ));

    (
        StatusCode::OK,
        [
            (AGE, "0"),
            (CACHE_CONTROL, "no-cache, private"),
            (PRAGMA, "no-cache"),
            (CONTENT_TYPE, "multipart/x-mixed-replace; boundary=FRAME"),
        ],
        Body::from_stream(body.into_stream()),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Per-connection loop: wait on the relay, write the part, repeat.
///
/// A failed send means the response body was dropped, i.e. the client went
/// away. Relay timeouts only trigger a liveness check.
async fn pump(
    relay: Relay,
    parts: Sender<Result<Bytes, Infallible>>,
    wait_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
    client: u64,
) {
    metrics::gauge!("hermes_stream_clients").increment(1.0);
    let mut last_seen = 0;

    loop {
        let outcome = tokio::select! {
            outcome = relay.wait_next(last_seen, wait_timeout) => outcome,
            Ok(_) = shutdown.wait_for(|stop| *stop) => {
                debug!(client, "Closing stream for shutdown");
                break;
            }
        };

        match outcome {
            WaitOutcome::Frame { sequence, frame } => {
                if sequence > last_seen + 1 && last_seen != 0 {
                    trace!(client, skipped = sequence - last_seen - 1, "client skipped frames");
                }
                last_seen = sequence;
                if parts.send_async(Ok(encode_part(&frame))).await.is_err() {
                    warn!(client, "Removed streaming client: connection closed");
                    break;
                }
            }
            WaitOutcome::Timeout => {
                if parts.is_disconnected() {
                    warn!(client, "Removed streaming client: connection closed while idle");
                    break;
                }
                trace!(client, "No new frame, connection still open");
            }
        }
    }

    metrics::gauge!("hermes_stream_clients").decrement(1.0);
}

/// One multipart section: boundary, part headers, JPEG, trailing CRLF.
pub fn encode_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(&frame.data);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}
