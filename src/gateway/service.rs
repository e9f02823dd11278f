//! Per-request admission and dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, instrument, warn};

use super::forward::Forwarder;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{ClientKey, KeyExtractor, PacingPolicy, RateController};

/// Largest `POST /rate` body accepted.
const MAX_RATE_BODY: usize = 64;

/// State shared by every request handler.
#[derive(Clone)]
pub struct GatewayState {
    /// The adjustable ceiling and its limiter
    pub controller: Arc<RateController>,
    /// How requests are delayed before admission
    pub pacing: PacingPolicy,
    /// Where admitted requests go
    pub forwarder: Arc<dyn Forwarder>,
    /// How callers are identified
    pub extractor: Arc<dyn KeyExtractor>,
}

impl GatewayState {
    /// Create the shared state.
    pub fn new(
        controller: Arc<RateController>,
        pacing: PacingPolicy,
        forwarder: Arc<dyn Forwarder>,
        extractor: Arc<dyn KeyExtractor>,
    ) -> Self {
        Self {
            controller,
            pacing,
            forwarder,
            extractor,
        }
    }
}

/// Entry point for every inbound request.
pub async fn handle(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match dispatch(&state, peer, request).await {
        Ok(response) => response,
        Err(err) => {
            match err.status() {
                status if status.is_server_error() => warn!(error = %err, "Request failed"),
                _ => debug!(error = %err, "Request rejected"),
            }
            err.into_response()
        }
    }
}

/// Route a request to diagnostics, reconfiguration or admission.
#[instrument(
    skip(state, request),
    fields(method = %request.method(), path = %request.uri().path(), client)
)]
pub async fn dispatch(
    state: &GatewayState,
    peer: SocketAddr,
    request: Request<Body>,
) -> Result<Response> {
    let key = state.extractor.extract(&peer, request.headers());
    tracing::Span::current().record("client", tracing::field::display(&key));

    let path = request.uri().path();
    if request.method() == Method::GET && path.starts_with("/rem") {
        return remaining(state, &key).await;
    }
    if request.method() == Method::POST && path.starts_with("/rate") {
        return set_rate(state, request.into_body()).await;
    }

    admit_and_forward(state, &key, peer, request).await
}

/// Report what the caller has left and how long it would be paced.
async fn remaining(state: &GatewayState, key: &ClientKey) -> Result<Response> {
    let snapshot = state.controller.snapshot();
    let count = snapshot.limiter.count(key).await?;
    let wait = state.pacing.wait_for(&snapshot, count);
    let remaining = snapshot.ceiling.saturating_sub(count);

    Ok(format!("Remaining: {}, should sleep for {:?}\n", remaining, wait).into_response())
}

/// Replace the ceiling with the decimal integer in the request body.
async fn set_rate(state: &GatewayState, body: Body) -> Result<Response> {
    let bytes = to_bytes(body, MAX_RATE_BODY).await.map_err(|e| {
        GatewayError::InvalidArgument(format!("Error reading body from POST /rate: {}", e))
    })?;
    let raw = std::str::from_utf8(&bytes)
        .map_err(|e| GatewayError::InvalidArgument(format!("Body is not UTF-8: {}", e)))?;

    state.controller.set_ceiling_str(raw)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Pace the caller, then hand the request to the forwarder.
async fn admit_and_forward(
    state: &GatewayState,
    key: &ClientKey,
    peer: SocketAddr,
    request: Request<Body>,
) -> Result<Response> {
    let snapshot = state.controller.snapshot();
    let admission = state.pacing.admit(&snapshot, key).await?;

    info!(
        count = admission.count,
        ceiling = snapshot.ceiling,
        paced = ?admission.paced,
        retries = admission.retries,
        "Forwarding request"
    );

    state.forwarder.forward(request, peer.ip()).await
}
