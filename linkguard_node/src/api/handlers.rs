// API handlers for the public listener
//
// Ingest, public key distribution and liveness.

use crate::api::middleware::{check_origin, SourceIp};
use crate::api::AppState;
use crate::error::{LinkGuardError, Result};
use crate::types::Signal;
use axum::{
    body::Bytes,
    extract::{Extension, Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Ingest one encrypted signal.
///
/// Checks run cheapest first: origin, source IP, rate limit, then RSA
/// decryption and the claim HMAC. Only a fully verified claim reaches the
/// merger. Success is an empty `200`.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Extension(SourceIp(source_ip)): Extension<SourceIp>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    check_origin(&headers, &state.allowed_origins).map_err(|e| {
        warn!("Rejected ingest: origin not allowed");
        e
    })?;

    let ip = source_ip.ok_or_else(|| {
        warn!("Rejected ingest: no source IP in request headers");
        LinkGuardError::InvalidRequest("Missing source IP".to_string())
    })?;

    state.rate_limiter.check(ip)?;

    let decryptor = state.decryptor.clone();
    let claim = tokio::task::spawn_blocking(move || decryptor.decrypt(&body))
        .await?
        .map_err(|e| {
            warn!("Rejected ingest from {}: undecryptable payload", ip);
            e
        })?;

    state.verifier.verify(&claim.id, &claim.hash).map_err(|e| {
        warn!("Rejected ingest from {}: claim hash did not verify", ip);
        e
    })?;

    let signal = Signal::from_claim(claim, ip);

    // The merge runs on its own task so a request timeout cannot abandon it
    // between finding matches and applying the write
    let merger = state.merger.clone();
    let outcome = tokio::spawn(async move { merger.ingest(&signal).await }).await??;
    debug!("Ingest from {} landed in cluster {}", ip, outcome.cluster_id());

    Ok(StatusCode::OK)
}

/// Public key handler. The PEM is returned as a JSON string.
pub async fn public_key(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.keys.public_key_pem().to_string())
}

/// Health check handler
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
