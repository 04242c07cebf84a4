//! HTTP surface of the relay
//!
//! `/_status` readiness plus the `/api/v0` sync routes. Callers identify
//! themselves with the `x-tally-principal` header (hex public key); the
//! relay uses it only to select grant windows, it grants no trust.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Router;
use http::header::{HeaderName, ACCEPT, CONTENT_TYPE, ORIGIN};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod health;
pub mod v0;

use common::crypto::PublicKey;

use crate::state::RelayState;
use crate::store::DeltaStore;

pub const API_PREFIX: &str = "/api/v0";
pub const STATUS_PREFIX: &str = "/_status";

/// Header naming the calling principal (hex-encoded public key)
pub const PRINCIPAL_HEADER: &str = "x-tally-principal";

/// Extractor for the calling principal
#[derive(Debug, Clone, Copy)]
pub struct Principal(pub PublicKey);

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or((
                StatusCode::UNAUTHORIZED,
                format!("missing {} header", PRINCIPAL_HEADER),
            ))?;
        let key = PublicKey::from_hex(value).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("invalid {} header: {}", PRINCIPAL_HEADER, e),
            )
        })?;
        Ok(Principal(key))
    }
}

/// Assemble the full relay router
pub fn build_router<S: DeltaStore>(state: RelayState<S>) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_methods(vec![Method::GET, Method::POST])
        .allow_headers(vec![
            ACCEPT,
            ORIGIN,
            CONTENT_TYPE,
            HeaderName::from_static(PRINCIPAL_HEADER),
        ])
        .allow_origin(Any)
        .allow_credentials(false);

    let trace_layer = TraceLayer::new_for_http();

    Router::new()
        .nest(STATUS_PREFIX, health::router())
        .nest(API_PREFIX, v0::router())
        .with_state(state)
        .layer(cors_layer)
        .layer(trace_layer)
}
