use std::fmt::{Debug, Display};

use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

pub mod grants;
pub mod keyring;
pub mod pull;
pub mod push;

use crate::state::{RelayState, RelayStateError};
use crate::store::DeltaStore;

pub fn router<S: DeltaStore>() -> Router<RelayState<S>> {
    Router::new()
        .route("/sync/push", post(push::handler::<S>))
        .route("/sync/pull", post(pull::handler::<S>))
        .route("/keyring/put", post(keyring::put_handler::<S>))
        .route("/keyring/get", post(keyring::get_handler::<S>))
        .route("/grants/ls", post(grants::handler::<S>))
}

/// Common error surface of the v0 handlers
#[derive(Debug, thiserror::Error)]
pub enum V0Error<T: Display + Debug> {
    #[error(transparent)]
    Relay(#[from] RelayStateError<T>),
}

impl<T: Display + Debug> IntoResponse for V0Error<T> {
    fn into_response(self) -> Response {
        match self {
            V0Error::Relay(RelayStateError::NotGranted(principal, company)) => (
                http::StatusCode::FORBIDDEN,
                format!("principal {} is not granted on company {}", principal, company),
            )
                .into_response(),
            V0Error::Relay(RelayStateError::Store(e)) => {
                tracing::error!(error = %e, "delta store failure");
                (
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected error".to_string(),
                )
                    .into_response()
            }
        }
    }
}
