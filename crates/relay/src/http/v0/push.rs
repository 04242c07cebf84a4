use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::sync::{Cursor, EncryptedDelta};

use crate::client::ApiRequest;
use crate::http::Principal;
use crate::state::RelayState;
use crate::store::DeltaStore;

use super::V0Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub company_id: Uuid,
    pub deltas: Vec<EncryptedDelta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    /// Cursor assigned to the last delta in the batch
    pub cursor: Cursor,
}

pub async fn handler<S: DeltaStore>(
    State(state): State<RelayState<S>>,
    Principal(principal): Principal,
    Json(req): Json<PushRequest>,
) -> Result<impl IntoResponse, V0Error<S::Error>> {
    let cursor = state.push(principal, req.company_id, req.deltas).await?;
    Ok((http::StatusCode::OK, Json(PushResponse { cursor })).into_response())
}

// Client implementation - builds request for this operation
impl ApiRequest for PushRequest {
    type Response = PushResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        let full_url = base_url.join("/api/v0/sync/push").unwrap();
        client.post(full_url).json(&self)
    }
}
