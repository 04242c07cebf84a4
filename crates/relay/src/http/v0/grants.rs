//! Grant window inspection
//!
//! Read-only view of what the relay has replayed from ledger deltas; the
//! authoritative grant history lives in the replicated access ledger.

use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::record::Epoch;

use crate::client::ApiRequest;
use crate::state::RelayState;
use crate::store::DeltaStore;

use super::V0Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantsRequest {
    pub company_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantsResponse {
    pub windows: Vec<GrantWindowInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantWindowInfo {
    /// Hex-encoded principal public key
    pub principal: String,
    pub from_epoch: Epoch,
    pub revoked: bool,
}

pub async fn handler<S: DeltaStore>(
    State(state): State<RelayState<S>>,
    Json(req): Json<GrantsRequest>,
) -> Result<impl IntoResponse, V0Error<S::Error>> {
    let windows = state
        .grant_windows(req.company_id)
        .await?
        .into_iter()
        .map(|(principal, window)| GrantWindowInfo {
            principal,
            from_epoch: window.from_epoch,
            revoked: window.revoked,
        })
        .collect();
    Ok((http::StatusCode::OK, Json(GrantsResponse { windows })).into_response())
}

// Client implementation - builds request for this operation
impl ApiRequest for GrantsRequest {
    type Response = GrantsResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        let full_url = base_url.join("/api/v0/grants/ls").unwrap();
        client.post(full_url).json(&self)
    }
}
