use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::sync::{Cursor, DeltaPage};

use crate::client::ApiRequest;
use crate::http::Principal;
use crate::state::RelayState;
use crate::store::DeltaStore;

use super::V0Error;

/// Hard cap on page size regardless of what the client asks for
pub const MAX_PAGE_SIZE: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub company_id: Uuid,

    /// Last cursor the caller has fully applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Cursor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

pub type PullResponse = DeltaPage;

pub async fn handler<S: DeltaStore>(
    State(state): State<RelayState<S>>,
    Principal(principal): Principal,
    Json(req): Json<PullRequest>,
) -> Result<impl IntoResponse, V0Error<S::Error>> {
    let limit = req.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let page = state
        .pull(principal, req.company_id, req.after, limit)
        .await?;
    Ok((http::StatusCode::OK, Json(page)).into_response())
}

// Client implementation - builds request for this operation
impl ApiRequest for PullRequest {
    type Response = PullResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        let full_url = base_url.join("/api/v0/sync/pull").unwrap();
        client.post(full_url).json(&self)
    }
}
