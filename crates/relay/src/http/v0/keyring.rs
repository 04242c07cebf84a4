//! Keyring bundle storage
//!
//! Bundles carry only public and wrapped material, so the relay stores the
//! latest one per company and hands it to any caller that can name the
//! company. Whether a device can open anything inside is decided by the
//! keys it holds, never here.

use axum::extract::{Json, State};
use axum::response::IntoResponse;
use reqwest::{Client, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::keyring::KeyringBundle;

use crate::client::ApiRequest;
use crate::state::RelayState;
use crate::store::DeltaStore;

use super::V0Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutKeyringRequest {
    pub company_id: Uuid,
    pub bundle: KeyringBundle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutKeyringResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyringRequest {
    pub company_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetKeyringResponse {
    pub bundle: Option<KeyringBundle>,
}

pub async fn put_handler<S: DeltaStore>(
    State(state): State<RelayState<S>>,
    Json(req): Json<PutKeyringRequest>,
) -> Result<impl IntoResponse, V0Error<S::Error>> {
    state.put_keyring(req.company_id, req.bundle).await?;
    Ok((http::StatusCode::OK, Json(PutKeyringResponse {})).into_response())
}

pub async fn get_handler<S: DeltaStore>(
    State(state): State<RelayState<S>>,
    Json(req): Json<GetKeyringRequest>,
) -> Result<impl IntoResponse, V0Error<S::Error>> {
    let bundle = state.get_keyring(req.company_id).await?;
    Ok((http::StatusCode::OK, Json(GetKeyringResponse { bundle })).into_response())
}

// Client implementations - build requests for these operations
impl ApiRequest for PutKeyringRequest {
    type Response = PutKeyringResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        let full_url = base_url.join("/api/v0/keyring/put").unwrap();
        client.post(full_url).json(&self)
    }
}

impl ApiRequest for GetKeyringRequest {
    type Response = GetKeyringResponse;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder {
        let full_url = base_url.join("/api/v0/keyring/get").unwrap();
        client.post(full_url).json(&self)
    }
}
