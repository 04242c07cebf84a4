//! Device-side HTTP client
//!
//! [`HttpRelay`] implements the [`RelayTransport`] seam from the common
//! crate over the relay's v0 API, so a sync engine points at a real relay
//! the same way the testkit points at an in-memory one.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use common::crypto::PublicKey;
use common::keyring::KeyringBundle;
use common::sync::{Cursor, DeltaPage, EncryptedDelta, RelayError, RelayTransport};

use crate::http::v0::grants::{GrantsRequest, GrantsResponse};
use crate::http::v0::keyring::{GetKeyringRequest, PutKeyringRequest};
use crate::http::v0::pull::PullRequest;
use crate::http::v0::push::PushRequest;
use crate::http::PRINCIPAL_HEADER;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
    #[error("header error: {0}")]
    Header(String),
}

/// One API operation: request body plus where it goes
pub trait ApiRequest: Serialize {
    type Response: DeserializeOwned;

    fn build_request(self, base_url: &Url, client: &Client) -> RequestBuilder;
}

/// HTTP [`RelayTransport`] authenticated as one principal
#[derive(Debug, Clone)]
pub struct HttpRelay {
    remote: Url,
    client: Client,
    principal: PublicKey,
}

impl HttpRelay {
    pub fn new(remote: &Url, principal: PublicKey) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        default_headers.insert(
            PRINCIPAL_HEADER,
            HeaderValue::from_str(&principal.to_hex())
                .map_err(|e| ApiError::Header(e.to_string()))?,
        );
        let client = Client::builder().default_headers(default_headers).build()?;

        Ok(Self {
            remote: remote.clone(),
            client,
            principal,
        })
    }

    pub fn principal(&self) -> PublicKey {
        self.principal
    }

    pub fn base_url(&self) -> &Url {
        &self.remote
    }

    async fn call<T: ApiRequest>(&self, request: T) -> Result<T::Response, ApiError> {
        let request_builder = request.build_request(&self.remote, &self.client);
        let response = request_builder.send().await?;

        if response.status().is_success() {
            Ok(response.json::<T::Response>().await?)
        } else {
            Err(ApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }

    /// The relay's replayed grant windows for a company
    pub async fn grants(&self, company_id: Uuid) -> Result<GrantsResponse, ApiError> {
        self.call(GrantsRequest { company_id }).await
    }

    /// Classify a transport failure for the sync engine's retry logic
    fn relay_error(&self, company_id: Uuid, err: ApiError) -> RelayError<ApiError> {
        match err {
            ApiError::Reqwest(e) if e.is_connect() || e.is_timeout() => {
                RelayError::Unavailable(e.to_string())
            }
            ApiError::HttpStatus(StatusCode::FORBIDDEN, _) => {
                RelayError::NotGranted(self.principal, company_id)
            }
            ApiError::HttpStatus(status, msg) if status.is_server_error() => {
                RelayError::Unavailable(format!("{}: {}", status, msg))
            }
            other => RelayError::Provider(other),
        }
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    type Error = ApiError;

    async fn push(
        &self,
        company_id: Uuid,
        deltas: Vec<EncryptedDelta>,
    ) -> Result<Cursor, RelayError<Self::Error>> {
        let response = self
            .call(PushRequest { company_id, deltas })
            .await
            .map_err(|e| self.relay_error(company_id, e))?;
        Ok(response.cursor)
    }

    async fn pull(
        &self,
        company_id: Uuid,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<DeltaPage, RelayError<Self::Error>> {
        self.call(PullRequest {
            company_id,
            after,
            limit: Some(limit),
        })
        .await
        .map_err(|e| self.relay_error(company_id, e))
    }

    async fn put_keyring(
        &self,
        company_id: Uuid,
        bundle: KeyringBundle,
    ) -> Result<(), RelayError<Self::Error>> {
        self.call(PutKeyringRequest { company_id, bundle })
            .await
            .map_err(|e| self.relay_error(company_id, e))?;
        Ok(())
    }

    async fn get_keyring(
        &self,
        company_id: Uuid,
    ) -> Result<Option<KeyringBundle>, RelayError<Self::Error>> {
        let response = self
            .call(GetKeyringRequest { company_id })
            .await
            .map_err(|e| self.relay_error(company_id, e))?;
        Ok(response.bundle)
    }
}
