//! HTTP vector index client.
//!
//! `PUT {endpoint}/documents/{id}` with the document as JSON,
//! `DELETE {endpoint}/documents/{id}`. A 404 on delete means the document is
//! already gone.

use std::time::Duration;

use async_trait::async_trait;
use lakehouse_shared::{IndexDocument, LakehouseError, Metadata, Result};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crate::VectorIndex;

/// Default request timeout in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// User-Agent string for index requests.
const USER_AGENT: &str = concat!("lakehouse/", env!("CARGO_PKG_VERSION"));

/// Connection settings for [`HttpVectorIndex`].
#[derive(Debug, Clone)]
pub struct HttpIndexOptions {
    pub timeout: Duration,
    /// Sent as a bearer token when present.
    pub api_key: Option<String>,
}

impl Default for HttpIndexOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            api_key: None,
        }
    }
}

/// Wire body of an upsert.
#[derive(Serialize)]
struct UpsertBody<'a> {
    id: &'a str,
    content: &'a str,
    metadata: &'a Metadata,
    fingerprint: &'a str,
}

/// Vector index reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVectorIndex {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpVectorIndex {
    pub fn new(endpoint: Url, opts: HttpIndexOptions) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(opts.timeout)
            .build()
            .map_err(|e| LakehouseError::index("build client", e))?;

        Ok(Self {
            client,
            endpoint,
            api_key: opts.api_key,
        })
    }

    fn document_url(&self, id: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LakehouseError::config(format!("index endpoint cannot be a base URL: {}", self.endpoint))
            })?
            .pop_if_empty()
            .push("documents")
            .push(id);
        Ok(url)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    #[instrument(skip_all, fields(id = %document.id))]
    async fn upsert(&self, document: &IndexDocument) -> Result<()> {
        let url = self.document_url(&document.id)?;
        let body = UpsertBody {
            id: &document.id,
            content: &document.content,
            metadata: &document.metadata,
            fingerprint: &document.fingerprint,
        };

        let response = self
            .request(reqwest::Method::PUT, url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LakehouseError::index("upsert", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LakehouseError::index(
                "upsert",
                format!("{}: HTTP {status}", document.id),
            ));
        }

        debug!(%status, "document upserted");
        Ok(())
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.document_url(id)?;
        let response = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| LakehouseError::index("delete", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("document already absent");
            return Ok(());
        }
        if !status.is_success() {
            return Err(LakehouseError::index("delete", format!("{id}: HTTP {status}")));
        }

        debug!(%status, "document deleted");
        Ok(())
    }
}
