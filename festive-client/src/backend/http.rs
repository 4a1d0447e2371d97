//! PocketBase REST client

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ListQuery, RecordBackend};
use crate::{ClientConfig, ClientError, ClientResult};

/// Page size for full-list fetches
const PER_PAGE: u32 = 200;

/// One page of `GET /api/collections/{c}/records`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordPage {
    page: u32,
    total_pages: u32,
    items: Vec<Value>,
}

/// HTTP client for the PocketBase record API
#[derive(Debug, Clone)]
pub struct PocketBaseClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl PocketBaseClient {
    /// Create a new client from configuration
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    /// Set the authentication token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> ClientResult<T> {
        let response = self.authorize(request).send().await?;
        Self::handle_response(response).await
    }

    /// Map non-success statuses to client errors
    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> ClientResult<T> {
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            return match status {
                StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized),
                StatusCode::FORBIDDEN => Err(ClientError::Forbidden(text)),
                StatusCode::NOT_FOUND => Err(ClientError::NotFound(text)),
                StatusCode::BAD_REQUEST => Err(ClientError::Validation(text)),
                _ => Err(ClientError::Server {
                    status: status.as_u16(),
                    message: text,
                }),
            };
        }

        response.json().await.map_err(Into::into)
    }

    async fn fetch_page(
        &self,
        collection: &str,
        query: &ListQuery,
        page: u32,
    ) -> ClientResult<RecordPage> {
        let mut params = vec![
            ("page", page.to_string()),
            ("perPage", PER_PAGE.to_string()),
        ];
        if let Some(filter) = &query.filter {
            params.push(("filter", filter.clone()));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }

        let request = self.client.get(self.records_url(collection)).query(&params);
        self.send(request).await
    }
}

#[async_trait]
impl RecordBackend for PocketBaseClient {
    async fn write(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Value,
    ) -> ClientResult<Value> {
        let request = match id {
            Some(id) => self
                .client
                .patch(format!("{}/{}", self.records_url(collection), id))
                .json(&fields),
            None => self.client.post(self.records_url(collection)).json(&fields),
        };
        self.send(request).await
    }

    async fn list(&self, collection: &str, query: &ListQuery) -> ClientResult<Vec<Value>> {
        let mut records = Vec::new();
        let mut page = 1;

        loop {
            let batch = self.fetch_page(collection, query, page).await?;
            records.extend(batch.items);
            if batch.page >= batch.total_pages {
                break;
            }
            page = batch.page + 1;
        }

        tracing::debug!(collection, count = records.len(), "Fetched full list");
        Ok(records)
    }
}
