//! Shared JSON-over-HTTP client for the tool backends.

use std::time::Duration;

use agentry_core::error::ToolError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ToolError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET");
        let request = self.authorize(self.client.get(&url)).query(query);
        Self::read(request.send().await, &url).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ToolError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST");
        let request = self.authorize(self.client.post(&url)).json(body);
        Self::read(request.send().await, &url).await
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn read<T: DeserializeOwned>(
        response: reqwest::Result<reqwest::Response>,
        url: &str,
    ) -> Result<T, ToolError> {
        let response = response.map_err(|e| ToolError::Upstream(format!("{url}: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Upstream(format!("{url} returned {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::Upstream(format!("{url}: invalid response body: {e}")))
    }
}
