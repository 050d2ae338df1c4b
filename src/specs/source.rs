//! Upstream source of the model spec document

use async_trait::async_trait;
use std::time::Duration;

/// Errors loading the spec catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to fetch model specs from {url}: {detail}")]
    Fetch { url: String, detail: String },

    #[error("model spec document has an unexpected shape (expected an object or a list)")]
    Format,
}

/// Where the spec document comes from
#[async_trait]
pub trait SpecSource: Send + Sync {
    async fn fetch(&self) -> Result<serde_json::Value, CatalogError>;
}

/// Fetches the document over HTTP
pub struct HttpSpecSource {
    url: String,
    client: reqwest::Client,
}

impl HttpSpecSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CatalogError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tt-jukebox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CatalogError::Fetch {
                url: url.clone(),
                detail: e.to_string(),
            })?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl SpecSource for HttpSpecSource {
    async fn fetch(&self) -> Result<serde_json::Value, CatalogError> {
        let fail = |detail: String| CatalogError::Fetch {
            url: self.url.clone(),
            detail,
        };

        tracing::info!(url = %self.url, "Fetching model specifications");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fail(format!("HTTP {}", response.status())));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| fail(format!("invalid JSON: {}", e)))
    }
}
