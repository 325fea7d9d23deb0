//! Document content extraction collaborator.
//!
//! Extraction (and the storage it reads from) lives outside this system;
//! only the interface is defined here. Implementations fetch the document
//! bytes for a content hash and return per-unit text or region geometry.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::selection::Rect;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("unit {0} not found in document")]
    UnitNotFound(i32),
    #[error("extraction failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait DocumentExtractor: Send + Sync + 'static {
    async fn extract_text(&self, content_hash: &str, unit_index: i32)
        -> Result<String, ExtractError>;

    async fn extract_regions(
        &self,
        content_hash: &str,
        unit_index: i32,
    ) -> Result<Vec<Rect>, ExtractError>;
}

/// Client for the hosted extraction service.
pub struct HttpDocumentExtractor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDocumentExtractor {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.extractor_api_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        path: String,
        unit_index: i32,
    ) -> Result<T, ExtractError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .map_err(|err| ExtractError::Failed(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ExtractError::UnitNotFound(unit_index));
        }
        if !response.status().is_success() {
            return Err(ExtractError::Failed(format!(
                "extraction service returned status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ExtractError::Failed(err.to_string()))
    }
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
}

#[derive(Deserialize)]
struct RegionsResponse {
    regions: Vec<Rect>,
}

#[async_trait]
impl DocumentExtractor for HttpDocumentExtractor {
    async fn extract_text(
        &self,
        content_hash: &str,
        unit_index: i32,
    ) -> Result<String, ExtractError> {
        let response: TextResponse = self
            .fetch(
                format!("/documents/{content_hash}/units/{unit_index}/text"),
                unit_index,
            )
            .await?;
        Ok(response.text)
    }

    async fn extract_regions(
        &self,
        content_hash: &str,
        unit_index: i32,
    ) -> Result<Vec<Rect>, ExtractError> {
        let response: RegionsResponse = self
            .fetch(
                format!("/documents/{content_hash}/units/{unit_index}/regions"),
                unit_index,
            )
            .await?;
        Ok(response.regions)
    }
}
