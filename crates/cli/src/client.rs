//! Client for a running agent's control API

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Model pulls stream on the agent side and only answer when done
const PULL_TIMEOUT: Duration = Duration::from_secs(1800);

/// HTTP client for the agent control API
pub struct ControlClient {
    client: reqwest::Client,
    pull_client: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let pull_client = reqwest::Client::builder()
            .timeout(PULL_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            pull_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET a JSON endpoint
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Failed to reach agent at {}", self.base_url))?;

        Self::parse(response).await
    }

    /// POST a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach agent at {}", self.base_url))?;

        Self::parse(response).await
    }

    /// POST with the long pull timeout
    pub async fn post_slow<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .pull_client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach agent at {}", self.base_url))?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent error ({status}): {body}");
        }

        response.json().await.context("Failed to parse response")
    }
}
