//! HTTP client for the collaboration state service.
//!
//! ```text
//! GET    {base}/collaboration/state/{reference}/{site}  → CachedState
//! POST   {base}/collaboration/state/{reference}/{site}  ← CacheUpdate
//! DELETE {base}/collaboration/state/{reference}/{site}
//! ```

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use super::{CacheUpdate, CachedState, StateCache};
use crate::error::CacheError;

pub struct HttpStateCache {
    client: Client,
    url: String,
}

impl HttpStateCache {
    pub fn new(base_url: &str, reference: &str, site: &str) -> Self {
        Self::with_client(Client::new(), base_url, reference, site)
    }

    /// Use a preconfigured client (auth headers, cookies, timeouts).
    pub fn with_client(client: Client, base_url: &str, reference: &str, site: &str) -> Self {
        Self {
            client,
            url: state_url(base_url, reference, site),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn state_url(base_url: &str, reference: &str, site: &str) -> String {
    format!(
        "{}/collaboration/state/{reference}/{site}",
        base_url.trim_end_matches('/')
    )
}

fn status_error(status: StatusCode) -> Option<CacheError> {
    if status == StatusCode::FORBIDDEN {
        Some(CacheError::Forbidden)
    } else if !status.is_success() {
        Some(CacheError::Status(status.as_u16()))
    } else {
        None
    }
}

fn check(response: Response) -> Result<Response, CacheError> {
    match status_error(response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}

#[async_trait]
impl StateCache for HttpStateCache {
    async fn fetch(&self) -> Result<CachedState, CacheError> {
        let response = check(self.client.get(&self.url).send().await?)?;
        response
            .json::<CachedState>()
            .await
            .map_err(|e| CacheError::Decode(e.to_string()))
    }

    async fn update(&self, update: CacheUpdate) -> Result<(), CacheError> {
        check(self.client.post(&self.url).json(&update).send().await?)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        check(self.client.delete(&self.url).send().await?)?;
        Ok(())
    }
}
