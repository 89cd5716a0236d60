//! Binary fetcher — downloads plugin binaries and registry documents

use async_trait::async_trait;
use sdk::errors::ResolveError;
use tracing::debug;

/// Default user agent sent with every request
pub fn default_user_agent() -> String {
    format!("plughub/{}", env!("CARGO_PKG_VERSION"))
}

/// Source of remote bytes
///
/// Implementations read the whole body into memory. Nothing is written to
/// disk before the caller has verified it.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url` on behalf of `plugin`
    ///
    /// # Errors
    ///
    /// Returns `ResolveError::DownloadFailed` for transport failures and
    /// non-success HTTP statuses.
    async fn fetch(&self, plugin: &str, url: &str) -> Result<Vec<u8>, ResolveError>;
}

/// `reqwest`-backed fetcher
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build a fetcher with its own client
    pub fn new(user_agent: &str) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ResolveError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, plugin: &str, url: &str) -> Result<Vec<u8>, ResolveError> {
        debug!(plugin, url, "Downloading");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::download(plugin, e))?
            .error_for_status()
            .map_err(|e| ResolveError::download(plugin, e))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ResolveError::download(plugin, e))?;

        debug!(plugin, url, size = bytes.len(), "Download complete");
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::errors::Stage;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn test_fetch_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tool-linux-amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"binary".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&default_user_agent()).unwrap();
        let bytes = fetcher
            .fetch("tool", &format!("{}/tool-linux-amd64", server.uri()))
            .await
            .unwrap();

        assert_eq!(bytes, b"binary");
    }

    #[tokio::test]
    async fn test_fetch_maps_http_error_to_download_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&default_user_agent()).unwrap();
        let err = fetcher
            .fetch("tool", &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Download);
        assert_eq!(err.plugin(), Some("tool"));
    }
}
