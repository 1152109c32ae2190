use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use tracing::{debug, info};

use super::ObjectStore;
use crate::cloud::OpenStackClient;
use crate::error::{Result, ScanError};

/// OpenStack Swift container, authenticated with the cloud client's token.
pub struct SwiftStore {
    client: Arc<OpenStackClient>,
    container_url: String,
    container: String,
}

impl SwiftStore {
    /// Open `container`, creating it if it does not exist.
    pub async fn open(client: Arc<OpenStackClient>, container: &str) -> Result<Self> {
        let endpoint = client.object_store_endpoint().ok_or_else(|| ScanError::InvalidConfig {
            reason: "service catalog has no object-store endpoint".to_string(),
        })?;
        let container_url = format!("{}/{}", endpoint, container);

        // PUT on a container is idempotent: 201 when created, 202 when it exists.
        let request = client.authorized(Method::PUT, &container_url).await?;
        client
            .send("create container", request)
            .await
            .map_err(|e| ScanError::Store { key: container.to_string(), reason: e.to_string() })?;

        info!(container = %container, "Using Swift container for reports");
        Ok(Self { client, container_url, container: container.to_string() })
    }
}

#[async_trait]
impl ObjectStore for SwiftStore {
    async fn put(&self, content_type: &str, key: &str, body: Vec<u8>) -> Result<()> {
        let url = format!("{}/{}", self.container_url, key.trim_start_matches('/'));
        let len = body.len();

        let request = self
            .client
            .authorized(Method::PUT, &url)
            .await?
            .header(CONTENT_TYPE, content_type)
            .body(body);
        self.client.send("put object", request).await.map_err(|e| ScanError::Store {
            key: format!("{}/{}", self.container, key),
            reason: e.to_string(),
        })?;

        debug!(container = %self.container, key = %key, bytes = len, "Uploaded object");
        Ok(())
    }

    fn name(&self) -> &str {
        "swift"
    }
}
