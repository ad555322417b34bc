use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEMAPHORE_CONTENT: &str = "bye";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataRepoError {
    #[error("failed to build metadata client: {0}")]
    Client(String),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned an empty body")]
    EmptyBody { url: String },
}

/// Identity of this instance as reported by its metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub instance_type: String,
    pub availability_zone: String,
}

/// Local metadata service of the instance the agent runs on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstanceMetadataSource: Send + Sync {
    /// Body of the termination notice, `None` when no notice is posted.
    async fn termination_notice(&self) -> Result<Option<String>, MetadataRepoError>;

    async fn instance_type(&self) -> Result<String, MetadataRepoError>;

    async fn availability_zone(&self) -> Result<String, MetadataRepoError>;
}

#[derive(Clone)]
pub struct ReqwestMetadataSource {
    client: Client,
    notice_endpoint: String,
    metadata_base: String,
}

impl ReqwestMetadataSource {
    pub fn new(
        notice_endpoint: impl Into<String>,
        metadata_base: impl Into<String>,
    ) -> Result<Self, MetadataRepoError> {
        let client = Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| MetadataRepoError::Client(e.to_string()))?;

        Ok(Self {
            client,
            notice_endpoint: notice_endpoint.into(),
            metadata_base: metadata_base.into(),
        })
    }

    fn metadata_url(&self, item: &str) -> String {
        format!("{}/{}", self.metadata_base.trim_end_matches('/'), item)
    }

    async fn get(&self, url: &str) -> Result<(StatusCode, String), MetadataRepoError> {
        let transport = |e: reqwest::Error| MetadataRepoError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        Ok((status, body))
    }

    async fn metadata_item(&self, item: &str) -> Result<String, MetadataRepoError> {
        let url = self.metadata_url(item);
        let (status, body) = self.get(&url).await?;

        if !status.is_success() {
            return Err(MetadataRepoError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = body.trim();
        if body.is_empty() {
            return Err(MetadataRepoError::EmptyBody { url });
        }
        Ok(body.to_string())
    }
}

#[async_trait]
impl InstanceMetadataSource for ReqwestMetadataSource {
    async fn termination_notice(&self) -> Result<Option<String>, MetadataRepoError> {
        let (status, body) = self.get(&self.notice_endpoint).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn instance_type(&self) -> Result<String, MetadataRepoError> {
        self.metadata_item("instance-type").await
    }

    async fn availability_zone(&self) -> Result<String, MetadataRepoError> {
        self.metadata_item("placement/availability-zone").await
    }
}

/// Host-local flag telling the process supervisor that the marker is in place.
#[derive(Debug, Clone)]
pub struct TerminationSemaphore {
    path: PathBuf,
}

impl TerminationSemaphore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&self) -> std::io::Result<()> {
        tokio::fs::write(&self.path, SEMAPHORE_CONTENT).await
    }

    pub fn is_present(&self) -> bool {
        self.path.exists()
    }
}
