//! Client for the prediction service whose jobs the reconciler tracks.
//!
//! Requesting a job's info is also how computation is requested: the
//! service creates the task on first read. Connection failures are
//! transient and must leave the caller's record untouched; an error
//! status from the service is an answer, not a transient condition.

use async_trait::async_trait;
use bindsight_core::TaskInfo;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::error::{Result, SyncError};

const DEFAULT_DATABASE: &str = "conservation-hmm";

/// Pause between requests to the shared prediction service.
const REQUEST_PAUSE: Duration = Duration::from_secs(2);

/// Answer of the prediction service for one accession code.
#[derive(Debug, Clone)]
pub enum RemoteJob {
    /// The service knows the job; its status record is attached.
    Available(TaskInfo),
    /// The service rejected the request with an error status.
    Rejected(u16),
}

#[async_trait]
pub trait PredictionService: Send + Sync {
    /// Fetch the job record for a code, creating the job server-side
    /// when it does not exist yet.
    async fn fetch_info(&self, code: &str) -> Result<RemoteJob>;

    /// Download the job's raw output bundle.
    async fn fetch_archive(&self, code: &str, destination: &Path) -> Result<()>;
}

pub struct HttpPredictionService {
    client: reqwest::Client,
    server_url: String,
    database: String,
    pause: Duration,
}

impl HttpPredictionService {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server_url: server_url.into(),
            database: DEFAULT_DATABASE.to_string(),
            pause: REQUEST_PAUSE,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    fn prediction_url(&self, code: &str) -> String {
        format!(
            "{}/api/v2/prediction/{}/{code}",
            self.server_url, self.database
        )
    }
}

#[async_trait]
impl PredictionService for HttpPredictionService {
    async fn fetch_info(&self, code: &str) -> Result<RemoteJob> {
        tokio::time::sleep(self.pause).await;
        let url = self.prediction_url(code);
        debug!(url = %url, "Fetching job info");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("info request for {code} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Ok(RemoteJob::Rejected(status.as_u16()));
        }
        let info: TaskInfo = response.json().await.map_err(|e| {
            SyncError::transient(format!("reading job info for {code} failed: {e}"))
        })?;
        Ok(RemoteJob::Available(info))
    }

    async fn fetch_archive(&self, code: &str, destination: &Path) -> Result<()> {
        let url = format!("{}/public/bundle.zip", self.prediction_url(code));
        debug!(url = %url, "Fetching job archive");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("archive request for {code} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(SyncError::Remote {
                code: code.to_string(),
                status: response.status().as_u16(),
            });
        }
        let content = response.bytes().await.map_err(|e| {
            SyncError::transient(format!("reading archive for {code} failed: {e}"))
        })?;
        fs::write(destination, &content).await?;
        Ok(())
    }
}
