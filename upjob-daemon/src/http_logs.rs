//! HTTP client for the update-log server.
//!
//! Fetches the version logs shown next to the System and Security items.
//! Other classifications have no logs on the server.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use upjob_core::{
    parse_update_logs, Classification, LogFetchError, UpdateLogEntry, UpdateLogService,
};

/// Path of the log listing endpoint, relative to the server URL.
const UPDATE_LOG_ENDPOINT: &str = "/api/v1/systemupdatelogs";

/// Fetches update logs over HTTP.
pub struct HttpUpdateLogService {
    /// Base URL of the update-log server
    server_url: String,
    /// Ask for logs of unstable releases too
    unstable: bool,
    client: reqwest::Client,
}

impl HttpUpdateLogService {
    pub fn new(
        server_url: impl Into<String>,
        unstable: bool,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            unstable,
            client,
        })
    }

    /// Log type the server files entries of `classification` under.
    fn log_type(classification: Classification) -> Option<i32> {
        match classification {
            Classification::System => Some(1),
            Classification::Safe => Some(2),
            _ => None,
        }
    }

    fn url(&self) -> String {
        format!("{}{}", self.server_url, UPDATE_LOG_ENDPOINT)
    }
}

#[async_trait]
impl UpdateLogService for HttpUpdateLogService {
    #[instrument(skip(self), fields(classification = %classification))]
    async fn fetch_update_logs(
        &self,
        classification: Classification,
    ) -> Result<Vec<UpdateLogEntry>, LogFetchError> {
        let Some(log_type) = Self::log_type(classification) else {
            debug!("No update logs published for this classification");
            return Ok(Vec::new());
        };

        let url = self.url();
        debug!(url = %url, log_type, "Fetching update logs");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("logType", log_type.to_string()),
                ("isUnstable", u8::from(self.unstable).to_string()),
            ])
            .send()
            .await
            .map_err(|e| LogFetchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LogFetchError::Transport(format!(
                "server returned {}: {}",
                status, body
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| LogFetchError::Transport(e.to_string()))?;

        let entries = parse_update_logs(&body)?;
        info!(entries = entries.len(), "Update logs fetched");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_type_mapping() {
        assert_eq!(HttpUpdateLogService::log_type(Classification::System), Some(1));
        assert_eq!(HttpUpdateLogService::log_type(Classification::Safe), Some(2));
        assert_eq!(HttpUpdateLogService::log_type(Classification::Unknown), None);
    }

    #[test]
    fn test_url_strips_trailing_slash() {
        let service =
            HttpUpdateLogService::new("http://logs.local/", false, Duration::from_secs(5)).unwrap();
        assert_eq!(service.url(), "http://logs.local/api/v1/systemupdatelogs");
    }

    #[tokio::test]
    async fn test_unknown_classification_skips_request() {
        // Nothing listens on this port; a request would fail.
        let service =
            HttpUpdateLogService::new("http://127.0.0.1:9", false, Duration::from_secs(1)).unwrap();
        let entries = service
            .fetch_update_logs(Classification::Unknown)
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let service =
            HttpUpdateLogService::new("http://127.0.0.1:9", false, Duration::from_secs(1)).unwrap();
        let err = service
            .fetch_update_logs(Classification::System)
            .await
            .unwrap_err();
        assert!(matches!(err, LogFetchError::Transport(_)));
    }
}
