//! Client for the remote structure catalogue.
//!
//! The catalogue exposes a Solr-style search endpoint. Entries are
//! fetched in release-date order, paged; a failing page terminates the
//! fetch but keeps the pages already collected.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

use crate::error::{Result, SyncError};

const CATALOG_ENDPOINT: &str = "https://www.ebi.ac.uk/pdbe/search/pdb/select";
const PAGE_SIZE: usize = 300;

/// Pause between catalogue requests, keeping the load on the shared
/// endpoint low.
const REQUEST_PAUSE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub code: String,
    pub release_date: String,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Entries released at or after the given date; all entries when no
    /// date is given.
    async fn entries_since(&self, date: Option<&str>) -> Result<Vec<CatalogEntry>>;
}

pub struct HttpCatalogClient {
    client: reqwest::Client,
    endpoint: String,
    pause: Duration,
}

impl HttpCatalogClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: CATALOG_ENDPOINT.to_string(),
            pause: REQUEST_PAUSE,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self.pause = Duration::ZERO;
        self
    }

    fn date_filter(date: Option<&str>) -> String {
        match date {
            Some(date) => format!("q=release_date:[{date} TO *]"),
            None => "q=*:*".to_string(),
        }
    }

    fn count_url(&self, date: Option<&str>) -> String {
        format!(
            "{}?group=true&group.ngroups=true&group.field=pdb_id&\
             fl=pdb_id,release_date&{}&rows=0&wjt=json",
            self.endpoint,
            Self::date_filter(date)
        )
    }

    fn page_url(&self, date: Option<&str>, offset: usize, limit: usize) -> String {
        format!(
            "{}?group=true&group.ngroups=true&group.field=pdb_id&\
             fl=pdb_id,release_date&{}&start={offset}&rows={limit}&wjt=json&\
             group.format=simple&sort=release_date%20asc",
            self.endpoint,
            Self::date_filter(date)
        )
    }

    async fn fetch_json(&self, url: &str) -> Result<Value> {
        tokio::time::sleep(self.pause).await;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("catalogue request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(SyncError::transient(format!(
                "catalogue answered with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("reading catalogue response failed: {e}")))
    }
}

impl Default for HttpCatalogClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn entries_since(&self, date: Option<&str>) -> Result<Vec<CatalogEntry>> {
        let counted = self.fetch_json(&self.count_url(date)).await?;
        let total = counted
            .pointer("/grouped/pdb_id/ngroups")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::transient("catalogue count response is malformed"))?
            as usize;
        info!(total = total, "Catalogue entries to fetch");

        let mut result = Vec::new();
        let mut offset = 0;
        while offset < total {
            let limit = PAGE_SIZE.min(total - offset);
            let page = match self.fetch_json(&self.page_url(date, offset, limit)).await {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, "Catalogue page failed, terminating fetch");
                    return Ok(result);
                }
            };
            let Some(docs) = page
                .pointer("/grouped/pdb_id/doclist/docs")
                .and_then(Value::as_array)
            else {
                error!("Catalogue page is malformed, terminating fetch");
                return Ok(result);
            };
            for document in docs {
                let Some(code) = document.get("pdb_id").and_then(Value::as_str) else {
                    continue;
                };
                let release_date = document
                    .get("release_date")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                result.push(CatalogEntry {
                    code: code.to_uppercase(),
                    release_date: release_date.to_string(),
                });
            }
            offset += limit;
        }
        info!(entries = result.len(), "Catalogue fetch done");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_urls() {
        let client = HttpCatalogClient::new().with_endpoint("http://localhost/select");
        assert!(client
            .count_url(Some("2026-01-01T00:00:00Z"))
            .contains("q=release_date:[2026-01-01T00:00:00Z TO *]&rows=0"));
        assert!(client.count_url(None).contains("q=*:*"));
        let page = client.page_url(None, 300, 300);
        assert!(page.contains("start=300&rows=300"));
        assert!(page.contains("sort=release_date%20asc"));
    }
}
