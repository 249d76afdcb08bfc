//! `nz-akl` updater backed by the regional versions API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depot_core::UpdaterConfig;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{UpdaterError, UpdaterResult};
use crate::{DiscoveredVersion, RegionUpdater};

pub const DEFAULT_VERSIONS_URL: &str = "https://api.at.govt.nz/v2/gtfs/versions";
pub const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    response: Vec<PublishedVersion>,
}

#[derive(Debug, Deserialize)]
struct PublishedVersion {
    version: String,
    #[serde(rename = "startdate")]
    start: DateTime<Utc>,
    #[serde(rename = "enddate")]
    end: DateTime<Utc>,
}

impl PublishedVersion {
    fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.start <= now && now < self.end
    }
}

/// Reports every version the API lists, promoting whichever is in service.
pub struct AucklandUpdater {
    prefix: String,
    url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl AucklandUpdater {
    pub fn new(
        prefix: &str,
        config: &UpdaterConfig,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> UpdaterResult<Self> {
        if api_key.is_none() {
            warn!(prefix, "no api key configured, requests will likely be rejected");
        }
        Ok(Self {
            prefix: prefix.to_string(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_VERSIONS_URL.to_string()),
            api_key: api_key.map(str::to_string),
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    async fn fetch(&self) -> UpdaterResult<VersionsResponse> {
        let mut request = self.http.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.header(SUBSCRIPTION_KEY_HEADER, key.as_str());
        }
        let body = request.send().await?.error_for_status()?.text().await?;
        serde_json::from_str(&body).map_err(|e| UpdaterError::VersionsApi(e.to_string()))
    }
}

#[async_trait]
impl RegionUpdater for AucklandUpdater {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn check(&self) -> UpdaterResult<Vec<DiscoveredVersion>> {
        let listed = self.fetch().await?.response;
        let now = Utc::now();
        info!(prefix = %self.prefix, count = listed.len(), "fetched published versions");
        Ok(listed
            .into_iter()
            .map(|v| DiscoveredVersion {
                prefix: self.prefix.clone(),
                auto_promote: v.is_current(now),
                version: v.version,
            })
            .collect())
    }
}
