//! Generic updater polling a static GTFS archive.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use depot_core::UpdaterConfig;
use tracing::info;

use crate::error::{UpdaterError, UpdaterResult};
use crate::feed::{FeedInfo, parse_timezone, read_feed_info};
use crate::{DiscoveredVersion, RegionUpdater};

/// Downloads the feed archive at `url`, reads `feed_info.txt`, and reports
/// its version. The version is auto-promoted while its validity window
/// contains the current local date.
pub struct BasicUpdater {
    prefix: String,
    url: String,
    api_key: Option<(String, String)>,
    timezone: Tz,
    http: reqwest::Client,
}

impl BasicUpdater {
    /// `api_key` is sent in `config.api_key_header` when both are set.
    pub fn new(
        prefix: &str,
        config: &UpdaterConfig,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> UpdaterResult<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| UpdaterError::MissingUrl(prefix.to_string()))?;
        let api_key = match (&config.api_key_header, api_key) {
            (Some(header), Some(key)) => Some((header.clone(), key.to_string())),
            _ => None,
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            prefix: prefix.to_string(),
            url,
            api_key,
            timezone: parse_timezone(&config.timezone)?,
            http,
        })
    }

    async fn download(&self) -> UpdaterResult<Vec<u8>> {
        let mut request = self.http.get(&self.url);
        if let Some((header, key)) = &self.api_key {
            request = request.header(header.as_str(), key.as_str());
        }
        let bytes = request.send().await?.error_for_status()?.bytes().await?;
        info!(prefix = %self.prefix, bytes = bytes.len(), "downloaded feed");
        Ok(bytes.to_vec())
    }

    fn discovered(&self, feed: FeedInfo, now: DateTime<Utc>) -> DiscoveredVersion {
        let auto_promote = feed.is_current(self.timezone, now);
        info!(
            prefix = %self.prefix,
            version = %feed.version,
            start = %feed.start_date,
            end = %feed.end_date,
            auto_promote,
            "found version"
        );
        DiscoveredVersion {
            prefix: self.prefix.clone(),
            version: feed.version,
            auto_promote,
        }
    }
}

#[async_trait]
impl RegionUpdater for BasicUpdater {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn check(&self) -> UpdaterResult<Vec<DiscoveredVersion>> {
        let archive = self.download().await?;
        let feed = tokio::task::spawn_blocking(move || read_feed_info(&archive))
            .await
            .map_err(|e| UpdaterError::Archive(e.to_string()))??;
        Ok(vec![self.discovered(feed, Utc::now())])
    }
}
