//! Reading `feed_info.txt` out of a GTFS archive.

use std::io::{Cursor, Read};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::error::{UpdaterError, UpdaterResult};

const FEED_INFO: &str = "feed_info.txt";

/// Version and validity window published by a feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedInfo {
    pub version: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl FeedInfo {
    /// Whether the feed is in service at `now` in timezone `tz`.
    pub fn is_current(&self, tz: Tz, now: DateTime<Utc>) -> bool {
        window_contains(self.start_date, self.end_date, tz, now)
    }
}

/// `[start 00:00, end + 1 day 00:00)` in `tz` contains `now`.
pub fn window_contains(start: NaiveDate, end: NaiveDate, tz: Tz, now: DateTime<Utc>) -> bool {
    let today = now.with_timezone(&tz).date_naive();
    start <= today && today <= end
}

pub fn parse_timezone(name: &str) -> UpdaterResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| UpdaterError::Timezone(name.to_string()))
}

/// Extract and parse `feed_info.txt` from a zipped feed.
///
/// The file may sit at the archive root or inside a single top-level
/// directory.
pub fn read_feed_info(archive: &[u8]) -> UpdaterResult<FeedInfo> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive))
        .map_err(|e| UpdaterError::Archive(e.to_string()))?;

    let name = zip
        .file_names()
        .filter(|name| name.rsplit('/').next() == Some(FEED_INFO))
        .min_by_key(|name| name.len())
        .map(str::to_string)
        .ok_or_else(|| UpdaterError::Archive(format!("{FEED_INFO} not found in archive")))?;

    let mut content = String::new();
    zip.by_name(&name)
        .map_err(|e| UpdaterError::Archive(e.to_string()))?
        .read_to_string(&mut content)
        .map_err(|e| UpdaterError::Archive(e.to_string()))?;

    parse_feed_info(&content)
}

/// Parse the first data row of a `feed_info.txt` document.
pub fn parse_feed_info(content: &str) -> UpdaterResult<FeedInfo> {
    let content = content.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| UpdaterError::FeedInfo(e.to_string()))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| UpdaterError::FeedInfo(format!("missing column {name}")))
    };
    let (version_col, start_col, end_col) = (
        column("feed_version")?,
        column("feed_start_date")?,
        column("feed_end_date")?,
    );

    let row = reader
        .records()
        .next()
        .ok_or_else(|| UpdaterError::FeedInfo("no rows".into()))?
        .map_err(|e| UpdaterError::FeedInfo(e.to_string()))?;
    let field = |idx: usize| row.get(idx).unwrap_or_default();

    let version = field(version_col).to_string();
    if version.is_empty() {
        return Err(UpdaterError::FeedInfo("empty feed_version".into()));
    }
    Ok(FeedInfo {
        version,
        start_date: parse_date(field(start_col))?,
        end_date: parse_date(field(end_col))?,
    })
}

/// GTFS dates are `YYYYMMDD`.
fn parse_date(value: &str) -> UpdaterResult<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|_| UpdaterError::FeedInfo(format!("invalid date {value:?}")))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    /// Zip the given `(name, body)` pairs in memory.
    pub fn archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    pub fn feed_info(version: &str, start: &str, end: &str) -> String {
        format!(
            "feed_publisher_name,feed_publisher_url,feed_lang,feed_start_date,feed_end_date,feed_version\n\
             Metro,https://example.org,en,{start},{end},{version}\n"
        )
    }
}
