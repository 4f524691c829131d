//! Lister and fetcher for log objects in backing storage.
//!

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use opendal::{layers::TracingLayer, Lister, Metakey, Operator};
use tokio_stream::StreamExt;

use crate::error::{CacheError, DateFilterError};

/// S3 lists at most this many keys per page.
const PAGE_SIZE: usize = 1000;

/// A log object found in the bucket. Its content is fetched separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl LogObject {
    fn basename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// Restricts a listing to the logs of one year, month or day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFilter(String);

impl FromStr for DateFilter {
    type Err = DateFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let full = match s.len() {
            4 => format!("{s}-01-01"),
            7 => format!("{s}-01"),
            10 => s.to_string(),
            _ => return Err(DateFilterError(s.to_string())),
        };
        NaiveDate::parse_from_str(&full, "%Y-%m-%d")
            .map_err(|_| DateFilterError(s.to_string()))?;
        Ok(DateFilter(s.to_string()))
    }
}

impl DateFilter {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Server access logs are named `YYYY-mm-DD-HH-MM-SS-UniqueString`;
    /// anything else is matched on its last-modified time.
    pub fn matches(&self, object: &LogObject) -> bool {
        let name = object.basename();
        let dated = name
            .get(..10)
            .is_some_and(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").is_ok());
        if dated {
            return name.starts_with(&self.0);
        }
        object
            .last_modified
            .is_some_and(|t| t.format("%Y-%m-%d").to_string().starts_with(&self.0))
    }
}

/// Which objects to list.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Key prefix the logs are delivered under, e.g. `logs/`.
    pub prefix: String,
    pub date: Option<DateFilter>,
    /// Stop after this many pages of listing results.
    pub pages: Option<usize>,
}

/// A lazy listing of log objects.
pub struct Listing {
    lister: Lister,
    options: ListOptions,
    matched: usize,
}

impl Listing {
    /// The next matching log object, or `None` once the listing is exhausted.
    ///
    /// The page limit counts matching objects only, as a prefix-filtered S3
    /// listing would.
    pub async fn next(&mut self) -> Result<Option<LogObject>, CacheError> {
        if let Some(pages) = self.options.pages {
            if self.matched >= pages * PAGE_SIZE {
                tracing::info!("stopping listing after {} pages", pages);
                return Ok(None);
            }
        }
        while let Some(entry) = self.lister.next().await {
            let entry = entry.map_err(|source| CacheError::Transport {
                context: format!("listing {:?}", self.options.prefix),
                source,
            })?;

            let meta = entry.metadata();
            if !meta.mode().is_file() || !entry.path().starts_with(&self.options.prefix) {
                continue;
            }
            let object = LogObject {
                key: entry.path().to_string(),
                size: meta.content_length(),
                last_modified: meta.last_modified(),
            };
            if let Some(date) = &self.options.date {
                if !date.matches(&object) {
                    tracing::trace!("{} is outside {}", object.key, date.as_str());
                    continue;
                }
            }
            self.matched += 1;
            return Ok(Some(object));
        }
        Ok(None)
    }
}

/// Lists and fetches log objects from a backing store.
pub struct Fetcher {
    operator: Operator,
}

impl Fetcher {
    /// Fetcher for an S3 bucket. Credentials come from the environment.
    pub fn new_s3(bucket: &str, region: Option<&str>, endpoint: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = opendal::services::S3::default();
        builder.bucket(bucket);
        if let Some(region) = region {
            builder.region(region);
        }
        if let Some(endpoint) = endpoint {
            builder.endpoint(endpoint);
        }
        let operator = Operator::new(builder)?.layer(TracingLayer).finish();
        Ok(Fetcher { operator })
    }

    /// Fetcher over an already-configured operator.
    pub fn from_operator(operator: Operator) -> Self {
        Fetcher { operator }
    }

    /// Start listing the objects selected by `options`.
    pub async fn list(&self, options: ListOptions) -> Result<Listing, CacheError> {
        // Only whole directories can be listed; the rest of the prefix is
        // matched per key.
        let dir = match options.prefix.rfind('/') {
            Some(i) => options.prefix[..=i].to_string(),
            None => "/".to_string(),
        };
        let lister = self
            .operator
            .lister_with(&dir)
            .recursive(true)
            .metakey(Metakey::Mode | Metakey::ContentLength | Metakey::LastModified)
            .await
            .map_err(|source| CacheError::Transport {
                context: format!("listing {dir:?}"),
                source,
            })?;
        Ok(Listing {
            lister,
            options,
            matched: 0,
        })
    }

    /// Fetch the content of `object`.
    pub async fn fetch(&self, object: &LogObject) -> Result<Vec<u8>, CacheError> {
        let buffer = self
            .operator
            .read(&object.key)
            .await
            .map_err(|source| CacheError::Transport {
                context: format!("fetching {}", object.key),
                source,
            })?;
        Ok(buffer.to_vec())
    }
}
