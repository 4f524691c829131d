//! Cache S3 server access logs in a SQLite database for easier querying.
//!
//! Log buckets easily grow to millions of keys, so the cache keeps a ledger of
//! the log objects it has already ingested: a full backfill can be run once and
//! then a daily job (or an unfiltered catch-up run after an outage) only adds
//! what is missing, without duplicating records.

use std::{fmt, path::PathBuf, time::Instant};

use anyhow::Context;
use tokio::runtime::Runtime;

mod database;
mod error;
mod fetcher;
mod record;

pub use database::Database;
pub use error::{CacheError, DateFilterError, ParseError};
pub use fetcher::{DateFilter, Fetcher, ListOptions, Listing, LogObject};
pub use record::{parse_log, LogRecord};

/// Outcome of one caching run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Log objects selected by the listing.
    pub listed: usize,
    /// Objects already cached by an earlier run.
    pub skipped: usize,
    /// Objects newly cached by this run.
    pub ingested: usize,
    /// Records inserted by this run.
    pub records: usize,
    /// Objects deleted between listing and fetching.
    pub missing: usize,
    pub parse_failures: usize,
    pub storage_failures: usize,
}

impl Summary {
    pub fn failures(&self) -> usize {
        self.parse_failures + self.storage_failures
    }

    /// Every listed object is now cached (or is gone from the bucket).
    pub fn is_complete(&self) -> bool {
        self.failures() == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} log objects: {} cached ({} records), {} already cached, {} missing, {} malformed, {} not stored",
            self.listed,
            self.ingested,
            self.records,
            self.skipped,
            self.missing,
            self.parse_failures,
            self.storage_failures
        )
    }
}

/// Cache a single log object, unless it already is.
///
/// Returns the number of records inserted, or `None` if the object was skipped.
async fn cache_object(
    fetcher: &Fetcher,
    db: &mut Database,
    object: &LogObject,
) -> Result<Option<usize>, CacheError> {
    let storage = |source: rusqlite::Error| CacheError::Storage {
        key: object.key.clone(),
        source,
    };
    if db.is_processed(&object.key).map_err(storage)? {
        tracing::debug!("{} already cached", &object.key);
        return Ok(None);
    }

    tracing::info!("processing log object {}", &object.key);
    let data = fetcher.fetch(object).await?;
    let records = parse_log(&object.key, &data).map_err(|source| CacheError::Parse {
        key: object.key.clone(),
        source,
    })?;
    db.ingest(object, &records).map_err(storage)?;
    tracing::info!("cached {} records from {}", records.len(), &object.key);
    Ok(Some(records.len()))
}

/// Cache every log object selected by `options` that is not cached yet.
///
/// Objects that fail to parse or store are left for the next run; a transport
/// error aborts the run.
pub async fn cache_logs(
    fetcher: &Fetcher,
    db: &mut Database,
    options: ListOptions,
) -> Result<Summary, CacheError> {
    let mut summary = Summary::default();
    let mut listing = fetcher.list(options).await?;
    while let Some(object) = listing.next().await? {
        summary.listed += 1;
        match cache_object(fetcher, db, &object).await {
            Ok(Some(records)) => {
                summary.ingested += 1;
                summary.records += records;
            }
            Ok(None) => summary.skipped += 1,
            Err(e) if e.is_not_found() => {
                tracing::warn!("{} no longer exists: {}", &object.key, e);
                summary.missing += 1;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e @ CacheError::Parse { .. }) => {
                tracing::warn!("skipping: {}", e);
                summary.parse_failures += 1;
            }
            Err(e) => {
                tracing::error!("{}", e);
                summary.storage_failures += 1;
            }
        }
    }
    Ok(summary)
}

/// Fetch logs from a bucket and cache them into a database.
pub struct Cruncher {
    pub bucket: String,
    pub database: PathBuf,

    /// Back up and recreate the database, then cache the whole bucket.
    pub initdb: bool,
    pub date: Option<DateFilter>,
    pub prefix: String,
    pub pages: Option<usize>,

    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Cruncher {
    /// Fetch and cache the logs from S3.
    pub fn crunch(self, rt: &Runtime) -> anyhow::Result<Summary> {
        let fetcher = Fetcher::new_s3(
            &self.bucket,
            self.region.as_deref(),
            self.endpoint.as_deref(),
        )
        .context("could not initialize fetcher")?;
        self.crunch_with(&fetcher, rt)
    }

    /// Fetch and cache the logs using `fetcher`.
    pub fn crunch_with(self, fetcher: &Fetcher, rt: &Runtime) -> anyhow::Result<Summary> {
        let start = Instant::now();
        let date = if self.initdb {
            if let Some(date) = &self.date {
                tracing::warn!("ignoring date {} when initializing", date.as_str());
            }
            if let Some(backup) = Database::backup(&self.database)? {
                tracing::info!("backed up existing database to {}", backup.display());
            }
            None
        } else {
            self.date
        };
        let mut db = Database::open(&self.database)?;

        tracing::info!(
            "caching logs from {}, filtering on {:?}",
            &self.bucket,
            date.as_ref().map(DateFilter::as_str)
        );
        let options = ListOptions {
            prefix: self.prefix,
            date,
            pages: self.pages,
        };
        let summary = rt
            .block_on(cache_logs(fetcher, &mut db, options))
            .with_context(|| format!("aborted caching logs from {}", &self.bucket))?;

        tracing::info!("{}", summary);
        tracing::info!("{} seconds elapsed", start.elapsed().as_secs());
        Ok(summary)
    }
}
