use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use s3_log_cruncher::{Cruncher, DateFilter};

/// Caches S3 access logs in a SQLite database for easier querying.
///
/// Initial run:   cache_logs --initdb --bucket=mybucket-logs --database=mydb.sql
///
/// Daily cron job: cache_logs --bucket=mybucket-logs --database=mydb.sql --date=2018-01-10
///
/// Run without --date at any time to pick up anything missed, e.g. after an
/// outage; logs already cached are skipped.
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Args {
    /// Back up the database to <DATABASE>.bak if it exists, recreate it and
    /// cache the whole bucket.
    #[arg(short, long, conflicts_with = "date")]
    initdb: bool,

    /// Name of the S3 bucket containing the logs.
    #[arg(short, long)]
    bucket: String,

    /// Path to the SQLite database file.
    #[arg(short, long)]
    database: PathBuf,

    /// Only cache logs from this year, month or day (YYYY, YYYY-MM or YYYY-MM-DD).
    #[arg(short = 't', long)]
    date: Option<DateFilter>,

    /// Key prefix the logs are delivered under.
    #[arg(long, default_value = "logs/")]
    prefix: String,

    /// Limit listing to this many pages of 1000 keys.
    #[arg(short, long)]
    pages: Option<usize>,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Directly set an S3 endpoint, for S3-compatible stores.
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("could not start runtime")?;

    let summary = Cruncher {
        bucket: args.bucket,
        database: args.database,
        initdb: args.initdb,
        date: args.date,
        prefix: args.prefix,
        pages: args.pages,
        region: args.region,
        endpoint: args.endpoint,
    }
    .crunch(&rt)?;

    if !summary.is_complete() {
        anyhow::bail!(
            "{} log objects could not be cached; re-run to retry them",
            summary.failures()
        );
    }
    Ok(())
}
