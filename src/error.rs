//! Errors raised while caching log objects.

use thiserror::Error;

/// Why a single log object could not be cached.
///
/// Only transport errors abort a run; the others leave the object unmarked
/// so the next run picks it up again.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object storage error on {context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: opendal::Error,
    },
    #[error("malformed log object {key}: {source}")]
    Parse {
        key: String,
        #[source]
        source: ParseError,
    },
    #[error("could not store log object {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: rusqlite::Error,
    },
}

impl CacheError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Transport { .. })
    }

    /// The object vanished between listing and fetching.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Transport { source, .. } if source.kind() == opendal::ErrorKind::NotFound)
    }
}

/// Malformed access log content.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("could not decompress: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("line {line}: not UTF-8: {source}")]
    Encoding {
        line: usize,
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("line {line}: expected at least {expected} fields, found {found}")]
    MissingFields {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: bad timestamp {value:?}: {source}")]
    Timestamp {
        line: usize,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("line {line}: bad {field} {value:?}")]
    Number {
        line: usize,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Error)]
#[error("invalid date {0:?}: expected YYYY, YYYY-MM or YYYY-MM-DD")]
pub struct DateFilterError(pub String);
