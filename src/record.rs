/* Amazon S3 server access log lines look like:
 *
 * 79a59df9... awsexamplebucket1 [06/Feb/2019:00:00:38 +0000] 192.0.2.3
 *   79a59df9... 3E57427F3EXAMPLE REST.GET.VERSIONING - "GET /awsexamplebucket1?versioning HTTP/1.1"
 *   200 - 113 - 7 - "-" "S3Console/0.4" - s9lzHYrF...= SigV4 ...
 *
 * Fields are space-separated; the timestamp is bracketed and the request URI,
 * referrer and user agent are quoted. "-" means "no value".
 * Newer log formats append fields at the end, which are ignored here.
 */

use std::{io::Read, str::FromStr, sync::OnceLock};

use chrono::{DateTime, FixedOffset};
use regex_lite::Regex;
use rusqlite::{named_params, Connection};

use crate::error::ParseError;

const TIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Fields up to and including the user agent are required.
const MIN_FIELDS: usize = 17;

static FIELD: OnceLock<Regex> = OnceLock::new();

/// One request from an S3 server access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub bucket_owner: String,
    pub bucket: String,
    pub time: DateTime<FixedOffset>,
    pub remote_ip: Option<String>,
    pub requester: Option<String>,
    pub request_id: String,
    pub operation: String,
    pub key: Option<String>,
    pub request_uri: Option<String>,
    pub http_status: Option<u16>,
    pub error_code: Option<String>,
    pub bytes_sent: Option<u64>,
    pub object_size: Option<u64>,
    /// Milliseconds.
    pub total_time: Option<u64>,
    /// Milliseconds.
    pub turnaround_time: Option<u64>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub version_id: Option<String>,
}

fn split_fields(line: &str) -> Vec<String> {
    let re = FIELD.get_or_init(|| {
        Regex::new(r#"\[[^\]]*\]|"(?:[^"\\]|\\.)*"|\S+"#).expect("field pattern is valid")
    });
    re.find_iter(line)
        .map(|m| {
            let field = m.as_str();
            match field.strip_prefix('"').and_then(|f| f.strip_suffix('"')) {
                Some(quoted) => quoted.replace("\\\"", "\""),
                None => field.to_string(),
            }
        })
        .collect()
}

fn optional(value: &str) -> Option<String> {
    match value {
        "-" | "" => None,
        v => Some(v.to_string()),
    }
}

fn number<T: FromStr>(line: usize, field: &'static str, value: &str) -> Result<Option<T>, ParseError> {
    if value == "-" {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| ParseError::Number {
        line,
        field,
        value: value.to_string(),
    })
}

impl LogRecord {
    /// Parse a single log line. `line` is the 1-based line number, for errors.
    pub fn parse(line: usize, text: &str) -> Result<Self, ParseError> {
        let fields = split_fields(text);
        if fields.len() < MIN_FIELDS {
            return Err(ParseError::MissingFields {
                line,
                expected: MIN_FIELDS,
                found: fields.len(),
            });
        }

        let raw_time = fields[2].trim_start_matches('[').trim_end_matches(']');
        let time = DateTime::parse_from_str(raw_time, TIME_FORMAT).map_err(|source| {
            ParseError::Timestamp {
                line,
                value: raw_time.to_string(),
                source,
            }
        })?;

        Ok(LogRecord {
            bucket_owner: fields[0].clone(),
            bucket: fields[1].clone(),
            time,
            remote_ip: optional(&fields[3]),
            requester: optional(&fields[4]),
            request_id: fields[5].clone(),
            operation: fields[6].clone(),
            key: optional(&fields[7]),
            request_uri: optional(&fields[8]),
            http_status: number(line, "HTTP status", &fields[9])?,
            error_code: optional(&fields[10]),
            bytes_sent: number(line, "bytes sent", &fields[11])?,
            object_size: number(line, "object size", &fields[12])?,
            total_time: number(line, "total time", &fields[13])?,
            turnaround_time: number(line, "turnaround time", &fields[14])?,
            referrer: optional(&fields[15]),
            user_agent: optional(&fields[16]),
            version_id: fields.get(17).and_then(|v| optional(v)),
        })
    }

    /// Insert this record, attributed to the log object `log_key`.
    ///
    /// Callers are expected to hold a transaction open on `conn`.
    pub fn store(&self, conn: &Connection, log_key: &str) -> Result<(), rusqlite::Error> {
        conn.prepare_cached(
            r#"
INSERT INTO access_log (
    log_key, bucket_owner, bucket, time,
    remote_ip, requester, request_id, operation,
    key, request_uri, http_status, error_code,
    bytes_sent, object_size, total_time, turnaround_time,
    referrer, user_agent, version_id
) VALUES (
   :log_key,:bucket_owner,:bucket,:time,
   :remote_ip,:requester,:request_id,:operation,
   :key,:request_uri,:http_status,:error_code,
   :bytes_sent,:object_size,:total_time,:turnaround_time,
   :referrer,:user_agent,:version_id
)"#,
        )?
        .execute(named_params! {
            ":log_key": log_key,
            ":bucket_owner": &self.bucket_owner,
            ":bucket": &self.bucket,
            ":time": self.time.to_rfc3339(),
            ":remote_ip": &self.remote_ip,
            ":requester": &self.requester,
            ":request_id": &self.request_id,
            ":operation": &self.operation,
            ":key": &self.key,
            ":request_uri": &self.request_uri,
            ":http_status": self.http_status,
            ":error_code": &self.error_code,
            ":bytes_sent": self.bytes_sent,
            ":object_size": self.object_size,
            ":total_time": self.total_time,
            ":turnaround_time": self.turnaround_time,
            ":referrer": &self.referrer,
            ":user_agent": &self.user_agent,
            ":version_id": &self.version_id,
        })?;
        Ok(())
    }
}

fn is_gzip(key: &str, data: &[u8]) -> bool {
    key.ends_with(".gz") || data.starts_with(&[0x1f, 0x8b])
}

fn decode(data: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(data).map_err(|source| ParseError::Encoding {
        line: data[..source.valid_up_to()]
            .iter()
            .filter(|&&b| b == b'\n')
            .count()
            + 1,
        source,
    })
}

/// Parse the contents of the log object `key` into records.
///
/// Gzipped objects (by suffix or magic) are decompressed first; logs are
/// often concatenations of several gzip members. Blank lines are ignored; any
/// other malformed line, or text that is not UTF-8, fails the whole object.
pub fn parse_log(key: &str, data: &[u8]) -> Result<Vec<LogRecord>, ParseError> {
    let mut decompressed = Vec::new();
    let data = if is_gzip(key, data) {
        flate2::read::MultiGzDecoder::new(data).read_to_end(&mut decompressed)?;
        &decompressed[..]
    } else {
        data
    };

    decode(data)?
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| LogRecord::parse(i + 1, line))
        .collect()
}
