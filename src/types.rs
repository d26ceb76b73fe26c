use std::fmt;
use std::net::SocketAddr;

use anyhow::{bail, Result};
use serde::{Serialize, Serializer};
use time::{format_description::well_known, OffsetDateTime};

/// Column names for `dns` probe output, in order.
pub const DNS_HEADER: &[&str] = &[
    "endTime",
    "domain",
    "countSuccess",
    "totalTimeout",
    "consecutiveTimeout",
    "code",
    "affected",
];

/// Column names for `payload` probe output, in order.
pub const PAYLOAD_HEADER: &[&str] = &[
    "endTime",
    "addr",
    "payload",
    "countSuccess",
    "totalTimeout",
    "consecutiveTimeout",
    "code",
    "affected",
];

/// Column names for passive capture output, in order.
pub const CAPTURE_HEADER: &[&str] = &[
    "ts",
    "localIP",
    "localPort",
    "remoteIP",
    "remotePort",
    "truncatedPayload",
    "len",
    "duration",
];

/// Something the sink can persist as one CSV row or one JSON line.
pub trait Record: Serialize + Send + 'static {
    /// Cells in header order.
    fn csv_fields(&self) -> Vec<String>;
}

/// A domain to resolve through the DoH resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainJob {
    domain: String,
}

impl DomainJob {
    pub fn new(domain: impl Into<String>) -> Result<Self> {
        let domain = domain.into();
        if domain.is_empty() {
            bail!("domain is empty");
        }
        if domain.len() > 253 {
            bail!("domain longer than 253 characters: {domain}");
        }
        if domain.chars().any(char::is_whitespace) {
            bail!("domain contains whitespace: {domain:?}");
        }
        if domain
            .trim_end_matches('.')
            .split('.')
            .any(|label| label.is_empty() || label.len() > 63)
        {
            bail!("domain has an empty or oversized label: {domain}");
        }
        Ok(Self { domain })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Raw bytes to deliver to one destination port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadJob {
    payload: Vec<u8>,
    port: u16,
}

impl PayloadJob {
    pub fn new(payload: Vec<u8>, port: u16) -> Result<Self> {
        if payload.is_empty() {
            bail!("payload is empty");
        }
        if port == 0 {
            bail!("port 0 is not a valid destination");
        }
        Ok(Self { payload, port })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// One unit of work for the probe pool. Consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Domain(DomainJob),
    Payload(PayloadJob),
}

impl Job {
    /// Hex of the payload for payload jobs.
    pub fn payload_hex(&self) -> Option<String> {
        match self {
            Job::Domain(_) => None,
            Job::Payload(p) => Some(hex::encode(p.payload())),
        }
    }
}

impl From<DomainJob> for Job {
    fn from(job: DomainJob) -> Self {
        Job::Domain(job)
    }
}

impl From<PayloadJob> for Job {
    fn from(job: PayloadJob) -> Self {
        Job::Payload(job)
    }
}

/// Result of a single network attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    /// `fatal` errors stop the attempt loop for the job.
    Error { code: String, fatal: bool },
}

impl AttemptOutcome {
    /// A probe failure the loop keeps going after (e.g. `no_answer`).
    pub fn soft_error(code: impl Into<String>) -> Self {
        AttemptOutcome::Error { code: code.into(), fatal: false }
    }

    /// A transport fault; remaining attempts for the job are skipped.
    pub fn fatal_error(code: impl Into<String>) -> Self {
        AttemptOutcome::Error { code: code.into(), fatal: true }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AttemptOutcome::Error { fatal: true, .. })
    }

    /// Code recorded in the `code` column, empty for successes.
    pub fn code(&self) -> &str {
        match self {
            AttemptOutcome::Success => "",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Error { code, .. } => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Affected,
    NotAffected,
    Unknown,
}

impl Verdict {
    /// Cell value used in the `affected` column.
    pub fn as_cell(&self) -> &'static str {
        match self {
            Verdict::Affected => "true",
            Verdict::NotAffected => "false",
            Verdict::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Affected => "affected",
            Verdict::NotAffected => "not affected",
            Verdict::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Final, immutable outcome of one probed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub target: String,
    /// Hex payload for payload jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    pub attempts: Vec<AttemptOutcome>,
    pub count_success: u32,
    /// Non-successful attempts that did not abort the loop.
    pub total_timeout: u32,
    pub consecutive_timeout_max: u32,
    pub last_code: String,
    pub verdict: Verdict,
    #[serde(serialize_with = "rfc3339")]
    pub end_time: OffsetDateTime,
}

impl Record for JobResult {
    fn csv_fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(8);
        fields.push(unix_seconds(self.end_time));
        fields.push(self.target.clone());
        if let Some(p) = &self.payload {
            fields.push(p.clone());
        }
        fields.push(self.count_success.to_string());
        fields.push(self.total_timeout.to_string());
        fields.push(self.consecutive_timeout_max.to_string());
        fields.push(self.last_code.clone());
        fields.push(self.verdict.as_cell().to_string());
        fields
    }
}

/// Metadata of one inbound connection, finalized when it closes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    #[serde(serialize_with = "rfc3339")]
    pub start_time: OffsetDateTime,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Hex of the first non-empty read only.
    pub first_chunk_hex: String,
    pub total_bytes: u64,
    pub duration_seconds: f64,
}

impl Record for ConnectionRecord {
    fn csv_fields(&self) -> Vec<String> {
        vec![
            unix_millis(self.start_time).to_string(),
            self.local.ip().to_string(),
            self.local.port().to_string(),
            self.remote.ip().to_string(),
            self.remote.port().to_string(),
            self.first_chunk_hex.clone(),
            self.total_bytes.to_string(),
            format!("{:.3}", self.duration_seconds),
        ]
    }
}

fn unix_seconds(t: OffsetDateTime) -> String {
    let millis = unix_millis(t);
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

fn unix_millis(t: OffsetDateTime) -> i128 {
    t.unix_timestamp_nanos() / 1_000_000
}

fn rfc3339<S: Serializer>(t: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
    let text = t
        .format(&well_known::Rfc3339)
        .map_err(<S::Error as serde::ser::Error>::custom)?;
    s.serialize_str(&text)
}
