//! DNS-over-HTTPS probe using the JSON API (`application/dns-json`).
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{header::ACCEPT, Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::probe::Probe;
use crate::types::{AttemptOutcome, Job};

pub const DEFAULT_RESOLVER: &str = "https://cloudflare-dns.com/dns-query";

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer", default)]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(default)]
    data: String,
}

/// Resolves the job's domain as an A record through one resolver endpoint.
pub struct DohProbe {
    client: Client,
    resolver: String,
}

impl DohProbe {
    pub fn new(resolver: impl Into<String>) -> Result<Self> {
        let resolver = resolver.into();
        reqwest::Url::parse(&resolver)
            .with_context(|| format!("invalid DoH resolver URL: {resolver}"))?;
        let client = Client::builder()
            .user_agent(concat!("blockprobe-rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, resolver })
    }

    pub fn resolver(&self) -> &str {
        &self.resolver
    }
}

#[async_trait]
impl Probe for DohProbe {
    async fn attempt(&self, job: &Job, timeout: Duration) -> AttemptOutcome {
        let Job::Domain(job) = job else {
            return AttemptOutcome::fatal_error("DoH probe only accepts domain jobs");
        };

        let res = self
            .client
            .get(&self.resolver)
            .query(&[("name", job.domain()), ("type", "A"), ("cd", "false")])
            .header(ACCEPT, "application/dns-json")
            .timeout(timeout)
            .send()
            .await;
        let resp = match res {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return AttemptOutcome::Timeout,
            Err(e) => return AttemptOutcome::fatal_error(e.to_string()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            return AttemptOutcome::soft_error(format!("error_{}", status.as_u16()));
        }

        match resp.json::<DohResponse>().await {
            Ok(DohResponse { answer: Some(answers) }) if !answers.is_empty() => {
                for a in &answers {
                    debug!("{} answer: {}", job.domain(), a.data);
                }
                AttemptOutcome::Success
            }
            Ok(_) => AttemptOutcome::soft_error("no_answer"),
            Err(e) if e.is_timeout() => AttemptOutcome::Timeout,
            Err(e) => AttemptOutcome::fatal_error(e.to_string()),
        }
    }

    fn target(&self, job: &Job) -> String {
        match job {
            Job::Domain(d) => d.domain().to_string(),
            Job::Payload(p) => hex::encode(p.payload()),
        }
    }
}
