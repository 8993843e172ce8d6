use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::signer::{RequestAuth, SignError};
use super::{MetricDatapoint, MetricSink, RESOURCE_ID_DIMENSION};

const POST_METRICS_PATH: &str = "20180401/metrics";
const GET_FUNCTION_PATH: &str = "20181201/functions/";
const NON_ATOMIC: &str = "NON_ATOMIC";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("{failed} of {total} data points rejected: {}", .messages.join("; "))]
    Partial {
        failed: usize,
        total: usize,
        messages: Vec<String>,
    },

    #[error("all {total} data points rejected: {}", .messages.join("; "))]
    Rejected { total: usize, messages: Vec<String> },

    #[error("monitoring service answered {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request to monitoring service failed")]
    Transport(#[from] reqwest::Error),

    #[error("invalid service URL")]
    Url(#[from] url::ParseError),

    #[error("could not authenticate request")]
    Sign(#[from] SignError),

    #[error("could not look up compartment: {0}")]
    Lookup(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMetricDataDetails<'a> {
    metric_data: Vec<MetricDataDetails<'a>>,
    batch_atomicity: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricDataDetails<'a> {
    namespace: &'a str,
    compartment_id: &'a str,
    name: &'a str,
    dimensions: BTreeMap<&'static str, &'a str>,
    datapoints: Vec<Datapoint>,
}

#[derive(Debug, Serialize)]
struct Datapoint {
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PostMetricDataResponseDetails {
    failed_metrics_count: usize,
    failed_metrics: Vec<FailedMetricRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FailedMetricRecord {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDetails {
    compartment_id: String,
}

/// Builds the HTTP client shared by the publishing and lookup calls.
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("certbox/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Joins `path` below `base`, keeping any path prefix the base already has.
fn service_url(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefix = format!("{}/", base.path());
        base.set_path(&prefix);
    }
    base.join(path)
}

/// Posts metric data points to the monitoring ingestion API.
pub struct MonitoringClient {
    client: Client,
    metrics_url: Url,
    compartment_id: String,
    auth: RequestAuth,
}

impl MonitoringClient {
    pub fn new(
        client: Client,
        ingestion_endpoint: &Url,
        compartment_id: String,
        auth: RequestAuth,
    ) -> Result<Self, PublishError> {
        let metrics_url = service_url(ingestion_endpoint, POST_METRICS_PATH)?;

        Ok(Self {
            client,
            metrics_url,
            compartment_id,
            auth,
        })
    }

    fn request_body<'a>(&'a self, batch: &'a [MetricDatapoint]) -> PostMetricDataDetails<'a> {
        let metric_data = batch
            .iter()
            .map(|point| MetricDataDetails {
                namespace: &point.namespace,
                compartment_id: &self.compartment_id,
                name: &point.name,
                dimensions: BTreeMap::from([(RESOURCE_ID_DIMENSION, point.resource_id.as_str())]),
                datapoints: vec![Datapoint {
                    timestamp: point.timestamp,
                    value: point.value,
                }],
            })
            .collect();

        PostMetricDataDetails {
            metric_data,
            batch_atomicity: NON_ATOMIC,
        }
    }
}

#[async_trait]
impl MetricSink for MonitoringClient {
    async fn publish(&self, batch: &[MetricDatapoint]) -> Result<(), PublishError> {
        if batch.is_empty() {
            log::warn!("No metrics to send.");
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.metrics_url.clone())
            .json(&self.request_body(batch))
            .build()?;
        self.auth.apply(&mut request)?;
        let response = self.client.execute(request).await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Status { status, body });
        }

        let details: PostMetricDataResponseDetails = response.json().await?;
        let total = batch.len();
        let failed = details.failed_metrics_count;
        let messages = details.failed_metrics.into_iter().map(|f| f.message).collect();

        match failed {
            0 => Ok(()),
            f if f >= total => Err(PublishError::Rejected { total, messages }),
            f => Err(PublishError::Partial {
                failed: f,
                total,
                messages,
            }),
        }
    }
}

/// Looks up the compartment a function is deployed in, so the metric lands next
/// to the function that produced it.
pub async fn lookup_compartment_id(
    client: &Client,
    functions_endpoint: &Url,
    function_id: &str,
    auth: &RequestAuth,
) -> Result<String, PublishError> {
    let url = service_url(functions_endpoint, &format!("{GET_FUNCTION_PATH}{function_id}"))?;

    let mut request = client.get(url).build()?;
    auth.apply(&mut request)?;
    let response = client.execute(request).await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(PublishError::Lookup(format!("{status} - {body}")));
    }

    let details: FunctionDetails = response.json().await?;
    Ok(details.compartment_id)
}
