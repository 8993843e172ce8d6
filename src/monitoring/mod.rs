use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cert_probe::endpoint::Endpoint;
use crate::scheduler::ScanReport;

pub mod client;
pub mod signer;

pub use client::{MonitoringClient, PublishError};
pub use signer::{RequestAuth, RequestSigner, SignError};

pub const RESOURCE_ID_DIMENSION: &str = "resourceId";

/// One value for one monitored endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricDatapoint {
    pub namespace: String,
    pub name: String,
    pub resource_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Destination for metric data points.
///
/// A batch either lands completely, partially ([`PublishError::Partial`]) or
/// not at all.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn publish(&self, batch: &[MetricDatapoint]) -> Result<(), PublishError>;
}

/// Creates the days-until-expiry data point for an endpoint, stamped with the
/// current UTC time. The resource id is the canonical `host:port` form.
pub fn create_expiry_datapoint(
    namespace: &str,
    metric_name: &str,
    endpoint: &str,
    days_remaining: i64,
) -> MetricDatapoint {
    let resource_id = Endpoint::parse(endpoint)
        .map(|e| e.to_string())
        .unwrap_or_else(|_| endpoint.to_string());

    MetricDatapoint {
        namespace: namespace.to_string(),
        name: metric_name.to_string(),
        resource_id,
        value: days_remaining as f64,
        timestamp: Utc::now(),
    }
}

/// Failed deliveries, keyed by the endpoint they belonged to.
#[derive(Debug, Default)]
pub struct PublishSummary {
    pub published: usize,
    pub failed: Vec<(String, PublishError)>,
}

/// Publishes one data point per successful probe. A failed delivery is logged
/// against its endpoint and does not stop the remaining ones.
pub async fn publish_expiry_metrics(
    sink: &dyn MetricSink,
    namespace: &str,
    metric_name: &str,
    report: &ScanReport,
) -> PublishSummary {
    let mut summary = PublishSummary::default();

    for (endpoint, days) in report.successes() {
        let datapoint = create_expiry_datapoint(namespace, metric_name, endpoint, days);
        match sink.publish(std::slice::from_ref(&datapoint)).await {
            Ok(()) => {
                log::debug!("Published {metric_name}={days} for {endpoint}");
                summary.published += 1;
            }
            Err(e) => {
                log::error!(
                    "Failed to publish metric for {endpoint}: {}",
                    crate::cert_probe::report(&e)
                );
                summary.failed.push((endpoint.to_string(), e));
            }
        }
    }

    summary
}
