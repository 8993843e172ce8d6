use serde::Deserialize;

/// Settings read from the optional YAML file named by `CONFIG_FILE`.
/// Every field may be overridden by the matching environment variable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Endpoints to check, as `host` or `host:port`.
    pub endpoints: Vec<String>,

    /// Metric namespace the data points are posted under.
    pub namespace: Option<String>,

    pub metric_name: Option<String>,

    /// Destination compartment. Looked up from the function id when absent.
    pub compartment_id: Option<String>,

    /// Region used to derive the default service hosts.
    pub region: Option<String>,

    pub ingestion_endpoint: Option<String>,
    pub functions_endpoint: Option<String>,

    /// Resolver IPs. The system resolver is used when empty.
    pub dns_hosts: Vec<String>,

    pub connect_timeout_seconds: Option<u64>,
    pub endpoint_timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,

    /// Repeat the scan every this many seconds instead of running once.
    pub polling_interval_seconds: Option<u64>,
}
