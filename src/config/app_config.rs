use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{net::IpAddr, time::Duration};

use thiserror::Error;
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};
use url::Url;

use super::model::FileConfig;
use crate::cert_probe::backoff::{BackoffPolicy, DEFAULT_MAX_RETRIES};
use crate::cert_probe::endpoint::Endpoint;
use crate::cert_probe::probe::DEFAULT_CONNECT_TIMEOUT;
use crate::scheduler::DEFAULT_ENDPOINT_TIMEOUT;

const DEFAULT_CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML config")]
    Yaml(#[from] serde_yaml::Error),
}

/// Where the metric destination comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompartmentSource {
    Fixed(String),
    /// Looked up at startup from the function's own metadata.
    FromFunction { function_id: String, functions_endpoint: Url },
}

/// How requests to the monitoring and functions APIs are authenticated.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthSource {
    Anonymous,
    /// Sent verbatim as the `Authorization` header.
    Token(String),
    /// OCI resource principal. Each value holds either the content itself or
    /// an absolute path to a file with the content.
    ResourcePrincipal {
        rpst: String,
        private_pem: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthSource::Anonymous => f.write_str("Anonymous"),
            AuthSource::Token(_) => f.write_str("Token(..)"),
            AuthSource::ResourcePrincipal { .. } => f.write_str("ResourcePrincipal(..)"),
        }
    }
}

/// Everything the service needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Canonical `host:port` strings, de-duplicated, in configured order.
    pub endpoints: Vec<String>,
    pub namespace: String,
    pub metric_name: String,
    pub compartment: CompartmentSource,
    pub ingestion_endpoint: Url,
    pub auth: AuthSource,
    pub dns_hosts: Vec<IpAddr>,
    pub connect_timeout: Duration,
    pub endpoint_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub polling_interval: Option<Duration>,
}

/// Load the application configuration from `.env`, an optional YAML file and
/// environment variables, in increasing order of precedence.
///
/// The YAML file is named by `CONFIG_FILE`. Without it `config.yml` is used when
/// present and skipped otherwise.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    if let Ok(path) = dotenvy::dotenv() {
        log::debug!("Loaded environment from {}", path.display());
    }

    let file = match env::var("CONFIG_FILE") {
        Ok(path) if !path.trim().is_empty() => read_file_config(Path::new(path.trim()))?,
        _ if Path::new(DEFAULT_CONFIG_FILE).exists() => read_file_config(Path::new(DEFAULT_CONFIG_FILE))?,
        _ => FileConfig::default(),
    };

    AppConfig::from_sources(file, |key| env::var(key).ok())
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Using config file {}", path.display());
    Ok(serde_yaml::from_str(&config_str)?)
}

impl AppConfig {
    /// Builds the config from file values overlaid with `env`. Blank
    /// environment values count as unset.
    pub fn from_sources<F>(file: FileConfig, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let raw_endpoints: Vec<String> = match var("ENDPOINTS").or_else(|| var("ENDPOINT")) {
            Some(list) => list.split(',').map(str::to_string).collect(),
            None => file.endpoints,
        };
        let endpoints = canonical_endpoints(&raw_endpoints)?;
        if endpoints.is_empty() {
            return Err(ConfigError::Missing("ENDPOINTS"));
        }

        let namespace = var("NAMESPACE")
            .or(file.namespace)
            .ok_or(ConfigError::Missing("NAMESPACE"))?;
        let metric_name = var("METRIC_NAME")
            .or(file.metric_name)
            .ok_or(ConfigError::Missing("METRIC_NAME"))?;

        let region = var("OCI_RESOURCE_PRINCIPAL_REGION")
            .or_else(|| var("REGION"))
            .or(file.region);

        let ingestion_endpoint = match var("INGESTION_ENDPOINT").or(file.ingestion_endpoint) {
            Some(url) => parse_url("INGESTION_ENDPOINT", &url)?,
            None => match &region {
                Some(region) => parse_url(
                    "OCI_RESOURCE_PRINCIPAL_REGION",
                    &format!("https://telemetry-ingestion.{region}.oraclecloud.com"),
                )?,
                None => return Err(ConfigError::Missing("INGESTION_ENDPOINT or OCI_RESOURCE_PRINCIPAL_REGION")),
            },
        };

        let compartment = match var("COMPARTMENT_ID").or(file.compartment_id) {
            Some(id) => CompartmentSource::Fixed(id),
            None => {
                let function_id = var("FN_FN_ID").ok_or(ConfigError::Missing("COMPARTMENT_ID or FN_FN_ID"))?;
                let functions_endpoint = match var("FUNCTIONS_ENDPOINT").or(file.functions_endpoint) {
                    Some(url) => parse_url("FUNCTIONS_ENDPOINT", &url)?,
                    None => match &region {
                        Some(region) => parse_url(
                            "OCI_RESOURCE_PRINCIPAL_REGION",
                            &format!("https://functions.{region}.oci.oraclecloud.com"),
                        )?,
                        None => return Err(ConfigError::Missing("FUNCTIONS_ENDPOINT or OCI_RESOURCE_PRINCIPAL_REGION")),
                    },
                };
                CompartmentSource::FromFunction {
                    function_id,
                    functions_endpoint,
                }
            }
        };

        let auth = match var("AUTH_TOKEN") {
            Some(token) => AuthSource::Token(token),
            None => match (var("OCI_RESOURCE_PRINCIPAL_RPST"), var("OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM")) {
                (Some(rpst), Some(private_pem)) => AuthSource::ResourcePrincipal {
                    rpst,
                    private_pem,
                    passphrase: var("OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM_PASSPHRASE"),
                },
                (Some(_), None) => return Err(ConfigError::Missing("OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM")),
                (None, Some(_)) => return Err(ConfigError::Missing("OCI_RESOURCE_PRINCIPAL_RPST")),
                (None, None) => AuthSource::Anonymous,
            },
        };

        let dns_hosts = match var("DNS_HOSTS") {
            Some(list) => list.split(',').map(str::trim).filter(|h| !h.is_empty()).map(str::to_string).collect(),
            None => file.dns_hosts,
        }
        .iter()
        .map(|host| parse_value::<IpAddr>("DNS_HOSTS", host))
        .collect::<Result<Vec<_>, _>>()?;

        let connect_timeout = match var("CONNECT_TIMEOUT_SECONDS") {
            Some(v) => Duration::from_secs(parse_value("CONNECT_TIMEOUT_SECONDS", &v)?),
            None => file
                .connect_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        };
        let endpoint_timeout = match var("ENDPOINT_TIMEOUT_SECONDS") {
            Some(v) => Duration::from_secs(parse_value("ENDPOINT_TIMEOUT_SECONDS", &v)?),
            None => file
                .endpoint_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_ENDPOINT_TIMEOUT),
        };
        let max_retries = match var("MAX_RETRIES") {
            Some(v) => parse_value("MAX_RETRIES", &v)?,
            None => file.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        };
        let polling_interval = match var("POLLING_INTERVAL_SECONDS") {
            Some(v) => Some(parse_value::<u64>("POLLING_INTERVAL_SECONDS", &v)?),
            None => file.polling_interval_seconds,
        }
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

        Ok(AppConfig {
            endpoints,
            namespace,
            metric_name,
            compartment,
            ingestion_endpoint,
            auth,
            dns_hosts,
            connect_timeout,
            endpoint_timeout,
            backoff: BackoffPolicy {
                max_retries,
                ..BackoffPolicy::default()
            },
            polling_interval,
        })
    }
}

fn canonical_endpoints(raw: &[String]) -> Result<Vec<String>, ConfigError> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for entry in raw.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        let endpoint = Endpoint::from_config(entry).map_err(|e| ConfigError::Invalid {
            key: "ENDPOINTS",
            value: entry.to_string(),
            reason: e.to_string(),
        })?;
        let canonical = endpoint.to_string();
        if seen.insert(canonical.clone()) {
            endpoints.push(canonical);
        } else {
            log::warn!("Ignoring duplicate endpoint '{entry}' ({canonical})");
        }
    }

    Ok(endpoints)
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_url(key: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = parse_value::<Url>(key, value)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected an http(s) URL".to_string(),
        });
    }
    Ok(url)
}

/// Setup a TLS connector that accepts invalid certificates and host names.
pub fn setup_tls_connector() -> Result<TokioTlsConnector, native_tls::Error> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(true);
    builder.danger_accept_invalid_hostnames(true);
    let connector = builder.build()?;
    Ok(TokioTlsConnector::from(connector))
}

/// Setup a DNS resolver for the probes.
///
/// With no `dns_hosts` the system configuration is used. Otherwise the given
/// name servers are queried over TCP with 2 attempts, a 100 ms timeout and a
/// cache of 1024 entries.
pub fn setup_resolver(dns_hosts: &[IpAddr]) -> Result<TokioAsyncResolver, Box<dyn std::error::Error>> {
    if dns_hosts.is_empty() {
        return Ok(TokioAsyncResolver::tokio_from_system_conf()?);
    }

    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_millis(100);
    opts.cache_size = 1024;

    let mut name_servers = NameServerConfigGroup::new();

    for ip in dns_hosts {
        name_servers.push(NameServerConfig {
            socket_addr: (*ip, 53).into(),
            protocol: Protocol::Tcp,
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    Ok(TokioAsyncResolver::tokio(resolver_config, opts))
}
