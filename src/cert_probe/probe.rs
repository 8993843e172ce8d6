use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::TokioAsyncResolver;
use x509_parser::parse_x509_certificate;

use super::prelude::*;

const SECONDS_PER_DAY: i64 = 86_400;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The parts of a leaf certificate the probe cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertificate {
    pub subject: String,
    pub not_after: DateTime<Utc>,
}

impl LeafCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, parsed) = parse_x509_certificate(der).map_err(|e| e.to_string())?;

        let not_after = parsed.validity().not_after.timestamp();
        let not_after = DateTime::from_timestamp(not_after, 0)
            .ok_or_else(|| format!("notAfter {not_after} is out of range"))?;

        Ok(Self {
            subject: parsed.subject().to_string(),
            not_after,
        })
    }

    /// Whole days until `not_after`, floored. Negative once expired, zero when
    /// less than a day is left.
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_seconds().div_euclid(SECONDS_PER_DAY)
    }
}

#[derive(Debug)]
pub enum FetchError {
    /// TCP connect or TLS handshake failed. Worth retrying.
    Connect(BoxError),
    /// The handshake worked but the presented certificate could not be read.
    Certificate(String),
}

/// Performs one connection attempt and hands back the peer's leaf certificate,
/// or `None` when the peer presented no chain at all.
#[async_trait]
pub trait CertificateFetcher: Send + Sync {
    async fn fetch_leaf(&self, endpoint: &Endpoint) -> Result<Option<LeafCertificate>, FetchError>;
}

/// Fetches certificates over a real TLS connection. Trust and hostname checks
/// are switched off in the connector, so self-signed and expired certificates
/// can still be measured.
pub struct NativeTlsFetcher {
    connector: TokioTlsConnector,
    resolver: TokioAsyncResolver,
    connect_timeout: Duration,
}

impl NativeTlsFetcher {
    /// `connect_timeout` is split evenly over the resolved addresses, so a
    /// blackholed address can't starve the ones after it.
    pub fn new(connector: TokioTlsConnector, resolver: TokioAsyncResolver, connect_timeout: Duration) -> Self {
        Self {
            connector,
            resolver,
            connect_timeout,
        }
    }

    async fn resolve(&self, endpoint: &Endpoint) -> Result<Vec<SocketAddr>, BoxError> {
        if let Some(ip) = endpoint.ip() {
            return Ok(vec![SocketAddr::new(ip, endpoint.port())]);
        }

        let lookup = self.resolver.lookup_ip(endpoint.host()).await?;
        let addrs: Vec<SocketAddr> = lookup
            .iter()
            .map(|ip| SocketAddr::new(ip, endpoint.port()))
            .collect();

        if addrs.is_empty() {
            return Err(format!("no addresses found for {}", endpoint.host()).into());
        }
        Ok(addrs)
    }
}

/// Tries `addrs` in order, giving each an equal share of `budget`, and returns
/// the first connection that succeeds.
async fn connect_any<S, C, F>(addrs: &[SocketAddr], budget: Duration, connect: C) -> Result<S, BoxError>
where
    C: Fn(SocketAddr) -> F,
    F: Future<Output = std::io::Result<S>>,
{
    let share = budget / u32::try_from(addrs.len()).unwrap_or(u32::MAX).max(1);
    let mut last_error: Option<BoxError> = None;

    for &addr in addrs {
        match timeout(share, connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                log::debug!("TCP connect to {addr} failed: {e}");
                last_error = Some(e.into());
            }
            Err(_) => {
                log::debug!("TCP connect to {addr} timed out after {share:?}");
                last_error = Some(format!("connect to {addr} timed out after {share:?}").into());
            }
        }
    }
    Err(last_error.unwrap_or_else(|| "no addresses to connect to".into()))
}

#[async_trait]
impl CertificateFetcher for NativeTlsFetcher {
    async fn fetch_leaf(&self, endpoint: &Endpoint) -> Result<Option<LeafCertificate>, FetchError> {
        let addrs = self.resolve(endpoint).await.map_err(FetchError::Connect)?;
        let stream = connect_any(&addrs, self.connect_timeout, TcpStream::connect)
            .await
            .map_err(FetchError::Connect)?;

        let tls_stream = self
            .connector
            .connect(endpoint.host(), stream)
            .await
            .map_err(|e| FetchError::Connect(e.into()))?;

        let cert = tls_stream
            .get_ref()
            .peer_certificate()
            .map_err(|e| FetchError::Certificate(e.to_string()))?;
        let Some(cert) = cert else {
            return Ok(None);
        };

        let der = cert
            .to_der()
            .map_err(|e| FetchError::Certificate(e.to_string()))?;
        LeafCertificate::from_der(&der)
            .map(Some)
            .map_err(FetchError::Certificate)
    }
}

/// Resolves the expiry horizon of one endpoint, retrying failed connections
/// according to its [`BackoffPolicy`].
#[derive(Clone)]
pub struct CertificateProbe {
    fetcher: Arc<dyn CertificateFetcher>,
    connect_timeout: Duration,
    backoff: BackoffPolicy,
}

impl CertificateProbe {
    pub fn new(
        fetcher: Arc<dyn CertificateFetcher>,
        connect_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            fetcher,
            connect_timeout,
            backoff,
        }
    }

    /// Probes without an outer deadline. Still bounded by the per-attempt
    /// connect timeout and the retry budget.
    pub async fn probe(&self, endpoint: &str) -> ProbeResult {
        ProbeResult {
            endpoint: endpoint.to_string(),
            outcome: self.days_remaining(endpoint).await,
        }
    }

    /// Probes until `deadline`. When the deadline fires first the in-flight
    /// attempt (or backoff wait) is dropped, which closes its socket, and the
    /// result is [`ProbeError::Timeout`].
    pub async fn probe_until(&self, endpoint: &str, deadline: Instant) -> ProbeResult {
        let outcome = match timeout_at(deadline, self.days_remaining(endpoint)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                log::debug!("[{endpoint}] deadline reached, abandoning probe");
                Err(ProbeError::Timeout)
            }
        };

        ProbeResult {
            endpoint: endpoint.to_string(),
            outcome,
        }
    }

    async fn days_remaining(&self, input: &str) -> Result<i64, ProbeError> {
        let endpoint = Endpoint::parse(input)?;
        let mut retry = self.backoff.start();

        loop {
            log::debug!(
                "[{endpoint}] connecting (attempt {}/{})",
                retry.attempts_made(),
                self.backoff.max_attempts()
            );

            let attempt = match timeout(self.connect_timeout, self.fetcher.fetch_leaf(&endpoint)).await {
                Ok(attempt) => attempt,
                Err(_) => Err(FetchError::Connect(
                    format!("no TLS handshake within {:?}", self.connect_timeout).into(),
                )),
            };

            match attempt {
                Ok(Some(leaf)) => {
                    let days = leaf.days_remaining(Utc::now());
                    log::debug!(
                        "[{endpoint}] leaf '{}' expires {} ({days} days)",
                        leaf.subject,
                        leaf.not_after
                    );
                    return Ok(days);
                }
                Ok(None) => return Err(ProbeError::NoCertificate),
                Err(FetchError::Certificate(reason)) => {
                    return Err(ProbeError::InvalidCertificate(reason));
                }
                Err(FetchError::Connect(source)) => {
                    let attempts = retry.attempts_made();
                    match retry.next_delay() {
                        Some(delay) => {
                            log::warn!(
                                "Retrying connection to '{endpoint}' (attempt {attempts}/{}) in {delay:?}: {source}",
                                self.backoff.max_attempts()
                            );
                            sleep(delay).await;
                        }
                        None => return Err(ProbeError::ConnectionFailed { attempts, source }),
                    }
                }
            }
        }
    }
}
