use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid endpoint '{0}', expected host:port")]
    InvalidFormat(String),

    #[error("failed to connect after {attempts} attempts")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("no certificate presented by peer")]
    NoCertificate,

    #[error("unreadable peer certificate: {0}")]
    InvalidCertificate(String),

    #[error("timed out before the certificate could be read")]
    Timeout,

    #[error("probe task failed: {0}")]
    TaskFailed(String),
}

/// Outcome of probing one endpoint. `endpoint` is the string the probe was
/// handed, so results can always be matched back to their input.
#[derive(Debug)]
pub struct ProbeResult {
    pub endpoint: String,
    pub outcome: Result<i64, ProbeError>,
}

impl ProbeResult {
    pub fn success(endpoint: impl Into<String>, days_remaining: i64) -> Self {
        Self {
            endpoint: endpoint.into(),
            outcome: Ok(days_remaining),
        }
    }

    pub fn failure(endpoint: impl Into<String>, error: ProbeError) -> Self {
        Self {
            endpoint: endpoint.into(),
            outcome: Err(error),
        }
    }

    pub fn days_remaining(&self) -> Option<i64> {
        self.outcome.as_ref().ok().copied()
    }

    pub fn error(&self) -> Option<&ProbeError> {
        self.outcome.as_ref().err()
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(days) => write!(f, "{}: {} days remaining", self.endpoint, days),
            Err(e) => write!(f, "{}: error — {}", self.endpoint, super::report(e)),
        }
    }
}
