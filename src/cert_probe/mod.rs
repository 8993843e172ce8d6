pub mod backoff;
pub mod endpoint;
pub mod probe;
pub mod result;

pub mod prelude {
    pub use super::backoff::{BackoffPolicy, RetryState};
    pub use super::endpoint::Endpoint;
    pub use super::probe::{CertificateFetcher, CertificateProbe, FetchError, LeafCertificate, NativeTlsFetcher};
    pub use super::result::{BoxError, ProbeError, ProbeResult};
}

use std::fmt::Write;

/// Renders an error and its chain of causes on a single line.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, ". Caused by: {}", src);
        err = src;
    }
    s
}
