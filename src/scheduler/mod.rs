use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cert_probe::prelude::*;

pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(20);

/// Runs one probe task per endpoint and joins them all.
///
/// Each task gets its own deadline, so a hanging endpoint only ever costs its
/// own slot. Dropping the future returned by [`EndpointScheduler::run`] aborts
/// every task that is still in flight, closing their connections.
pub struct EndpointScheduler {
    probe: CertificateProbe,
    endpoint_timeout: Duration,
}

impl EndpointScheduler {
    pub fn new(probe: CertificateProbe, endpoint_timeout: Duration) -> Self {
        Self {
            probe,
            endpoint_timeout,
        }
    }

    /// Probes every endpoint concurrently. The returned results line up with
    /// `endpoints` index for index.
    pub async fn run(&self, endpoints: &[String]) -> Vec<ProbeResult> {
        let mut tasks = JoinSet::new();

        for (index, endpoint) in endpoints.iter().enumerate() {
            let probe = self.probe.clone();
            let endpoint = endpoint.clone();
            let deadline = Instant::now() + self.endpoint_timeout;

            tasks.spawn(async move {
                log::debug!("[{endpoint}] pending");
                let result = probe.probe_until(&endpoint, deadline).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<ProbeResult>> = endpoints.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    match &result.outcome {
                        Ok(days) => log::debug!("[{}] succeeded: {days} days", result.endpoint),
                        Err(ProbeError::Timeout) => log::debug!("[{}] timed out", result.endpoint),
                        Err(e) => log::debug!("[{}] failed: {e}", result.endpoint),
                    }
                    slots[index] = Some(result);
                }
                Err(e) => log::error!("Probe task did not complete: {e}"),
            }
        }

        slots
            .into_iter()
            .zip(endpoints)
            .map(|(slot, endpoint)| {
                slot.unwrap_or_else(|| {
                    ProbeResult::failure(
                        endpoint.clone(),
                        ProbeError::TaskFailed("probe task panicked or was aborted".to_string()),
                    )
                })
            })
            .collect()
    }
}

/// A finished scan, split into what can be published and what must be logged.
pub struct ScanReport {
    pub results: Vec<ProbeResult>,
}

impl ScanReport {
    pub fn new(results: Vec<ProbeResult>) -> Self {
        Self { results }
    }

    pub fn successes(&self) -> impl Iterator<Item = (&str, i64)> {
        self.results
            .iter()
            .filter_map(|r| r.days_remaining().map(|days| (r.endpoint.as_str(), days)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProbeError)> {
        self.results
            .iter()
            .filter_map(|r| r.error().map(|e| (r.endpoint.as_str(), e)))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Instant as StdInstant;

    use async_trait::async_trait;

    use super::*;
    use crate::cert_probe::probe::test_support::{ScriptedFetcher, Step, leaf_expiring_in};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Leaf(i64),
        Refuse,
        Hang,
        Panic,
    }

    /// Answers per host and remembers when each host was contacted.
    struct RoutedFetcher {
        routes: HashMap<&'static str, Behaviour>,
        calls: Mutex<Vec<(String, StdInstant)>>,
    }

    impl RoutedFetcher {
        fn new(routes: &[(&'static str, Behaviour)]) -> Self {
            Self {
                routes: routes.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_to(&self, host: &str) -> Vec<StdInstant> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(h, _)| h == host)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl CertificateFetcher for RoutedFetcher {
        async fn fetch_leaf(&self, endpoint: &Endpoint) -> Result<Option<LeafCertificate>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.host().to_string(), StdInstant::now()));
            match self.routes.get(endpoint.host()).copied().unwrap_or(Behaviour::Refuse) {
                Behaviour::Leaf(days) => Ok(Some(leaf_expiring_in(days))),
                Behaviour::Refuse => Err(FetchError::Connect("connection refused".into())),
                Behaviour::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behaviour::Panic => panic!("fetcher blew up"),
            }
        }
    }

    fn scheduler(fetcher: Arc<dyn CertificateFetcher>, base_ms: u64, timeout: Duration) -> EndpointScheduler {
        let backoff = BackoffPolicy::new(3, Duration::from_millis(base_ms), Duration::ZERO);
        let probe = CertificateProbe::new(fetcher, Duration::from_secs(5), backoff);
        EndpointScheduler::new(probe, timeout)
    }

    fn endpoints(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn returns_one_result_per_endpoint_in_order() {
        let fetcher = Arc::new(RoutedFetcher::new(&[
            ("a.example", Behaviour::Leaf(10)),
            ("b.example", Behaviour::Refuse),
            ("c.example", Behaviour::Leaf(-2)),
        ]));
        let input = endpoints(&[
            "a.example:443",
            "b.example:443",
            "no-port.example",
            "c.example:8443",
            "a.example:443",
        ]);

        let results = scheduler(fetcher, 1, Duration::from_secs(5)).run(&input).await;

        assert_eq!(results.len(), input.len());
        let returned: Vec<&str> = results.iter().map(|r| r.endpoint.as_str()).collect();
        assert_eq!(returned, input.iter().map(String::as_str).collect::<Vec<_>>());

        assert_eq!(results[0].days_remaining(), Some(10));
        assert!(matches!(results[1].error(), Some(ProbeError::ConnectionFailed { .. })));
        assert!(matches!(results[2].error(), Some(ProbeError::InvalidFormat(_))));
        assert_eq!(results[3].days_remaining(), Some(-2));
        assert_eq!(results[4].days_remaining(), Some(10));
    }

    #[tokio::test]
    async fn empty_input_returns_nothing() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Leaf(1)]));
        let results = scheduler(fetcher.clone(), 1, Duration::from_secs(1)).run(&[]).await;
        assert!(results.is_empty());
        assert_eq!(fetcher.call_count(), 0);
    }

    #[tokio::test]
    async fn failing_endpoint_does_not_hold_up_good_one() {
        let fetcher = Arc::new(RoutedFetcher::new(&[
            ("good.example", Behaviour::Leaf(30)),
            ("badhost.invalid", Behaviour::Refuse),
        ]));
        let input = endpoints(&["good.example:443", "badhost.invalid:9999"]);

        let started = StdInstant::now();
        let results = scheduler(fetcher.clone(), 200, Duration::from_secs(10)).run(&input).await;
        let elapsed = started.elapsed();

        let report = ScanReport::new(results);
        assert_eq!(report.successes().collect::<Vec<_>>(), vec![("good.example:443", 30)]);
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "badhost.invalid:9999");
        assert!(matches!(failures[0].1, ProbeError::ConnectionFailed { attempts: 4, .. }));

        // 200 + 400 + 800 ms of backoff for the bad host.
        assert!(elapsed >= Duration::from_millis(1400));
        let good = fetcher.calls_to("good.example");
        let bad = fetcher.calls_to("badhost.invalid");
        assert_eq!(good.len(), 1);
        assert_eq!(bad.len(), 4);
        assert!(good[0] < bad[1], "good endpoint waited for the bad one's retries");
        assert!(good[0] - started < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn hanging_endpoint_times_out_alone() {
        let fetcher = Arc::new(RoutedFetcher::new(&[
            ("good.example", Behaviour::Leaf(12)),
            ("slow.example", Behaviour::Hang),
        ]));
        let input = endpoints(&["slow.example:443", "good.example:443"]);

        let started = StdInstant::now();
        let results = scheduler(fetcher, 1, Duration::from_millis(200)).run(&input).await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(results[0].error(), Some(ProbeError::Timeout)));
        assert_eq!(results[1].days_remaining(), Some(12));
    }

    #[tokio::test]
    async fn panicking_probe_still_yields_a_result() {
        let fetcher = Arc::new(RoutedFetcher::new(&[
            ("boom.example", Behaviour::Panic),
            ("good.example", Behaviour::Leaf(5)),
        ]));
        let input = endpoints(&["boom.example:443", "good.example:443"]);

        let results = scheduler(fetcher, 1, Duration::from_secs(5)).run(&input).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].endpoint, "boom.example:443");
        assert!(matches!(results[0].error(), Some(ProbeError::TaskFailed(_))));
        assert_eq!(results[1].days_remaining(), Some(5));
    }

    #[tokio::test]
    async fn dropping_the_run_cancels_outstanding_probes() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Step::Hang]));
        let sched = scheduler(fetcher.clone(), 1, Duration::from_secs(60));
        let input = endpoints(&["a.example:443", "b.example:443", "c.example:443"]);

        let outcome = tokio::time::timeout(Duration::from_millis(100), sched.run(&input)).await;
        assert!(outcome.is_err());

        let mut released = false;
        for _ in 0..100 {
            if Arc::strong_count(&fetcher.live_attempts) == 1 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "aborted probes still hold their connections");
    }
}
