use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use env_logger::Env;
use tokio::signal::ctrl_c;
use tokio::time::sleep;

pub mod cert_probe;
use cert_probe::{prelude::*, report};
pub mod config;
use config::{
    AppConfig, CompartmentSource, load_config,
    app_config::{setup_resolver, setup_tls_connector},
};
pub mod monitoring;
use monitoring::{
    MetricSink, MonitoringClient, RequestAuth,
    client::{http_client, lookup_compartment_id},
    publish_expiry_metrics,
};
pub mod scheduler;
use scheduler::{EndpointScheduler, ScanReport};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", report(e.as_ref()));
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    log::info!(
        "Checking {} endpoint(s), publishing {}/{} to {}",
        config.endpoints.len(),
        config.namespace,
        config.metric_name,
        config.ingestion_endpoint
    );

    let tls_connector = setup_tls_connector()?;
    let resolver = setup_resolver(&config.dns_hosts)?;
    let fetcher = Arc::new(NativeTlsFetcher::new(tls_connector, resolver, config.connect_timeout));
    let probe = CertificateProbe::new(fetcher, config.connect_timeout, config.backoff);
    let scheduler = EndpointScheduler::new(probe, config.endpoint_timeout);

    let auth = RequestAuth::from_source(&config.auth)?;
    if matches!(auth, RequestAuth::Anonymous) {
        log::warn!("No AUTH_TOKEN or resource principal configured, sending unauthenticated requests");
    }
    let http = http_client()?;
    let compartment_id = match &config.compartment {
        CompartmentSource::Fixed(id) => id.clone(),
        CompartmentSource::FromFunction {
            function_id,
            functions_endpoint,
        } => {
            let id = lookup_compartment_id(&http, functions_endpoint, function_id, &auth).await?;
            log::info!("Resolved compartment {id} from function {function_id}");
            id
        }
    };
    let sink = MonitoringClient::new(http, &config.ingestion_endpoint, compartment_id, auth)?;

    loop {
        tokio::select! {
            _ = run_once(&config, &scheduler, &sink) => {}
            _ = ctrl_c() => {
                log::warn!("Interrupted, abandoning the running scan");
                return Ok(());
            }
        }

        let Some(interval) = config.polling_interval else {
            return Ok(());
        };
        tokio::select! {
            _ = sleep(interval) => {}
            _ = ctrl_c() => return Ok(()),
        }
    }
}

async fn run_once(config: &AppConfig, scheduler: &EndpointScheduler, sink: &dyn MetricSink) {
    let started = Instant::now();
    let scan = ScanReport::new(scheduler.run(&config.endpoints).await);

    for result in &scan.results {
        match &result.outcome {
            Ok(days) => log::info!("Days remaining for {}: {days}", result.endpoint),
            Err(e) => log::error!("Failed to process endpoint: {}: {}", result.endpoint, report(e)),
        }
        println!("{result}");
    }

    let published = publish_expiry_metrics(sink, &config.namespace, &config.metric_name, &scan).await;

    log::info!(
        "Scan of {} endpoint(s) finished in {:.2}s: {} ok, {} failed, {} published, {} not published",
        scan.len(),
        started.elapsed().as_secs_f64(),
        scan.successes().count(),
        scan.failures().count(),
        published.published,
        published.failed.len()
    );
}
