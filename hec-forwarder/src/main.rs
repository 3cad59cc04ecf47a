use std::time::Duration;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use health::HealthRegistry;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use hec_forwarder::broker::BrokerConsumer;
use hec_forwarder::config::Config;
use hec_forwarder::ingest::IngestClient;
use hec_forwarder::provision::{build_admin_client, provision};
use hec_forwarder::reporter::ThroughputReporter;
use hec_forwarder::serve::{probe_routes, serve, setup_metrics_routes};
use hec_forwarder::transcode::Transcoder;
use hec_forwarder::worker::{run_workers, WorkerSettings};

const WORKER_HEARTBEAT: Duration = Duration::from_secs(5);

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    }
    Ok(())
}

fn warn_about_config(config: &Config) {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    if config.workers() > cores / 2 {
        warn!(
            "{} workers on {} cores, throughput may be limited by cpu",
            config.workers(),
            cores
        );
    }
    if config.ingest.tls_insecure {
        warn!("INGEST_TLS_INSECURE is set, ingestion endpoint certificates will not be verified");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().wrap_err("failed to load configuration")?;
    let workers = config.workers();
    info!(
        broker = ?config.broker,
        ingest_url = config.ingest.url.as_str(),
        workers,
        output_mode = ?config.output_mode,
        "Configuration loaded"
    );
    warn_about_config(&config);

    let admin = build_admin_client(config.broker.admin_timeout.0)
        .wrap_err("failed to build broker admin client")?;
    provision(&admin, &config.broker)
        .await
        .wrap_err("failed to provision broker vhost")?;

    let ingest = IngestClient::new(&config.ingest, workers)
        .wrap_err("failed to build ingestion client")?;
    if config.ingest.health_check {
        ingest
            .check_connectivity()
            .await
            .wrap_err_with(|| format!("ingestion endpoint {} is not usable", ingest.url()))?;
        info!("ingestion endpoint {} accepted the connectivity check", ingest.url());
    }

    let consumer = BrokerConsumer::connect(&config.broker, workers)
        .await
        .wrap_err("failed to start consuming")?;

    let liveness = HealthRegistry::new("liveness");
    let router = setup_metrics_routes(probe_routes(liveness.clone()))
        .wrap_err("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("probe server on {} failed: {}", bind, e);
        }
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = shutdown_signal().await {
                error!("failed to listen for shutdown signals: {}", e);
            }
            shutdown.cancel();
        }
    });

    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let reporter = ThroughputReporter::new(
        config.broker.exchange.as_str(),
        config.report_interval.0,
        liveness.register(
            "reporter".to_string(),
            time::Duration::seconds(30).max(
                time::Duration::try_from(config.report_interval.0 * 3)
                    .unwrap_or(time::Duration::seconds(30)),
            ),
        ),
    );
    let reporter = tokio::spawn(reporter.run(results_rx));

    let settings = WorkerSettings {
        transcoder: Transcoder::new(config.ingest.hec_metadata),
        output_mode: config.output_mode,
        failure_policy: config.transcode_failure_policy,
        heartbeat: WORKER_HEARTBEAT,
        request_timeout: config.ingest.request_timeout.0,
    };
    let outcome = run_workers(
        workers,
        consumer.deliveries(),
        ingest,
        settings,
        results_tx,
        &liveness,
        shutdown,
    )
    .await;

    if let Err(e) = reporter.await {
        error!("throughput reporter failed: {}", e);
    }
    if let Err(e) = consumer.close().await {
        warn!("failed to close broker connection cleanly: {}", e);
    }

    outcome.wrap_err("delivery workers stopped")?;
    info!("Shut down cleanly");
    Ok(())
}
