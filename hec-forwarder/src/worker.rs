use std::time;

use health::{ComponentStatus, HealthHandle, HealthRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Delivery, DeliveryStream};
use crate::config::{FailurePolicy, OutputMode};
use crate::error::{AckError, TranscodeError, WorkerError};
use crate::ingest::IngestClient;
use crate::metrics_consts::{
    DELIVERIES_EMPTY, DELIVERIES_FORWARDED, DELIVERIES_RECEIVED, DELIVERIES_REDELIVERED,
    DELIVERIES_REJECTED, RECORDS_FORWARDED, RECORDS_PER_DELIVERY, REQUEST_BYTES, SEND_FAILED,
    SEND_TIME, TRANSCODE_FAILED,
};
use crate::reporter::{Outcome, ProcessResult};
use crate::transcode::{decode, Transcoded, Transcoder};

/// Settings shared by every worker of the pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub transcoder: Transcoder,
    pub output_mode: OutputMode,
    pub failure_policy: FailurePolicy,
    /// How often an idle worker reports itself live.
    pub heartbeat: time::Duration,
    /// Upper bound of one send, a worker is silent for at most this long.
    pub request_timeout: time::Duration,
}

// Slack on top of the request timeout for transcoding and acknowledgement.
const LIVENESS_MARGIN: time::Duration = time::Duration::from_secs(10);

/// How long a worker may go without reporting before it counts as stalled. Covers
/// a send that runs to its full timeout.
pub fn liveness_deadline(settings: &WorkerSettings) -> ::time::Duration {
    let deadline = time::Duration::from_secs(30)
        .max(settings.heartbeat.saturating_mul(3))
        .max(settings.request_timeout.saturating_add(LIVENESS_MARGIN));
    ::time::Duration::try_from(deadline).unwrap_or(::time::Duration::MAX)
}

/// Takes deliveries off the shared stream one at a time, forwards them, and
/// acknowledges them. Workers never share a delivery.
pub struct DeliveryWorker {
    /// An identifier for this worker, used in logs.
    name: String,
    deliveries: DeliveryStream,
    ingest: IngestClient,
    settings: WorkerSettings,
    /// Where the result of each delivery goes, for throughput reporting.
    results: mpsc::UnboundedSender<ProcessResult>,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl DeliveryWorker {
    pub fn new(
        name: &str,
        deliveries: DeliveryStream,
        ingest: IngestClient,
        settings: WorkerSettings,
        results: mpsc::UnboundedSender<ProcessResult>,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            deliveries,
            ingest,
            settings,
            results,
            liveness,
        }
    }

    /// Process deliveries until shutdown is requested or the stream ends. A delivery
    /// taken off the stream is always finished before checking for shutdown again.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("{} stopping on shutdown", self.name);
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
                next = self.deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => {
                    self.liveness.report_healthy();
                    delivery
                }
                Some(Err(error)) => {
                    error!("{} lost the broker consumer: {}", self.name, error);
                    self.liveness.report_status(ComponentStatus::Unhealthy);
                    return Err(WorkerError::Consume(error));
                }
                None => {
                    info!("{} stopping, delivery stream ended", self.name);
                    return Ok(());
                }
            };

            let result = match self.process(delivery).await {
                Ok(result) => result,
                Err(error) => {
                    error!("{} could not finalize a delivery: {}", self.name, error);
                    self.liveness.report_status(ComponentStatus::Unhealthy);
                    return Err(WorkerError::Ack(error));
                }
            };
            self.liveness.report_healthy();

            if self.results.send(result).is_err() {
                warn!("{} has no reporter to send results to", self.name);
            }
        }
    }

    /// Forward one delivery and finalize it at the broker. Transcode and send
    /// failures are logged and the delivery is still finalized. Only a failure to
    /// finalize is returned.
    pub async fn process(&self, delivery: Delivery) -> Result<ProcessResult, AckError> {
        metrics::counter!(DELIVERIES_RECEIVED).increment(1);
        if delivery.redelivered {
            metrics::counter!(DELIVERIES_REDELIVERED).increment(1);
        }

        let transcoded = match self.transcode(&delivery) {
            Ok(transcoded) => transcoded,
            Err(error) => {
                metrics::counter!(TRANSCODE_FAILED).increment(1);
                warn!(
                    "{} dropping delivery {}: {}",
                    self.name, delivery.tag, error
                );
                match self.settings.failure_policy {
                    FailurePolicy::Ack => delivery.ack().await?,
                    FailurePolicy::Reject => {
                        metrics::counter!(DELIVERIES_REJECTED).increment(1);
                        delivery.reject().await?
                    }
                }
                return Ok(ProcessResult {
                    record_count: 0,
                    outcome: Outcome::TranscodeFailed,
                });
            }
        };

        let record_count = transcoded.record_count;
        metrics::histogram!(RECORDS_PER_DELIVERY).record(record_count as f64);

        if record_count == 0 {
            metrics::counter!(DELIVERIES_EMPTY).increment(1);
            debug!("{} delivery {} has no records", self.name, delivery.tag);
            delivery.ack().await?;
            return Ok(ProcessResult {
                record_count,
                outcome: Outcome::Empty,
            });
        }

        metrics::histogram!(REQUEST_BYTES).record(transcoded.body.len() as f64);
        let started = time::Instant::now();
        let sent = self.ingest.send(transcoded.body).await;
        metrics::histogram!(SEND_TIME).record(started.elapsed().as_millis() as f64);

        let outcome = match sent {
            Ok(status) => {
                metrics::counter!(DELIVERIES_FORWARDED).increment(1);
                metrics::counter!(RECORDS_FORWARDED).increment(record_count as u64);
                if self.settings.output_mode != OutputMode::Rates {
                    info!(
                        "{} forwarded delivery {} with {} records: {}",
                        self.name, delivery.tag, record_count, status
                    );
                }
                Outcome::Forwarded
            }
            Err(error) => {
                let status = error
                    .status()
                    .map(|s| s.as_u16().to_string())
                    .unwrap_or_else(|| "none".to_owned());
                metrics::counter!(SEND_FAILED, &[("status", status)]).increment(1);
                error!(
                    "{} dropping delivery {} with {} records: {}",
                    self.name, delivery.tag, record_count, error
                );
                Outcome::SendFailed
            }
        };

        // Acknowledged even when the send failed, the delivery is not retried.
        delivery.ack().await?;

        Ok(ProcessResult {
            record_count,
            outcome,
        })
    }

    fn transcode(&self, delivery: &Delivery) -> Result<Transcoded, TranscodeError> {
        let decoded = decode(&delivery.payload, &delivery.encoding)?;
        if self.settings.output_mode == OutputMode::Debug {
            info!(
                "{} delivery {} payload: {}",
                self.name,
                delivery.tag,
                String::from_utf8_lossy(&decoded)
            );
        }
        self.settings.transcoder.wrap(&decoded)
    }
}

/// Run `count` workers over the same deliveries until the stream ends or shutdown is
/// requested. The first worker to fail cancels the others, and its error is returned
/// once they have all stopped.
pub async fn run_workers(
    count: usize,
    deliveries: DeliveryStream,
    ingest: IngestClient,
    settings: WorkerSettings,
    results: mpsc::UnboundedSender<ProcessResult>,
    liveness: &HealthRegistry,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let deadline = liveness_deadline(&settings);

    let mut workers = JoinSet::new();
    for index in 0..count {
        let name = format!("worker-{index}");
        let worker = DeliveryWorker::new(
            &name,
            deliveries.clone(),
            ingest.clone(),
            settings,
            results.clone(),
            liveness.register(name.clone(), deadline),
        );
        workers.spawn(worker.run(shutdown.clone()));
    }
    // Workers hold the remaining senders, the reporter stops once they are gone.
    drop(results);

    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        let outcome = joined.map_err(WorkerError::from).and_then(|result| result);
        if let Err(error) = outcome {
            shutdown.cancel();
            if first_error.is_none() {
                first_error = Some(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}
