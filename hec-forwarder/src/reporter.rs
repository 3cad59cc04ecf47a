use std::time::Duration;

use health::HealthHandle;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::metrics_consts::{DELIVERIES_PER_SECOND, RECORDS_PER_SECOND};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by the ingestion endpoint.
    Forwarded,
    /// Held no records, nothing was sent.
    Empty,
    /// Payload could not be transcoded.
    TranscodeFailed,
    /// The endpoint could not be reached or refused the body.
    SendFailed,
}

/// What a worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub record_count: usize,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    pub total_deliveries: u64,
    pub total_records: u64,
    pub failed_deliveries: u64,
    pub deliveries_per_second: f64,
    pub records_per_second: f64,
}

/// Running totals, and the totals as of the previous sample.
#[derive(Debug)]
pub struct RunningStats {
    total_deliveries: u64,
    total_records: u64,
    failed_deliveries: u64,
    last_sample: Instant,
    last_deliveries: u64,
    last_records: u64,
    samples: u64,
}

impl RunningStats {
    pub fn new(now: Instant) -> Self {
        Self {
            total_deliveries: 0,
            total_records: 0,
            failed_deliveries: 0,
            last_sample: now,
            last_deliveries: 0,
            last_records: 0,
            samples: 0,
        }
    }

    /// Every delivery counts toward the delivery rate, only forwarded records toward the record rate.
    pub fn record(&mut self, result: ProcessResult) {
        self.total_deliveries += 1;
        match result.outcome {
            Outcome::Forwarded => self.total_records += result.record_count as u64,
            Outcome::Empty => {}
            Outcome::TranscodeFailed | Outcome::SendFailed => self.failed_deliveries += 1,
        }
    }

    /// Rates since the previous sample, which becomes `now`. A `now` before the
    /// previous sample yields zero rates and does not move it back.
    pub fn sample(&mut self, now: Instant) -> RateSample {
        let elapsed = now.saturating_duration_since(self.last_sample);
        let (deliveries_per_second, records_per_second) = if elapsed.is_zero() {
            (0.0, 0.0)
        } else {
            let secs = elapsed.as_secs_f64();
            (
                (self.total_deliveries - self.last_deliveries) as f64 / secs,
                (self.total_records - self.last_records) as f64 / secs,
            )
        };

        self.samples += 1;
        if now > self.last_sample {
            self.last_sample = now;
            self.last_deliveries = self.total_deliveries;
            self.last_records = self.total_records;
        }

        RateSample {
            total_deliveries: self.total_deliveries,
            total_records: self.total_records,
            failed_deliveries: self.failed_deliveries,
            deliveries_per_second,
            records_per_second,
        }
    }

    pub fn total_deliveries(&self) -> u64 {
        self.total_deliveries
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries
    }

    /// Number of samples taken, including the final one.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn last_sample(&self) -> Instant {
        self.last_sample
    }
}

/// Aggregates worker results and logs throughput on a fixed interval.
pub struct ThroughputReporter {
    exchange: String,
    interval: Duration,
    liveness: HealthHandle,
}

impl ThroughputReporter {
    pub fn new(exchange: &str, interval: Duration, liveness: HealthHandle) -> Self {
        // tokio intervals cannot have a zero period
        let interval = if interval.is_zero() {
            warn!("report interval of zero, reporting every second instead");
            Duration::from_secs(1)
        } else {
            interval
        };
        Self {
            exchange: exchange.to_owned(),
            interval,
            liveness,
        }
    }

    /// Run until every sender is dropped, then log one last line and return the totals.
    pub async fn run(self, mut results: mpsc::UnboundedReceiver<ProcessResult>) -> RunningStats {
        let start = Instant::now();
        let mut stats = RunningStats::new(start);
        let mut ticker = tokio::time::interval_at(start + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.liveness.report_healthy();

        loop {
            tokio::select! {
                result = results.recv() => match result {
                    Some(result) => stats.record(result),
                    None => break,
                },
                _ = ticker.tick() => {
                    self.liveness.report_healthy();
                    let sample = stats.sample(Instant::now());
                    self.emit(&sample);
                }
            }
        }

        let sample = stats.sample(Instant::now());
        info!(
            "exchange {}: stopped after {} deliveries, {} records forwarded, {} failed",
            self.exchange, sample.total_deliveries, sample.total_records, sample.failed_deliveries
        );
        stats
    }

    fn emit(&self, sample: &RateSample) {
        metrics::gauge!(DELIVERIES_PER_SECOND).set(sample.deliveries_per_second);
        metrics::gauge!(RECORDS_PER_SECOND).set(sample.records_per_second);
        info!(
            "exchange {}: {} deliveries, {:.1} deliveries/s, {:.1} records/s",
            self.exchange,
            sample.total_deliveries,
            sample.deliveries_per_second,
            sample.records_per_second
        );
    }
}

#[cfg(test)]
mod tests {
    use health::HealthRegistry;

    use super::*;

    fn forwarded(record_count: usize) -> ProcessResult {
        ProcessResult {
            record_count,
            outcome: Outcome::Forwarded,
        }
    }

    #[test]
    fn test_rates_over_the_interval() {
        let start = Instant::now();
        let mut stats = RunningStats::new(start);
        for _ in 0..50 {
            stats.record(forwarded(2));
        }

        let sample = stats.sample(start + Duration::from_secs(5));
        assert_eq!(sample.total_deliveries, 50);
        assert_eq!(sample.total_records, 100);
        assert_eq!(sample.deliveries_per_second, 10.0);
        assert_eq!(sample.records_per_second, 20.0);

        // Nothing new in the next interval
        let sample = stats.sample(start + Duration::from_secs(10));
        assert_eq!(sample.total_deliveries, 50);
        assert_eq!(sample.deliveries_per_second, 0.0);
        assert_eq!(sample.records_per_second, 0.0);
    }

    #[test]
    fn test_failures_count_as_deliveries_not_records() {
        let start = Instant::now();
        let mut stats = RunningStats::new(start);
        stats.record(forwarded(3));
        stats.record(ProcessResult {
            record_count: 4,
            outcome: Outcome::SendFailed,
        });
        stats.record(ProcessResult {
            record_count: 0,
            outcome: Outcome::TranscodeFailed,
        });
        stats.record(ProcessResult {
            record_count: 0,
            outcome: Outcome::Empty,
        });

        assert_eq!(stats.total_deliveries(), 4);
        assert_eq!(stats.total_records(), 3);
        assert_eq!(stats.failed_deliveries(), 2);
    }

    #[test]
    fn test_sample_never_moves_backwards() {
        let start = Instant::now();
        let mut stats = RunningStats::new(start + Duration::from_secs(5));
        stats.record(forwarded(1));

        let sample = stats.sample(start);
        assert_eq!(sample.deliveries_per_second, 0.0);

        let sample = stats.sample(start + Duration::from_secs(6));
        assert_eq!(sample.deliveries_per_second, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reporter_samples_on_every_tick() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("reporter".to_string(), time::Duration::seconds(30));
        let reporter = ThroughputReporter::new("alerts", Duration::from_secs(5), liveness);

        let start = Instant::now();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(reporter.run(rx));

        tx.send(forwarded(10)).unwrap();
        // Ticks at 5s and 10s
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(forwarded(4)).unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.samples(), 3);
        assert_eq!(stats.last_sample() - start, Duration::from_secs(12));
        assert_eq!(stats.total_deliveries(), 2);
        assert_eq!(stats.total_records(), 14);
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn test_reporter_drains_until_senders_are_gone() {
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("reporter".to_string(), time::Duration::seconds(30));
        let reporter = ThroughputReporter::new("alerts", Duration::from_secs(3600), liveness);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(reporter.run(rx));

        let worker_tx = tx.clone();
        worker_tx.send(forwarded(2)).unwrap();
        tx.send(forwarded(5)).unwrap();
        tx.send(ProcessResult {
            record_count: 0,
            outcome: Outcome::TranscodeFailed,
        })
        .unwrap();
        drop(tx);
        drop(worker_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.total_deliveries(), 3);
        assert_eq!(stats.total_records(), 7);
        assert_eq!(stats.failed_deliveries(), 1);
        // Only the final sample, the interval never elapsed
        assert_eq!(stats.samples(), 1);
        assert!(registry.get_status().healthy);
    }
}
