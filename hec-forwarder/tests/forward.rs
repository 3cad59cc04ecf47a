//! End to end runs against a local RabbitMQ with the management plugin, such as
//! `docker run -p 5672:5672 -p 15672:15672 rabbitmq:3-management`.
//! Run with `cargo test -- --ignored`.
use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use envconfig::Envconfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use health::HealthRegistry;
use httpmock::{Method, MockServer};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hec_forwarder::broker::{amqp_uri, BrokerConsumer};
use hec_forwarder::config::{BrokerConfig, FailurePolicy, IngestConfig, OutputMode};
use hec_forwarder::ingest::IngestClient;
use hec_forwarder::provision::{build_admin_client, provision};
use hec_forwarder::reporter::{Outcome, ProcessResult};
use hec_forwarder::transcode::Transcoder;
use hec_forwarder::worker::{run_workers, WorkerSettings};

fn broker_config(exchange: &str) -> BrokerConfig {
    BrokerConfig::init_from_hashmap(&HashMap::from([
        ("BROKER_NAMESPACE".to_owned(), "/".to_owned()),
        ("BROKER_EXCHANGE".to_owned(), exchange.to_owned()),
    ]))
    .expect("failed to load broker config")
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn publish(config: &BrokerConfig, messages: &[(Vec<u8>, Option<&str>)]) {
    let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
        .await
        .expect("failed to connect");
    let channel = connection.create_channel().await.unwrap();
    channel
        .exchange_declare(
            config.exchange.as_str(),
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();

    for (payload, encoding) in messages {
        let mut properties = BasicProperties::default();
        if let Some(encoding) = encoding {
            properties = properties.with_content_encoding((*encoding).into());
        }
        channel
            .basic_publish(
                config.exchange.as_str(),
                "",
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .unwrap()
            .await
            .unwrap();
    }
    connection.close(200, "OK").await.unwrap();
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<ProcessResult>,
    count: usize,
) -> Vec<ProcessResult> {
    let mut results = Vec::with_capacity(count);
    while results.len() < count {
        let result = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for deliveries")
            .expect("workers stopped early");
        results.push(result);
    }
    results
}

#[tokio::test]
#[ignore = "needs a local RabbitMQ"]
async fn test_forwards_published_messages() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(Method::POST).path("/services/collector");
        then.status(200);
    });

    let config = broker_config("hec_forwarder_it");
    let admin = build_admin_client(Duration::from_secs(2)).unwrap();
    provision(&admin, &config).await.expect("failed to provision");

    let consumer = BrokerConsumer::connect(&config, 2)
        .await
        .expect("failed to connect");

    publish(
        &config,
        &[
            (br#"{"alert":"a"}"#.to_vec(), None),
            (gzip(br#"[{"s":1},{"s":2}]"#), Some("gzip")),
            (b"not json".to_vec(), None),
        ],
    )
    .await;

    let ingest = IngestClient::new(
        &IngestConfig::init_from_hashmap(&HashMap::from([
            ("INGEST_URL".to_owned(), server.url("/services/collector")),
            ("INGEST_TOKEN".to_owned(), "s3cr3t".to_owned()),
        ]))
        .unwrap(),
        2,
    )
    .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let registry = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();
    let pool = tokio::spawn({
        let deliveries = consumer.deliveries();
        let shutdown = shutdown.clone();
        let registry = registry.clone();
        async move {
            run_workers(
                2,
                deliveries,
                ingest,
                WorkerSettings {
                    transcoder: Transcoder::default(),
                    output_mode: OutputMode::Verbose,
                    failure_policy: FailurePolicy::Ack,
                    heartbeat: Duration::from_secs(1),
                    request_timeout: Duration::from_secs(10),
                },
                tx,
                &registry,
                shutdown,
            )
            .await
        }
    });

    let results = collect(&mut rx, 3).await;
    shutdown.cancel();
    pool.await.unwrap().expect("workers failed");

    mock.assert_hits(2);
    let forwarded: usize = results
        .iter()
        .filter(|r| r.outcome == Outcome::Forwarded)
        .map(|r| r.record_count)
        .sum();
    assert_eq!(forwarded, 3);

    consumer.close().await.expect("failed to close");
    // Closing again is harmless
    consumer.close().await.expect("second close failed");
}
