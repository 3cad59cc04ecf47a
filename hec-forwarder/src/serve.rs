use axum::{routing::get, Router};
use futures::future::ready;
use health::HealthRegistry;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::metrics_consts::{RECORDS_PER_DELIVERY, REQUEST_BYTES, SEND_TIME};

pub async fn index() -> &'static str {
    "hec forwarder"
}

/// Probe routes. `/_liveness` fails as soon as a worker or the reporter stops reporting.
pub fn probe_routes(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

/// Add the prometheus endpoint to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || ready(recorder_handle.render())),
    ))
}

fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    metrics_builder()?.install_recorder()
}

/// Every histogram gets buckets in its own unit.
fn metrics_builder() -> Result<PrometheusBuilder, BuildError> {
    const MILLISECONDS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
        30000.0, 60000.0,
    ];
    const BYTES: &[f64] = &[
        256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0, 16777216.0,
        67108864.0,
    ];
    const RECORDS: &[f64] = &[
        1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(MILLISECONDS)?
        .set_buckets_for_metric(Matcher::Full(SEND_TIME.to_owned()), MILLISECONDS)?
        .set_buckets_for_metric(Matcher::Full(REQUEST_BYTES.to_owned()), BYTES)?
        .set_buckets_for_metric(Matcher::Full(RECORDS_PER_DELIVERY.to_owned()), RECORDS)
}

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;

    async fn spawn_probe_server(liveness: HealthRegistry) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, probe_routes(liveness)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn buckets(rendered: &str, metric: &str) -> Vec<String> {
        let prefix = format!("{metric}_bucket{{le=\"");
        rendered
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('"').next())
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn test_histograms_have_buckets_in_their_unit() {
        let recorder = metrics_builder().unwrap().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::histogram!(SEND_TIME).record(42.0);
            metrics::histogram!(REQUEST_BYTES).record(50000.0);
            metrics::histogram!(RECORDS_PER_DELIVERY).record(3.0);
        });
        let rendered = handle.render();

        let request_bytes = buckets(&rendered, REQUEST_BYTES);
        assert!(request_bytes.contains(&"65536".to_owned()), "{rendered}");
        assert!(request_bytes.contains(&"67108864".to_owned()), "{rendered}");
        assert!(!request_bytes.contains(&"10000".to_owned()), "{rendered}");

        let send_time = buckets(&rendered, SEND_TIME);
        assert!(send_time.contains(&"60000".to_owned()), "{rendered}");

        let records = buckets(&rendered, RECORDS_PER_DELIVERY);
        assert!(records.contains(&"2".to_owned()), "{rendered}");
        assert!(!records.contains(&"65536".to_owned()), "{rendered}");
    }

    #[tokio::test]
    async fn test_liveness_follows_components() {
        let registry = HealthRegistry::new("liveness");
        let base = spawn_probe_server(registry.clone()).await;
        let client = reqwest::Client::new();

        let status = client
            .get(format!("{base}/_liveness"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let worker = registry.register("worker-0".to_string(), time::Duration::seconds(30));
        worker.report_healthy();
        let status = client
            .get(format!("{base}/_liveness"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);

        let status = client
            .get(format!("{base}/_readiness"))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::OK);
    }
}
