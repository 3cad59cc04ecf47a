use std::time;

use bytes::Bytes;
use http::StatusCode;
use reqwest::{header, Client, Url};
use tracing::warn;

use crate::config::IngestConfig;
use crate::error::{DeliveryError, IngestSetupError};

// Error bodies end up in logs, keep them short.
const MAX_RESPONSE_BODY: usize = 1024;

const CONNECTIVITY_CHECK: &[u8] = br#"{"event":"hec-forwarder connectivity check"}"#;

/// One idle connection is kept per worker, so every worker can have a request in
/// flight without opening a new connection.
pub fn build_http_client(
    request_timeout: time::Duration,
    max_connections: usize,
    tls_insecure: bool,
) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    if tls_insecure {
        warn!("certificate validation is disabled for the ingestion endpoint");
    }
    Client::builder()
        .default_headers(headers)
        .user_agent("hec-forwarder")
        .timeout(request_timeout)
        .pool_max_idle_per_host(max_connections)
        .pool_idle_timeout(time::Duration::from_secs(30))
        .danger_accept_invalid_certs(tls_insecure)
        .build()
}

/// Client for the HTTP event collector, shared by all workers.
#[derive(Clone)]
pub struct IngestClient {
    url: Url,
    authorization: header::HeaderValue,
    client: Client,
}

impl IngestClient {
    pub fn new(config: &IngestConfig, max_connections: usize) -> Result<Self, IngestSetupError> {
        let url = Url::parse(config.url.as_str())?;
        let mut authorization = header::HeaderValue::try_from(format!(
            "{} {}",
            config.auth_scheme.as_str(),
            config.token.as_str()
        ))?;
        authorization.set_sensitive(true);
        let client = build_http_client(
            config.request_timeout.0,
            max_connections,
            config.tls_insecure,
        )?;

        Ok(Self {
            url,
            authorization,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POST one body. The response body is always read to the end so the
    /// connection goes back to the pool.
    pub async fn send(&self, body: Bytes) -> Result<StatusCode, DeliveryError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(header::AUTHORIZATION, self.authorization.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let response_body = response.bytes().await?;

        if status.is_success() {
            Ok(status)
        } else {
            let end = response_body.len().min(MAX_RESPONSE_BODY);
            Err(DeliveryError::BadResponse {
                status,
                body: String::from_utf8_lossy(&response_body[..end]).into_owned(),
            })
        }
    }

    /// Send a single marker event to confirm the url and token are accepted.
    pub async fn check_connectivity(&self) -> Result<(), DeliveryError> {
        self.send(Bytes::from_static(CONNECTIVITY_CHECK))
            .await
            .map(|_| ())
    }
}
