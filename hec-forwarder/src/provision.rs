use std::time;

use http::StatusCode;
use reqwest::{header, Client, Url};
use tracing::info;

use crate::config::BrokerConfig;
use crate::error::ProvisionError;

const MAX_ERROR_BODY: usize = 1024;

pub fn build_admin_client(request_timeout: time::Duration) -> reqwest::Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Client::builder()
        .default_headers(headers)
        .user_agent("hec-forwarder")
        .timeout(request_timeout)
        .build()
}

/// Management API location of the namespace. The namespace is a single path segment,
/// so the default "/" vhost comes out as `%2F`.
pub fn vhost_url(config: &BrokerConfig) -> Result<Url, ProvisionError> {
    let mut url = Url::parse(&format!("http://{}:{}/", config.host, config.admin_port))?;
    if let Ok(mut segments) = url.path_segments_mut() {
        segments
            .pop_if_empty()
            .extend(["api", "vhosts", config.namespace.as_str()]);
    }
    Ok(url)
}

/// Create the broker namespace through the management API. Creating a namespace
/// that already exists is not an error, so this is safe to run on every start.
pub async fn provision(client: &Client, config: &BrokerConfig) -> Result<(), ProvisionError> {
    let url = vhost_url(config)?;
    let namespace = config.namespace.as_str();

    let response = client
        .put(url)
        .basic_auth(&config.user, Some(&config.password))
        .send()
        .await?;

    match response.status() {
        StatusCode::CREATED => {
            info!("created broker vhost {}", namespace);
            Ok(())
        }
        StatusCode::NO_CONTENT => {
            info!("broker vhost {} already exists", namespace);
            Ok(())
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(ProvisionError::UnexpectedStatus {
                namespace: namespace.to_owned(),
                status,
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use envconfig::Envconfig;
    use httpmock::prelude::*;

    use super::*;

    fn broker_config(admin_port: u16, namespace: &str) -> BrokerConfig {
        BrokerConfig::init_from_hashmap(&HashMap::from([
            ("BROKER_HOST".to_owned(), "127.0.0.1".to_owned()),
            ("BROKER_ADMIN_PORT".to_owned(), admin_port.to_string()),
            ("BROKER_NAMESPACE".to_owned(), namespace.to_owned()),
            ("BROKER_EXCHANGE".to_owned(), "alerts".to_owned()),
        ]))
        .expect("failed to load broker config")
    }

    fn client() -> Client {
        build_admin_client(time::Duration::from_secs(2)).expect("failed to build client")
    }

    #[test]
    fn test_vhost_url() {
        let url = vhost_url(&broker_config(15672, "dx")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:15672/api/vhosts/dx");

        let url = vhost_url(&broker_config(15672, "/")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:15672/api/vhosts/%2F");
    }

    #[tokio::test]
    async fn test_creates_vhost() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/vhosts/dx")
                .header("authorization", "Basic Z3Vlc3Q6Z3Vlc3Q=");
            then.status(201);
        });

        provision(&client(), &broker_config(server.port(), "dx"))
            .await
            .expect("provision failed");
        mock.assert();
    }

    #[tokio::test]
    async fn test_existing_vhost_is_ok() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT).path("/api/vhosts/dx");
            then.status(204);
        });

        let config = broker_config(server.port(), "dx");
        provision(&client(), &config).await.expect("first run failed");
        provision(&client(), &config).await.expect("second run failed");
        mock.assert_hits(2);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/api/vhosts/dx");
            then.status(401).body(r#"{"error":"not_authorised"}"#);
        });

        let err = provision(&client(), &broker_config(server.port(), "dx"))
            .await
            .expect_err("provision should fail");

        match err {
            ProvisionError::UnexpectedStatus {
                namespace,
                status,
                body,
            } => {
                assert_eq!(namespace, "dx");
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert!(body.contains("not_authorised"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_admin_api() {
        // Nothing listens on port 1.
        let err = provision(&client(), &broker_config(1, "dx"))
            .await
            .expect_err("provision should fail");
        assert!(matches!(err, ProvisionError::Request(_)));
    }
}
