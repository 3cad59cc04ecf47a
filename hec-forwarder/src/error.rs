use http::StatusCode;
use thiserror::Error;

/// Failure to create the broker virtual host. Fatal at startup.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid broker admin url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("broker admin api unreachable: {0}")]
    Request(#[from] reqwest::Error),
    #[error("broker admin api refused to create vhost {namespace}: {status} {body}")]
    UnexpectedStatus {
        namespace: String,
        status: StatusCode,
        body: String,
    },
}

/// Failure to open the broker connection or declare the consumption topology. Fatal.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to connect to broker at {uri}: {error}")]
    Connection { uri: String, error: lapin::Error },
    #[error("failed to open a channel: {0}")]
    Channel(#[source] lapin::Error),
    #[error("prefetch of {0} deliveries does not fit in the AMQP prefetch count")]
    PrefetchOverflow(usize),
    #[error("failed to {step}: {error}")]
    Topology {
        step: &'static str,
        #[source]
        error: lapin::Error,
    },
}

/// Failure to turn one delivery into a request body. Affects that delivery only.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("failed to decompress gzip payload: {0}")]
    Decompression(#[source] std::io::Error),
    #[error("payload is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("payload must be a json object or an array of objects, got {0}")]
    UnexpectedShape(&'static str),
    #[error("element {index} of the payload array must be a json object, got {kind}")]
    UnexpectedElement { index: usize, kind: &'static str },
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Failure to build the ingestion client. Fatal at startup.
#[derive(Error, Debug)]
pub enum IngestSetupError {
    #[error("invalid ingestion url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("ingestion token cannot be used in an http header")]
    InvalidToken(#[from] http::header::InvalidHeaderValue),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Failure to hand one delivery to the ingestion endpoint. Affects that delivery only.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("ingestion request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("ingestion request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("ingestion endpoint answered {status}: {body}")]
    BadResponse { status: StatusCode, body: String },
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            DeliveryError::Timeout(error)
        } else {
            DeliveryError::Request(error)
        }
    }
}

impl DeliveryError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DeliveryError::BadResponse { status, .. } => Some(*status),
            DeliveryError::Request(error) | DeliveryError::Timeout(error) => error.status(),
        }
    }
}

/// Failure to finalize a delivery at the broker.
#[derive(Error, Debug)]
pub enum AckError {
    #[error("failed to acknowledge delivery {tag}: {error}")]
    Broker { tag: u64, error: lapin::Error },
}

/// Errors that stop a delivery worker. Per-delivery errors never end up here.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker consumer failed: {0}")]
    Consume(#[from] lapin::Error),
    #[error(transparent)]
    Ack(#[from] AckError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
