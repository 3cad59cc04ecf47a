use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub broker: BrokerConfig,

    #[envconfig(nested = true)]
    pub ingest: IngestConfig,

    /// Number of delivery workers. Also the HTTP connection budget and half the prefetch.
    #[envconfig(from = "THREADS", default = "2")]
    pub threads: NonZeroWorkers,

    #[envconfig(from = "REPORT_INTERVAL", default = "5000")]
    pub report_interval: EnvMsDuration,

    #[envconfig(from = "OUTPUT_MODE", default = "rates")]
    pub output_mode: OutputMode,

    #[envconfig(from = "TRANSCODE_FAILURE_POLICY", default = "ack")]
    pub transcode_failure_policy: FailurePolicy,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn workers(&self) -> usize {
        self.threads.0
    }
}

#[derive(Envconfig, Clone)]
pub struct BrokerConfig {
    #[envconfig(from = "BROKER_USER", default = "guest")]
    pub user: String,

    #[envconfig(from = "BROKER_PASSWORD", default = "guest")]
    pub password: String,

    #[envconfig(from = "BROKER_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "BROKER_AMQP_PORT", default = "5672")]
    pub amqp_port: u16,

    #[envconfig(from = "BROKER_ADMIN_PORT", default = "15672")]
    pub admin_port: u16,

    /// The virtual host sensors publish into.
    #[envconfig(from = "BROKER_NAMESPACE", default = "dx")]
    pub namespace: NonEmptyString,

    #[envconfig(from = "BROKER_EXCHANGE")]
    pub exchange: NonEmptyString,

    #[envconfig(from = "BROKER_ADMIN_TIMEOUT", default = "2000")]
    pub admin_timeout: EnvMsDuration,
}

impl BrokerConfig {
    /// The queue bound to the exchange is named after it.
    pub fn queue(&self) -> String {
        format!("{}_q", self.exchange.as_str())
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("user", &self.user)
            .field("host", &self.host)
            .field("amqp_port", &self.amqp_port)
            .field("admin_port", &self.admin_port)
            .field("namespace", &self.namespace)
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

#[derive(Envconfig, Clone)]
pub struct IngestConfig {
    #[envconfig(from = "INGEST_URL")]
    pub url: NonEmptyString,

    #[envconfig(from = "INGEST_TOKEN")]
    pub token: NonEmptyString,

    #[envconfig(from = "INGEST_AUTH_SCHEME", default = "Splunk")]
    pub auth_scheme: NonEmptyString,

    /// Skip certificate validation. Only meant for lab endpoints with self-signed certificates.
    #[envconfig(from = "INGEST_TLS_INSECURE", default = "false")]
    pub tls_insecure: bool,

    #[envconfig(from = "INGEST_REQUEST_TIMEOUT", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "INGEST_HEALTH_CHECK", default = "true")]
    pub health_check: bool,

    #[envconfig(from = "INGEST_HEC_METADATA", default = "false")]
    pub hec_metadata: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Worker count. The broker prefetch is twice this and must fit AMQP's 16-bit field.
#[derive(Debug, Clone, Copy)]
pub struct NonZeroWorkers(pub usize);

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidWorkerCountError;

impl FromStr for NonZeroWorkers {
    type Err = InvalidWorkerCountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<usize>() {
            Ok(n) if n > 0 && n <= u16::MAX as usize / 2 => Ok(NonZeroWorkers(n)),
            _ => Err(InvalidWorkerCountError),
        }
    }
}

/// How much each delivery is logged. Never changes what is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Only the periodic throughput line.
    Rates,
    /// One line per forwarded delivery.
    Verbose,
    /// One line per delivery with the full decoded payload.
    Debug,
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "rates" => Ok(OutputMode::Rates),
            "verbose" => Ok(OutputMode::Verbose),
            "debug" => Ok(OutputMode::Debug),
            _ => Err(format!(
                "unknown output mode: {s}, must be rates, verbose or debug"
            )),
        }
    }
}

/// What to do with a delivery whose payload cannot be transcoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Acknowledge and drop it.
    Ack,
    /// Reject without requeue, so a dead-letter exchange can pick it up.
    Reject,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "ack" => Ok(FailurePolicy::Ack),
            "reject" => Ok(FailurePolicy::Reject),
            _ => Err(format!(
                "unknown transcode failure policy: {s}, must be ack or reject"
            )),
        }
    }
}
