pub mod broker;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics_consts;
pub mod provision;
pub mod reporter;
pub mod serve;
pub mod transcode;
pub mod worker;
