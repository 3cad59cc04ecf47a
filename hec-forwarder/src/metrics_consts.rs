pub const DELIVERIES_RECEIVED: &str = "hec_forwarder_deliveries_received";
pub const DELIVERIES_REDELIVERED: &str = "hec_forwarder_deliveries_redelivered";
pub const DELIVERIES_FORWARDED: &str = "hec_forwarder_deliveries_forwarded";
pub const DELIVERIES_EMPTY: &str = "hec_forwarder_deliveries_empty";
pub const DELIVERIES_REJECTED: &str = "hec_forwarder_deliveries_rejected";
pub const TRANSCODE_FAILED: &str = "hec_forwarder_transcode_failed";
pub const SEND_FAILED: &str = "hec_forwarder_send_failed";
pub const RECORDS_FORWARDED: &str = "hec_forwarder_records_forwarded";
pub const RECORDS_PER_DELIVERY: &str = "hec_forwarder_records_per_delivery";
pub const REQUEST_BYTES: &str = "hec_forwarder_request_bytes";
pub const SEND_TIME: &str = "hec_forwarder_send_time_ms";
pub const DELIVERIES_PER_SECOND: &str = "hec_forwarder_deliveries_per_second";
pub const RECORDS_PER_SECOND: &str = "hec_forwarder_records_per_second";
