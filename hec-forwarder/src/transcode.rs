//! Reshape broker payloads into the ingestion endpoint's multi-event body.
//!
//! Sensors publish either one JSON object (an alert) or a JSON array of objects
//! (a batch of session metadata). The endpoint wants every record wrapped as
//! `{"event": <record>}`, with all envelopes of a delivery concatenated without
//! separators into one request body.
use std::borrow::Cow;
use std::io::Read;

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TranscodeError;

/// Transport-level encoding marker carried by each delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Unsupported(String),
}

impl ContentEncoding {
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker.map(str::trim) {
            None | Some("") => ContentEncoding::Identity,
            Some(m) if m.eq_ignore_ascii_case("identity") => ContentEncoding::Identity,
            Some(m) if m.eq_ignore_ascii_case("gzip") || m.eq_ignore_ascii_case("x-gzip") => {
                ContentEncoding::Gzip
            }
            Some(m) => ContentEncoding::Unsupported(m.to_owned()),
        }
    }
}

/// A request body ready to be sent, and how many records it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoded {
    pub body: Bytes,
    pub record_count: usize,
}

/// Top-level shape of a decoded payload.
enum Payload {
    Object(Map<String, Value>),
    Array(Vec<Value>),
    Other(Value),
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(record) => Payload::Object(record),
            Value::Array(records) => Payload::Array(records),
            other => Payload::Other(other),
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

impl<'a> Envelope<'a> {
    fn bare(record: &'a Map<String, Value>) -> Self {
        Envelope {
            event: record,
            time: None,
            host: None,
            source: None,
        }
    }

    /// Lift the sensor's own timestamp, device and product into the endpoint's indexed fields.
    fn with_metadata(record: &'a Map<String, Value>) -> Self {
        // device_time is in milliseconds, the endpoint wants seconds
        let time = record.get("device_time").and_then(|t| match t {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<i64>().ok().map(|ms| ms as f64),
            _ => None,
        });

        Envelope {
            event: record,
            time: time.map(|ms| ms / 1000.0),
            host: record.get("device_name").and_then(Value::as_str),
            source: record.get("product_name").and_then(Value::as_str),
        }
    }
}

// Upper bound of the up-front allocation for a gzip payload, the buffer grows past it as needed.
const MAX_DECODE_HINT: usize = 1 << 20;

fn decode_capacity(compressed_len: usize) -> usize {
    compressed_len.saturating_mul(4).min(MAX_DECODE_HINT)
}

/// Undo the transport encoding. Identity payloads are borrowed as-is.
pub fn decode<'p>(
    payload: &'p [u8],
    encoding: &ContentEncoding,
) -> Result<Cow<'p, [u8]>, TranscodeError> {
    match encoding {
        ContentEncoding::Identity => Ok(Cow::Borrowed(payload)),
        ContentEncoding::Gzip => {
            let mut decoded = Vec::with_capacity(decode_capacity(payload.len()));
            MultiGzDecoder::new(payload)
                .read_to_end(&mut decoded)
                .map_err(TranscodeError::Decompression)?;
            Ok(Cow::Owned(decoded))
        }
        ContentEncoding::Unsupported(marker) => {
            Err(TranscodeError::UnsupportedEncoding(marker.clone()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Transcoder {
    hec_metadata: bool,
}

impl Transcoder {
    pub fn new(hec_metadata: bool) -> Self {
        Self { hec_metadata }
    }

    /// Decode then wrap a raw delivery payload.
    pub fn transcode(
        &self,
        payload: &[u8],
        encoding: &ContentEncoding,
    ) -> Result<Transcoded, TranscodeError> {
        let decoded = decode(payload, encoding)?;
        self.wrap(&decoded)
    }

    /// Wrap an already decoded JSON payload. On error nothing is emitted, even if
    /// some array elements were valid.
    pub fn wrap(&self, decoded: &[u8]) -> Result<Transcoded, TranscodeError> {
        let payload: Payload = serde_json::from_slice::<Value>(decoded)?.into();

        let mut body = Vec::with_capacity(decoded.len() + 16);
        let record_count = match payload {
            Payload::Object(record) => {
                self.write_envelope(&mut body, &record)?;
                1
            }
            Payload::Array(records) => {
                for (index, record) in records.iter().enumerate() {
                    match record {
                        Value::Object(record) => self.write_envelope(&mut body, record)?,
                        other => {
                            return Err(TranscodeError::UnexpectedElement {
                                index,
                                kind: kind(other),
                            })
                        }
                    }
                }
                records.len()
            }
            Payload::Other(value) => return Err(TranscodeError::UnexpectedShape(kind(&value))),
        };

        Ok(Transcoded {
            body: Bytes::from(body),
            record_count,
        })
    }

    fn write_envelope(
        &self,
        body: &mut Vec<u8>,
        record: &Map<String, Value>,
    ) -> Result<(), TranscodeError> {
        let envelope = if self.hec_metadata {
            Envelope::with_metadata(record)
        } else {
            Envelope::bare(record)
        };
        serde_json::to_writer(body, &envelope).map_err(TranscodeError::Serialize)
    }
}
