//! Sample codec.
//!
//! Two wire shapes share one record format, a JSON tuple
//! `["metric.name",[timestamp,value]]`:
//!
//! - **Batch**: sent over a persistent connection as a u32 big-endian
//!   byte-length frame whose body is a concatenation of u32-length-prefixed
//!   records.
//! - **Datagram**: one bare record per datagram.
//!
//! A batch is a best-effort stream, not atomic: a corrupt record stops
//! decoding but every leading well-formed record is kept, and the byte
//! offset of the failure is reported alongside them.

use crate::types::{MetricSample, Sample};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("empty metric name")]
    EmptyMetricName,

    #[error("non-finite value for metric {0}")]
    NonFiniteValue(String),

    #[error("truncated record header")]
    TruncatedHeader,

    #[error("record length {declared} exceeds remaining {remaining} bytes")]
    TruncatedRecord { declared: usize, remaining: usize },

    #[error("batch exceeds maximum of {limit} records")]
    TooManyItems { limit: usize },
}

/// Where and why a batch stopped decoding.
#[derive(Debug)]
pub struct BatchFault {
    /// Byte offset into the batch body where decoding failed.
    pub offset: usize,
    pub error: DecodeError,
}

/// Result of a best-effort batch decode.
#[derive(Debug)]
pub struct BatchDecode {
    pub records: Vec<MetricSample>,
    pub fault: Option<BatchFault>,
}

/// Decode one serialized record.
pub fn decode_record(raw: &[u8]) -> Result<MetricSample, DecodeError> {
    let (metric, (timestamp, value)): (String, (i64, f64)) = serde_json::from_slice(raw)?;
    if metric.is_empty() {
        return Err(DecodeError::EmptyMetricName);
    }
    if !value.is_finite() {
        return Err(DecodeError::NonFiniteValue(metric));
    }
    Ok(MetricSample {
        metric,
        sample: Sample::new(timestamp, value),
    })
}

/// Decode a batch body: u32 big-endian length-prefixed records, end to end.
///
/// Decodes as many leading well-formed records as possible. The item limit
/// is a resource-exhaustion guard; records past it are not decoded and the
/// overflow is reported as the fault.
pub fn decode_batch(body: &[u8], max_items: usize) -> BatchDecode {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        if records.len() >= max_items {
            return BatchDecode {
                records,
                fault: Some(BatchFault {
                    offset,
                    error: DecodeError::TooManyItems { limit: max_items },
                }),
            };
        }
        let remaining = body.len() - offset;
        if remaining < 4 {
            return BatchDecode {
                records,
                fault: Some(BatchFault {
                    offset,
                    error: DecodeError::TruncatedHeader,
                }),
            };
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&body[offset..offset + 4]);
        let declared = u32::from_be_bytes(len_bytes) as usize;
        let payload_start = offset + 4;
        if declared > body.len() - payload_start {
            return BatchDecode {
                records,
                fault: Some(BatchFault {
                    offset,
                    error: DecodeError::TruncatedRecord {
                        declared,
                        remaining: body.len() - payload_start,
                    },
                }),
            };
        }
        match decode_record(&body[payload_start..payload_start + declared]) {
            Ok(record) => records.push(record),
            Err(error) => {
                return BatchDecode {
                    records,
                    fault: Some(BatchFault { offset, error }),
                };
            }
        }
        offset = payload_start + declared;
    }

    BatchDecode {
        records,
        fault: None,
    }
}

/// Serialize one record (loadgen and tests; the daemon only decodes).
pub fn encode_record(metric: &str, sample: Sample) -> Vec<u8> {
    // A (&str, (i64, f64)) tuple always serializes.
    serde_json::to_vec(&(metric, (sample.timestamp, sample.value))).unwrap_or_default()
}

/// Build a batch body from records, each length-prefixed.
pub fn encode_batch(records: &[(String, Sample)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (metric, sample) in records {
        let record = encode_record(metric, *sample);
        body.extend_from_slice(&(record.len() as u32).to_be_bytes());
        body.extend_from_slice(&record);
    }
    body
}
