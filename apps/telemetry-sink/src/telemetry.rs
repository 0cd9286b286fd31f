use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub const UNKNOWN_DEVICE: &str = "unknown";

/// One decoded broker message. Identity is `(partition, offset)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub device_id: String,
    pub value: Value,
    pub timestamp: f64,
    pub timestamp_text: String,
}

impl Record {
    pub fn is_attributed(&self) -> bool {
        self.device_id != UNKNOWN_DEVICE
    }

    /// Serialized full message, used as the history member and the notification body.
    pub fn message_json(&self) -> String {
        self.value.to_string()
    }

    pub fn payload_json(&self) -> String {
        match self.value.get("payload") {
            Some(payload) if !payload.is_null() => payload.to_string(),
            _ => "{}".to_string(),
        }
    }
}

/// What one raw broker message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    Record(Record),
    Malformed { partition: i32, offset: i64 },
}

pub fn decode_message(
    partition: i32,
    offset: i64,
    payload: Option<&[u8]>,
    now: DateTime<Utc>,
) -> Polled {
    match decode_record(partition, offset, payload, now) {
        Ok(record) => Polled::Record(record),
        Err(err) => {
            tracing::warn!(partition, offset, error=%err, "skipping malformed message");
            Polled::Malformed { partition, offset }
        }
    }
}

pub fn decode_record(
    partition: i32,
    offset: i64,
    payload: Option<&[u8]>,
    now: DateTime<Utc>,
) -> Result<Record, DecodeError> {
    let payload = payload.filter(|bytes| !bytes.is_empty()).ok_or(DecodeError::Empty)?;
    std::str::from_utf8(payload)?;

    let mut bytes = payload.to_vec();
    let value: Value = simd_json::serde::from_slice(&mut bytes)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let device_id = device_key(value.get("device_id"));
    let (timestamp, timestamp_text) =
        event_timestamp(value.get("timestamp")).unwrap_or_else(|| {
            let secs = now.timestamp();
            (secs as f64, secs.to_string())
        });

    Ok(Record {
        partition,
        offset,
        device_id,
        value,
        timestamp,
        timestamp_text,
    })
}

fn device_key(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => UNKNOWN_DEVICE.to_string(),
    }
}

fn event_timestamp(raw: Option<&Value>) -> Option<(f64, String)> {
    match raw? {
        Value::Number(n) => n.as_f64().map(|ts| (ts, n.to_string())),
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|ts| ts.is_finite())
                .map(|ts| (ts, trimmed.to_string()))
        }
        _ => None,
    }
}
