//! JSON projection of message state
//!
//! A mirrored file holds either one record (the latest snapshot) or, in
//! accumulate mode, an array of records in reception order. A record maps
//! signal names to values; metadata fields start with `$`.

use crate::config::{BridgeConfig, TimestampMode};
use crate::fingerprint::ContentSignature;
use crate::types::{BusFrame, MirrorError, Result, SignalMap, SignalValue};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Reception time field
pub const TIMESTAMP_FIELD: &str = "$timestamp";
/// Raw identifier field
pub const ID_FIELD: &str = "$id";
/// Raw payload field (hex)
pub const DATA_FIELD: &str = "$data";

/// One JSON record
pub type JsonRecord = Map<String, Value>;

/// True for fields that are not signals
pub fn is_meta_field(key: &str) -> bool {
    key.starts_with('$')
}

/// Output shape options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionOptions {
    pub accumulate: bool,
    pub diff: bool,
    pub timestamp: Option<TimestampMode>,
    pub raw_data: bool,
}

impl From<&BridgeConfig> for ProjectionOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            accumulate: config.accumulate,
            diff: config.diff,
            timestamp: config.timestamp_mode(),
            raw_data: config.raw_data,
        }
    }
}

/// Receive-side state of one catalog message
#[derive(Debug, Clone)]
pub struct MessageRecord {
    /// CAN message ID
    pub id: u32,
    /// Mirrored file
    pub path: PathBuf,
    /// False when reception must never touch the file
    pub rx_enabled: bool,
    current: Option<SignalMap>,
    history: Vec<JsonRecord>,
    first_seen: Option<f64>,
    last_fingerprint: Option<ContentSignature>,
}

impl MessageRecord {
    pub fn new(id: u32, path: PathBuf, rx_enabled: bool) -> Self {
        Self {
            id,
            path,
            rx_enabled,
            current: None,
            history: Vec::new(),
            first_seen: None,
            last_fingerprint: None,
        }
    }

    /// Latest decoded snapshot
    pub fn current(&self) -> Option<&SignalMap> {
        self.current.as_ref()
    }

    /// Accumulated records, oldest first
    pub fn history(&self) -> &[JsonRecord] {
        &self.history
    }

    /// Timestamp of the first frame received for this message
    pub fn first_seen(&self) -> Option<f64> {
        self.first_seen
    }

    /// Signature of the last content written for this message
    pub fn last_fingerprint(&self) -> Option<&ContentSignature> {
        self.last_fingerprint.as_ref()
    }

    pub fn set_last_fingerprint(&mut self, signature: ContentSignature) {
        self.last_fingerprint = Some(signature);
    }

    /// Continue the history found in an existing file
    ///
    /// Only arrays of records are taken over; anything else (such as the
    /// default placeholder object) is left behind.
    pub fn seed_history(&mut self, document: &Value) -> usize {
        if let Value::Array(entries) = document {
            self.history = entries
                .iter()
                .filter_map(|entry| entry.as_object().cloned())
                .collect();
        }
        self.history.len()
    }

    /// Fold a decoded frame into the record
    ///
    /// Returns the document to write, or `None` when nothing needs writing.
    pub fn update(
        &mut self,
        frame: &BusFrame,
        decoded: SignalMap,
        options: &ProjectionOptions,
    ) -> Option<Value> {
        let first_seen = *self.first_seen.get_or_insert(frame.timestamp);
        let timestamp = options.timestamp.map(|mode| match mode {
            TimestampMode::Relative => frame.timestamp - first_seen,
            TimestampMode::Absolute => frame.timestamp,
        });
        let raw = options.raw_data.then_some(frame);

        let changed: SignalMap = match (&self.current, options.diff) {
            (Some(previous), true) => decoded
                .iter()
                .filter(|(name, value)| previous.get(*name) != Some(*value))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            _ => decoded.clone(),
        };
        let unchanged = options.diff && self.current.is_some() && changed.is_empty();
        self.current = Some(decoded);

        if options.accumulate {
            if unchanged {
                return None;
            }
            let signals = if options.diff {
                &changed
            } else {
                self.current.as_ref()?
            };
            self.history.push(render_record(signals, timestamp, raw));
            Some(Value::Array(
                self.history.iter().cloned().map(Value::Object).collect(),
            ))
        } else {
            // A refreshed timestamp or raw payload is still worth a write
            if unchanged && timestamp.is_none() && raw.is_none() {
                return None;
            }
            let signals = self.current.as_ref()?;
            Some(Value::Object(render_record(signals, timestamp, raw)))
        }
    }
}

/// Build one record from signal values and the enabled metadata
fn render_record(signals: &SignalMap, timestamp: Option<f64>, raw: Option<&BusFrame>) -> JsonRecord {
    let mut record: JsonRecord = signals
        .iter()
        .map(|(name, value)| (name.clone(), signal_to_json(value)))
        .collect();
    if let Some(ts) = timestamp {
        record.insert(TIMESTAMP_FIELD.to_string(), Value::from(ts));
    }
    if let Some(frame) = raw {
        record.insert(ID_FIELD.to_string(), Value::from(frame.id));
        record.insert(DATA_FIELD.to_string(), Value::from(hex::encode_upper(&frame.data)));
    }
    record
}

fn signal_to_json(value: &SignalValue) -> Value {
    match value {
        SignalValue::Integer(v) => Value::from(*v),
        SignalValue::Float(v) => Value::from(*v),
        SignalValue::Text(v) => Value::from(v.as_str()),
    }
}

/// Placeholder document written before any frame is received
pub fn default_document(defaults: &SignalMap) -> Value {
    Value::Object(render_record(defaults, None, None))
}

/// Serialize a document the way it is stored on disk
pub fn to_file_content(document: &Value) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    document.serialize(&mut serializer)?;
    buffer.push(b'\n');
    Ok(buffer)
}

/// Signal values described by a (possibly user-edited) document
///
/// A record yields its signal fields. An array yields its records folded in
/// order, later values overriding earlier ones, so diff-mode histories
/// resolve to the full latest state. Metadata fields are skipped.
pub fn extract_signals(document: &Value) -> Result<SignalMap> {
    let records: Vec<&JsonRecord> = match document {
        Value::Object(record) => vec![record],
        Value::Array(entries) => {
            if entries.is_empty() {
                return Err(MirrorError::InvalidData("history is empty".to_string()));
            }
            entries
                .iter()
                .map(|entry| {
                    entry.as_object().ok_or_else(|| {
                        MirrorError::InvalidData("history entries must be objects".to_string())
                    })
                })
                .collect::<Result<_>>()?
        }
        _ => {
            return Err(MirrorError::InvalidData(
                "expected an object or an array of objects".to_string(),
            ))
        }
    };

    let mut values = SignalMap::new();
    for record in records {
        for (name, value) in record.iter().filter(|(name, _)| !is_meta_field(name)) {
            let value = SignalValue::from_json(value).ok_or_else(|| {
                MirrorError::InvalidData(format!("'{}' must be a number or a label", name))
            })?;
            values.insert(name.clone(), value);
        }
    }
    Ok(values)
}
