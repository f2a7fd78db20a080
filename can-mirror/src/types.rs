//! Core types for the CAN filesystem mirror
//!
//! This module defines the frame, signal value and error types shared by the
//! catalog, the transports and both halves of the bridge.

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Result type for mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Decoded signal values of one message, in catalog signal order
pub type SignalMap = IndexMap<String, SignalValue>;

/// Largest payload a frame may carry (CAN-FD)
pub const MAX_FRAME_DATA: usize = 64;

/// Highest standard (11-bit) CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// A CAN frame as seen on the bus
///
/// Frames are immutable once built; the payload length is bounded by
/// [`MAX_FRAME_DATA`].
#[derive(Debug, Clone, PartialEq)]
pub struct BusFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub id: u32,
    /// Frame data bytes
    pub data: Vec<u8>,
    /// Reception time in seconds since the Unix epoch
    pub timestamp: f64,
    /// True if this frame uses a 29-bit identifier
    pub is_extended: bool,
}

impl BusFrame {
    /// Build a frame stamped with the current wall-clock time
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Result<Self> {
        Self::with_timestamp(id, data, now_seconds())
    }

    /// Build a frame with an explicit timestamp
    pub fn with_timestamp(id: u32, data: impl Into<Vec<u8>>, timestamp: f64) -> Result<Self> {
        let data = data.into();
        if data.len() > MAX_FRAME_DATA {
            return Err(MirrorError::InvalidData(format!(
                "frame 0x{:X} carries {} bytes, at most {} allowed",
                id,
                data.len(),
                MAX_FRAME_DATA
            )));
        }
        Ok(Self {
            id,
            data,
            timestamp,
            is_extended: id > MAX_STANDARD_ID,
        })
    }

    /// Builder method: force the identifier format
    pub fn extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }
}

/// Current wall-clock time in seconds since the Unix epoch
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Errors raised by the mirror
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("Message not found: CAN ID 0x{0:X}")]
    MessageNotFound(u32),

    #[error("Failed to decode {message}: {reason}")]
    Decode { message: String, reason: String },

    #[error("Failed to encode {message}: {reason}")]
    Encode { message: String, reason: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Substitution is ambiguous: 0x{first:X} and 0x{second:X} both map to '{name}'")]
    AmbiguousSubstitution { first: u32, second: u32, name: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Signal value types carried in the JSON mirror
///
/// Numeric values keep their integer/float distinction so that integral
/// signals round-trip through JSON without a trailing `.0`. Signals with a
/// value table decode to their textual label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Integral physical value
    Integer(i64),
    /// Scaled physical value
    Float(f64),
    /// Value table label
    Text(String),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{:.3}", v),
            SignalValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl SignalValue {
    /// Numeric view of the value, `None` for labels
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Integer(v) => Some(*v as f64),
            SignalValue::Float(v) => Some(*v),
            SignalValue::Text(_) => None,
        }
    }

    /// Label view of the value, `None` for numbers
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SignalValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Convert a JSON value edited by a user
    ///
    /// Booleans are accepted as 0/1. Nulls, arrays and objects are not
    /// signal values.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(SignalValue::Integer)
                .or_else(|| n.as_f64().map(SignalValue::Float)),
            serde_json::Value::String(s) => Some(SignalValue::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(SignalValue::Integer(i64::from(*b))),
            _ => None,
        }
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        SignalValue::Integer(v)
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        SignalValue::Float(v)
    }
}

impl From<&str> for SignalValue {
    fn from(v: &str) -> Self {
        SignalValue::Text(v.to_string())
    }
}
