//! Message and signal definitions held by the catalog

use crate::types::SignalValue;
use std::collections::BTreeMap;

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN message ID (without the DBC extended-id flag)
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// True if the message uses a 29-bit identifier
    pub is_extended: bool,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
    /// Source file (DBC filename)
    pub source: String,
}

impl MessageDefinition {
    /// True if this message has multiplexed signals
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexer_signal.is_some()
            || self.signals.iter().any(|s| s.multiplexer_info.is_some())
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Signals carried by a frame whose multiplexer selector is `selector`
    pub fn active_signals(&self, selector: Option<u64>) -> impl Iterator<Item = &SignalDefinition> {
        self.signals.iter().filter(move |signal| match &signal.multiplexer_info {
            Some(mux) => selector.map_or(false, |value| mux.multiplexer_values.contains(&value)),
            None => true,
        })
    }
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> label)
    pub value_table: Option<BTreeMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// True if scaling keeps physical values integral
    pub fn is_integral(&self) -> bool {
        self.factor.fract() == 0.0 && self.offset.fract() == 0.0
    }

    /// True if the DBC declares a usable physical range
    pub fn has_range(&self) -> bool {
        self.min < self.max
    }

    /// Label for a raw value, if the value table has one
    pub fn label_for(&self, raw: i64) -> Option<&str> {
        self.value_table
            .as_ref()
            .and_then(|table| table.get(&raw))
            .map(String::as_str)
    }

    /// Raw value for a label, if the value table has one
    pub fn raw_for_label(&self, label: &str) -> Option<i64> {
        self.value_table.as_ref().and_then(|table| {
            table
                .iter()
                .find(|(_, candidate)| candidate.as_str() == label)
                .map(|(raw, _)| *raw)
        })
    }

    /// A reasonable value for a file that has not received any frame yet
    ///
    /// The first value-table label if there is one, otherwise the middle of
    /// the declared range (or its minimum when no maximum is declared).
    pub fn default_value(&self) -> SignalValue {
        if let Some(label) = self
            .value_table
            .as_ref()
            .and_then(|table| table.values().next())
        {
            return SignalValue::Text(label.clone());
        }

        let physical = if self.max != 0.0 {
            (self.max + self.min) / 2.0
        } else if self.min != 0.0 {
            self.min
        } else {
            self.offset
        };

        if self.is_integral() {
            SignalValue::Integer(physical.round() as i64)
        } else {
            SignalValue::Float(physical)
        }
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}
