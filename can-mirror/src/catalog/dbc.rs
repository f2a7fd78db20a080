//! DBC file parser
//!
//! Parses Vector DBC files and converts them into catalog definitions.

use crate::catalog::definitions::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{MirrorError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Bit 31 of a DBC message id flags a 29-bit identifier
const DBC_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes = std::fs::read(path).map_err(|e| {
        MirrorError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1/Windows-1252
    let content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(err) => {
            log::warn!("DBC file {:?} is not UTF-8, trying Latin-1 encoding", path);
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let source = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc");

    let messages = parse_dbc_str(&content, source)?;
    log::info!("Parsed {} messages from {:?}", messages.len(), path);
    Ok(messages)
}

/// Parse DBC content held in memory
pub fn parse_dbc_str(content: &str, source: &str) -> Result<Vec<MessageDefinition>> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes()).map_err(|e| {
        MirrorError::DbcParseError(format!("Failed to parse DBC {}: {:?}", source, e))
    })?;

    dbc.messages()
        .iter()
        .map(|dbc_msg| convert_message(&dbc, dbc_msg, source))
        .collect()
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    source: &str,
) -> Result<MessageDefinition> {
    let multiplexer_signal = dbc_msg
        .signals()
        .iter()
        .find(|s| matches!(s.multiplexer_indicator(), can_dbc::MultiplexIndicator::Multiplexor))
        .map(|s| s.name().to_string());

    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| convert_signal(dbc, dbc_msg, dbc_sig, multiplexer_signal.as_deref()))
        .collect::<Result<Vec<_>>>()?;

    let raw_id = dbc_msg.message_id().0;

    Ok(MessageDefinition {
        id: raw_id & !DBC_EXTENDED_FLAG,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        is_extended: raw_id & DBC_EXTENDED_FLAG != 0,
        signals,
        multiplexer_signal,
        source: source.to_string(),
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let value_table = dbc
        .value_descriptions_for_signal(*dbc_msg.message_id(), dbc_sig.name())
        .map(|descriptions| {
            descriptions
                .iter()
                .map(|d| (*d.a() as i64, d.b().to_string()))
                .collect::<BTreeMap<_, _>>()
        })
        .filter(|table| !table.is_empty());

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value)
        | can_dbc::MultiplexIndicator::MultiplexorAndMultiplexedSignal(switch_value) => {
            Some(MultiplexerInfo {
                multiplexer_signal: multiplexer_signal_name
                    .ok_or_else(|| {
                        MirrorError::DbcParseError(format!(
                            "Multiplexed signal '{}' but no multiplexer found",
                            dbc_sig.name()
                        ))
                    })?
                    .to_string(),
                multiplexer_values: vec![switch_value],
            })
        }
        _ => None,
    };

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table,
        multiplexer_info,
    })
}
