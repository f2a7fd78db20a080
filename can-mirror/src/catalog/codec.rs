//! Signal codec
//!
//! Extracts signal values from raw CAN payloads and packs signal values back
//! into payloads. Handles bit placement, endianness, multiplexing, value
//! tables and physical value conversion.

use crate::catalog::definitions::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{MirrorError, Result, SignalMap, SignalValue};

/// Tolerance used when comparing physical values against DBC ranges
const RANGE_EPSILON: f64 = 1e-9;

/// Stateless signal codec
pub struct SignalCodec;

impl SignalCodec {
    /// Decode a payload into the signal map of `message`
    ///
    /// Multiplexed signals are only present when the selector picks them.
    pub fn decode(message: &MessageDefinition, data: &[u8]) -> Result<SignalMap> {
        let fail = |reason: String| MirrorError::Decode {
            message: message.name.clone(),
            reason,
        };

        let selector = match message.multiplexer_signal.as_deref() {
            Some(name) => {
                let mux = message
                    .signal(name)
                    .ok_or_else(|| fail(format!("multiplexer '{}' is not defined", name)))?;
                Some(Self::extract_raw(data, mux).map_err(fail)? as u64)
            }
            None => None,
        };

        let mut values = SignalMap::new();
        for signal in message.active_signals(selector) {
            let raw = Self::extract_raw(data, signal).map_err(fail)?;
            values.insert(signal.name.clone(), Self::physical_value(signal, raw));
        }
        Ok(values)
    }

    /// Encode a signal map into a payload of `message.size` bytes
    ///
    /// Every active signal must be present. Keys that are not signals of the
    /// message are rejected; inactive multiplexed signals are ignored.
    pub fn encode(message: &MessageDefinition, values: &SignalMap) -> Result<Vec<u8>> {
        let fail = |reason: String| MirrorError::Encode {
            message: message.name.clone(),
            reason,
        };

        if let Some(unknown) = values.keys().find(|name| message.signal(name).is_none()) {
            return Err(fail(format!("'{}' is not a signal of this message", unknown)));
        }

        let selector = match message.multiplexer_signal.as_deref() {
            Some(name) => {
                let mux = message
                    .signal(name)
                    .ok_or_else(|| fail(format!("multiplexer '{}' is not defined", name)))?;
                let value = values
                    .get(name)
                    .ok_or_else(|| fail(format!("missing signal '{}'", name)))?;
                Some(Self::raw_value(mux, value).map_err(fail)? as u64)
            }
            None => None,
        };

        let mut data = vec![0u8; message.size];
        for signal in message.active_signals(selector) {
            let value = values
                .get(&signal.name)
                .ok_or_else(|| fail(format!("missing signal '{}'", signal.name)))?;
            let raw = Self::raw_value(signal, value).map_err(fail)?;
            Self::insert_raw(&mut data, signal, raw).map_err(fail)?;
        }
        Ok(data)
    }

    /// Convert a raw value to its physical representation
    fn physical_value(signal: &SignalDefinition, raw: i64) -> SignalValue {
        if let Some(label) = signal.label_for(raw) {
            return SignalValue::Text(label.to_string());
        }
        let physical = signal.offset + signal.factor * (raw as f64);
        if signal.is_integral() {
            SignalValue::Integer(physical as i64)
        } else {
            SignalValue::Float(physical)
        }
    }

    /// Convert a physical value to the raw integer stored in the frame
    fn raw_value(signal: &SignalDefinition, value: &SignalValue) -> std::result::Result<i64, String> {
        let raw = match value {
            SignalValue::Text(label) => signal.raw_for_label(label).ok_or_else(|| {
                format!("'{}' is not a valid label for signal '{}'", label, signal.name)
            })?,
            SignalValue::Integer(_) | SignalValue::Float(_) => {
                let physical = value.as_f64().unwrap_or_default();
                if !physical.is_finite() {
                    return Err(format!("signal '{}' is not a finite number", signal.name));
                }
                if signal.has_range()
                    && (physical < signal.min - RANGE_EPSILON || physical > signal.max + RANGE_EPSILON)
                {
                    return Err(format!(
                        "signal '{}' value {} is outside [{}, {}]",
                        signal.name, physical, signal.min, signal.max
                    ));
                }
                if signal.factor == 0.0 {
                    return Err(format!("signal '{}' has a zero scale factor", signal.name));
                }
                ((physical - signal.offset) / signal.factor).round() as i64
            }
        };

        let (low, high) = Self::raw_bounds(signal)?;
        if raw < low || raw > high {
            return Err(format!(
                "signal '{}' raw value {} does not fit in {} bits",
                signal.name, raw, signal.length
            ));
        }
        Ok(raw)
    }

    /// Inclusive raw range representable by the signal's bit width
    fn raw_bounds(signal: &SignalDefinition) -> std::result::Result<(i64, i64), String> {
        if signal.length == 0 {
            return Err(format!("signal '{}' has a length of 0 bits", signal.name));
        }
        let length = u32::from(signal.length.min(64));
        Ok(match signal.value_type {
            ValueType::Unsigned if length >= 63 => (0, i64::MAX),
            ValueType::Unsigned => (0, (1i64 << length) - 1),
            ValueType::Signed if length >= 64 => (i64::MIN, i64::MAX),
            ValueType::Signed => (-(1i64 << (length - 1)), (1i64 << (length - 1)) - 1),
        })
    }

    /// Extract raw signal value from CAN frame data
    fn extract_raw(data: &[u8], signal: &SignalDefinition) -> std::result::Result<i64, String> {
        let positions = Self::bit_positions(signal);
        let required_bytes = positions.iter().map(|(byte, _)| byte + 1).max().unwrap_or(0);
        if required_bytes > data.len() {
            return Err(format!(
                "signal '{}' requires {} bytes but frame only has {} bytes",
                signal.name,
                required_bytes,
                data.len()
            ));
        }

        // Positions are ordered from the least significant bit upwards
        let mut raw: u64 = 0;
        for (i, (byte, bit)) in positions.iter().enumerate() {
            let bit_value = (data[*byte] >> bit) & 0x01;
            raw |= (bit_value as u64) << i;
        }

        Ok(match signal.value_type {
            ValueType::Unsigned => raw as i64,
            ValueType::Signed => Self::sign_extend(raw, signal.length as usize),
        })
    }

    /// Store a raw signal value into CAN frame data
    fn insert_raw(data: &mut [u8], signal: &SignalDefinition, raw: i64) -> std::result::Result<(), String> {
        let positions = Self::bit_positions(signal);
        let required_bytes = positions.iter().map(|(byte, _)| byte + 1).max().unwrap_or(0);
        if required_bytes > data.len() {
            return Err(format!(
                "signal '{}' does not fit in a {} byte message",
                signal.name,
                data.len()
            ));
        }

        let bits = raw as u64;
        for (i, (byte, bit)) in positions.iter().enumerate() {
            let mask = 1u8 << bit;
            if (bits >> i) & 0x01 == 1 {
                data[*byte] |= mask;
            } else {
                data[*byte] &= !mask;
            }
        }
        Ok(())
    }

    /// (byte index, bit in byte) of every signal bit, least significant first
    ///
    /// Little-endian (Intel): the start bit is the LSB and bits count upwards
    /// through the frame.
    ///
    /// Big-endian (Motorola): the start bit is the MSB in DBC numbering
    /// (bit 7 is the MSB of byte 0). The signal continues towards lower bits
    /// and then into the MSB of the next byte.
    fn bit_positions(signal: &SignalDefinition) -> Vec<(usize, u8)> {
        let start = signal.start_bit as usize;
        let length = signal.length as usize;

        match signal.byte_order {
            ByteOrder::LittleEndian => (0..length)
                .map(|i| {
                    let pos = start + i;
                    (pos / 8, (pos % 8) as u8)
                })
                .collect(),
            ByteOrder::BigEndian => {
                // Walk MSB-first in a linear numbering where 0 = MSB of byte 0
                let msb_linear = (start / 8) * 8 + (7 - start % 8);
                let mut positions: Vec<(usize, u8)> = (0..length)
                    .map(|i| {
                        let pos = msb_linear + i;
                        (pos / 8, (7 - pos % 8) as u8)
                    })
                    .collect();
                positions.reverse();
                positions
            }
        }
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length == 0 || bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::definitions::MultiplexerInfo;
    use std::collections::BTreeMap;

    fn signal(name: &str, start_bit: u16, length: u16, byte_order: ByteOrder) -> SignalDefinition {
        SignalDefinition {
            name: name.to_string(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            multiplexer_info: None,
        }
    }

    fn message(size: usize, signals: Vec<SignalDefinition>) -> MessageDefinition {
        MessageDefinition {
            id: 0x123,
            name: "TestMsg".to_string(),
            size,
            sender: None,
            is_extended: false,
            signals,
            multiplexer_signal: None,
            source: "test.dbc".to_string(),
        }
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let sig = signal("S", 0, 16, ByteOrder::LittleEndian);
        let value = SignalCodec::extract_raw(&[0xAB, 0xCD, 0xEF, 0x12], &sig).unwrap();
        assert_eq!(value, 0xCDAB);
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let sig = signal("S", 7, 8, ByteOrder::BigEndian);
        let value = SignalCodec::extract_raw(&[0xAB, 0xCD, 0xEF, 0x12], &sig).unwrap();
        assert_eq!(value, 0xAB);
    }

    #[test]
    fn test_extract_big_endian_cross_byte() {
        // Motorola 12-bit signal starting at bit 7: byte 0 then high nibble of byte 1
        let sig = signal("S", 7, 12, ByteOrder::BigEndian);
        let value = SignalCodec::extract_raw(&[0xAB, 0xCD], &sig).unwrap();
        assert_eq!(value, 0xABC);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(SignalCodec::sign_extend(0x7F, 8), 127);
        assert_eq!(SignalCodec::sign_extend(0xFF, 8), -1);
        assert_eq!(SignalCodec::sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_short_payload_is_a_decode_error() {
        let msg = message(2, vec![signal("S", 0, 16, ByteOrder::LittleEndian)]);
        let err = SignalCodec::decode(&msg, &[0x01]).unwrap_err();
        assert!(matches!(err, MirrorError::Decode { .. }));
    }

    #[test]
    fn test_encode_big_endian_matches_decode() {
        let msg = message(2, vec![signal("S", 7, 12, ByteOrder::BigEndian)]);
        let mut values = SignalMap::new();
        values.insert("S".to_string(), SignalValue::Integer(0xABC));
        let data = SignalCodec::encode(&msg, &values).unwrap();
        assert_eq!(data, vec![0xAB, 0xC0]);
        assert_eq!(SignalCodec::decode(&msg, &data).unwrap(), values);
    }

    #[test]
    fn test_scaled_and_signed_values() {
        let mut temp = signal("Temp", 0, 8, ByteOrder::LittleEndian);
        temp.value_type = ValueType::Signed;
        temp.factor = 0.5;
        temp.min = -64.0;
        temp.max = 63.5;
        let msg = message(1, vec![temp]);

        let decoded = SignalCodec::decode(&msg, &[0xFE]).unwrap();
        assert_eq!(decoded["Temp"], SignalValue::Float(-1.0));

        let mut values = SignalMap::new();
        values.insert("Temp".to_string(), SignalValue::Float(-1.0));
        assert_eq!(SignalCodec::encode(&msg, &values).unwrap(), vec![0xFE]);
    }

    #[test]
    fn test_encode_rejects_out_of_range_and_missing() {
        let mut speed = signal("Speed", 0, 8, ByteOrder::LittleEndian);
        speed.max = 250.0;
        let msg = message(2, vec![speed, signal("Gear", 8, 4, ByteOrder::LittleEndian)]);

        let mut values = SignalMap::new();
        values.insert("Speed".to_string(), SignalValue::Integer(251));
        values.insert("Gear".to_string(), SignalValue::Integer(1));
        assert!(matches!(SignalCodec::encode(&msg, &values), Err(MirrorError::Encode { .. })));

        values.insert("Speed".to_string(), SignalValue::Integer(20));
        values.insert("Gear".to_string(), SignalValue::Integer(16));
        assert!(SignalCodec::encode(&msg, &values).is_err(), "Gear only has 4 bits");

        values.shift_remove("Gear");
        let err = SignalCodec::encode(&msg, &values).unwrap_err();
        assert!(err.to_string().contains("missing signal 'Gear'"));
    }

    #[test]
    fn test_labels_round_trip() {
        let mut status = signal("Status", 0, 8, ByteOrder::LittleEndian);
        status.value_table = Some(BTreeMap::from([
            (0, "Inactive".to_string()),
            (1, "Active".to_string()),
        ]));
        let msg = message(1, vec![status]);

        let decoded = SignalCodec::decode(&msg, &[0x01]).unwrap();
        assert_eq!(decoded["Status"], SignalValue::Text("Active".to_string()));

        let mut values = SignalMap::new();
        values.insert("Status".to_string(), SignalValue::from("Inactive"));
        assert_eq!(SignalCodec::encode(&msg, &values).unwrap(), vec![0x00]);

        values.insert("Status".to_string(), SignalValue::from("Sleeping"));
        assert!(SignalCodec::encode(&msg, &values).is_err());
    }

    #[test]
    fn test_multiplexed_signals_follow_selector() {
        let mode = signal("Mode", 0, 8, ByteOrder::LittleEndian);
        let mut sig_a = signal("SignalA", 8, 8, ByteOrder::LittleEndian);
        sig_a.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![0],
        });
        let mut sig_b = signal("SignalB", 8, 8, ByteOrder::LittleEndian);
        sig_b.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![1],
        });
        let mut msg = message(2, vec![mode, sig_a, sig_b]);
        msg.multiplexer_signal = Some("Mode".to_string());

        let decoded = SignalCodec::decode(&msg, &[0x01, 0x2A]).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["SignalB"], SignalValue::Integer(42));
        assert!(!decoded.contains_key("SignalA"));

        // The inactive branch may stay in the map, it is not encoded
        let mut values = decoded.clone();
        values.insert("SignalA".to_string(), SignalValue::Integer(7));
        assert_eq!(SignalCodec::encode(&msg, &values).unwrap(), vec![0x01, 0x2A]);
    }

    #[test]
    fn test_encode_rejects_unknown_signal_names() {
        let msg = message(1, vec![signal("S", 0, 8, ByteOrder::LittleEndian)]);
        let mut values = SignalMap::new();
        values.insert("S".to_string(), SignalValue::Integer(1));
        values.insert("Typo".to_string(), SignalValue::Integer(1));
        assert!(SignalCodec::encode(&msg, &values).is_err());
    }

    #[test]
    fn test_zero_length_signal_is_an_encode_error() {
        let mut empty = signal("Empty", 0, 0, ByteOrder::LittleEndian);
        empty.value_type = ValueType::Signed;
        let msg = message(1, vec![empty]);
        let mut values = SignalMap::new();
        values.insert("Empty".to_string(), SignalValue::Integer(0));
        assert!(SignalCodec::encode(&msg, &values).is_err());
    }
}
