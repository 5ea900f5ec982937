//! Register value codec
//!
//! `RegisterCodec` turns raw register bytes into measurement strings and
//! back. Request framing lives in tokio-modbus.

use tracing::{debug, warn};

use crate::error::{Result, VentSrvError};
use crate::model::{Measurement, RegisterDefinition, WireType};

/// Register value decoding
pub struct RegisterCodec;

impl RegisterCodec {
    /// Decode raw big-endian register bytes into a measurement string
    pub fn decode(wire_type: &WireType, raw: &[u8]) -> Result<String> {
        let value = match wire_type {
            WireType::Uint16 => u16::from_be_bytes(Self::take::<2>(wire_type, raw)?).to_string(),
            WireType::Int16 | WireType::Scale => {
                i16::from_be_bytes(Self::take::<2>(wire_type, raw)?).to_string()
            },
            WireType::Uint32 => {
                if raw.len() >= 4 {
                    u32::from_be_bytes(Self::take::<4>(wire_type, raw)?).to_string()
                } else {
                    u16::from_be_bytes(Self::take::<2>(wire_type, raw)?).to_string()
                }
            },
            WireType::Acc32 => u32::from_be_bytes(Self::take::<4>(wire_type, raw)?).to_string(),
            WireType::Float => f32::from_be_bytes(Self::take::<4>(wire_type, raw)?).to_string(),
            WireType::Float32 => {
                let [a, b, c, d] = Self::take::<4>(wire_type, raw)?;
                f32::from_be_bytes([c, d, a, b]).to_string()
            },
            WireType::String => String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_string(),
            WireType::Unknown(name) => {
                return Err(VentSrvError::decode(format!("Unknown wire type: {}", name)));
            },
        };
        Ok(value)
    }

    /// Decode one register into a measurement, sentinel on failure
    pub fn decode_measurement(name: &str, definition: &RegisterDefinition, raw: &[u8]) -> Measurement {
        match Self::decode(&definition.wire_type, raw) {
            Ok(value) => {
                debug!("{} ({}) = {}", name, definition.wire_type, value);
                Measurement::new(value, definition.label.clone())
            },
            Err(e) => {
                warn!("Decode failed for {}: {}", name, e);
                Measurement::unavailable(definition.label.clone())
            },
        }
    }

    /// Encode a numeric value into register words (inverse of `decode`)
    pub fn encode(wire_type: &WireType, value: f64) -> Result<Vec<u16>> {
        if !value.is_finite() {
            return Err(VentSrvError::validation(format!(
                "Cannot encode non-finite value {}",
                value
            )));
        }

        let words = match wire_type {
            WireType::Uint16 => vec![Self::in_range(value, 0.0, f64::from(u16::MAX))? as u16],
            WireType::Int16 | WireType::Scale => {
                let v = Self::in_range(value, f64::from(i16::MIN), f64::from(i16::MAX))?;
                vec![v as i16 as u16]
            },
            WireType::Uint32 | WireType::Acc32 => {
                let v = Self::in_range(value, 0.0, f64::from(u32::MAX))? as u32;
                vec![(v >> 16) as u16, v as u16]
            },
            WireType::Float => {
                let bits = (value as f32).to_bits();
                vec![(bits >> 16) as u16, bits as u16]
            },
            WireType::Float32 => {
                let bits = (value as f32).to_bits();
                vec![bits as u16, (bits >> 16) as u16]
            },
            WireType::String | WireType::Unknown(_) => {
                return Err(VentSrvError::validation(format!(
                    "Wire type {} is not numeric",
                    wire_type
                )));
            },
        };
        Ok(words)
    }

    fn take<const N: usize>(wire_type: &WireType, raw: &[u8]) -> Result<[u8; N]> {
        raw.get(..N)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                VentSrvError::decode(format!(
                    "{} needs {} bytes, got {}",
                    wire_type,
                    N,
                    raw.len()
                ))
            })
    }

    fn in_range(value: f64, min: f64, max: f64) -> Result<f64> {
        let rounded = value.round();
        if rounded < min || rounded > max {
            return Err(VentSrvError::validation(format!(
                "Value {} out of range [{}, {}]",
                value, min, max
            )));
        }
        Ok(rounded)
    }
}

/// Register words to big-endian bytes
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Coil states as one 16-bit word each (0 or 1)
pub fn coils_to_bytes(coils: &[bool]) -> Vec<u8> {
    coils
        .iter()
        .flat_map(|&c| u16::from(c).to_be_bytes())
        .collect()
}
