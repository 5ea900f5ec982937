//! Register table and measurement types shared by the codec, the poller and
//! the device models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VentSrvError};

/// Value published for a register that could not be read or decoded
pub const SENTINEL: &str = "unavailable";

/// Suffix marking a SCALE register that belongs to another measurement
pub const SCALE_SUFFIX: &str = "_scale";

/// Wire encoding of a register value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WireType {
    Uint16,
    Int16,
    /// 32-bit when two registers are read, otherwise the first word
    Uint32,
    /// Strict 32-bit accumulator
    Acc32,
    /// IEEE-754 single precision, big-endian
    Float,
    /// IEEE-754 single precision with the two words swapped
    Float32,
    String,
    /// INT16 exponent/scale for a sibling register
    Scale,
    Unknown(String),
}

impl WireType {
    pub fn as_str(&self) -> &str {
        match self {
            WireType::Uint16 => "UINT16",
            WireType::Int16 => "INT16",
            WireType::Uint32 => "UINT32",
            WireType::Acc32 => "ACC32",
            WireType::Float => "FLOAT",
            WireType::Float32 => "FLOAT32",
            WireType::String => "STRING",
            WireType::Scale => "SCALE",
            WireType::Unknown(name) => name,
        }
    }
}

impl FromStr for WireType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "UINT16" => WireType::Uint16,
            "INT16" => WireType::Int16,
            "UINT32" => WireType::Uint32,
            "ACC32" => WireType::Acc32,
            "FLOAT" => WireType::Float,
            "FLOAT32" => WireType::Float32,
            "STRING" => WireType::String,
            "SCALE" => WireType::Scale,
            _ => WireType::Unknown(s.to_string()),
        })
    }
}

impl From<String> for WireType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(wire_type) => wire_type,
            Err(never) => match never {},
        }
    }
}

impl From<WireType> for String {
    fn from(wire_type: WireType) -> Self {
        wire_type.as_str().to_string()
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which read function serves the register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterSource {
    /// FC03
    #[default]
    Holding,
    /// FC01
    Coil,
}

/// One readable register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub address: u16,
    #[serde(default = "default_quantity")]
    pub quantity: u16,
    pub wire_type: WireType,
    pub label: String,
    #[serde(default)]
    pub source: RegisterSource,
    /// Calibration applied by consumers for display; the engine never uses it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divisor: Option<f64>,
}

fn default_quantity() -> u16 {
    1
}

impl RegisterDefinition {
    pub fn holding(address: u16, wire_type: WireType, label: impl Into<String>) -> Self {
        Self {
            address,
            quantity: 1,
            wire_type,
            label: label.into(),
            source: RegisterSource::Holding,
            divisor: None,
        }
    }

    pub fn coil(address: u16, wire_type: WireType, label: impl Into<String>) -> Self {
        Self {
            source: RegisterSource::Coil,
            ..Self::holding(address, wire_type, label)
        }
    }

    pub fn with_quantity(mut self, quantity: u16) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn with_divisor(mut self, divisor: f64) -> Self {
        self.divisor = Some(divisor);
        self
    }
}

/// Ordered set of named registers; iteration order is the sweep order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterTable {
    entries: Vec<(String, RegisterDefinition)>,
}

impl RegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a register, names must be unique
    pub fn insert(&mut self, name: impl Into<String>, definition: RegisterDefinition) -> Result<()> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(VentSrvError::config(format!(
                "Duplicate register name: {}",
                name
            )));
        }
        if definition.quantity == 0 {
            return Err(VentSrvError::config(format!(
                "Register {} has zero quantity",
                name
            )));
        }
        self.entries.push((name, definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegisterDefinition> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, def)| def)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisterDefinition)> {
        self.entries.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, RegisterDefinition)> for RegisterTable {
    /// Later duplicates are dropped
    fn from_iter<I: IntoIterator<Item = (S, RegisterDefinition)>>(iter: I) -> Self {
        let mut table = RegisterTable::new();
        for (name, def) in iter {
            let _ = table.insert(name, def);
        }
        table
    }
}

/// Decoded value of one register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: String,
    pub scale: String,
    pub label: String,
}

impl Measurement {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            scale: SENTINEL.to_string(),
            label: label.into(),
        }
    }

    pub fn unavailable(label: impl Into<String>) -> Self {
        Self::new(SENTINEL, label)
    }

    pub fn is_available(&self) -> bool {
        self.value != SENTINEL
    }

    /// Numeric value divided by `divisor`, None for the sentinel
    pub fn calibrated(&self, divisor: Option<f64>) -> Option<f64> {
        if !self.is_available() {
            return None;
        }
        let raw: f64 = self.value.parse().ok()?;
        Some(match divisor {
            Some(d) if d != 0.0 => raw / d,
            _ => raw,
        })
    }
}

/// Result of one sweep keyed by logical register name
pub type MeasurementSet = BTreeMap<String, Measurement>;
