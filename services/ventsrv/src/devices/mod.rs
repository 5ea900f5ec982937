//! Exvent device models
//!
//! Both families expose the same register layout; they differ in which
//! set-points and operating modes they accept.

pub mod eair;
pub mod ewind;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{ActionTable, ActionValue, WriteCommand, WriteStep};
use crate::error::{Result, VentSrvError};
use crate::model::{RegisterDefinition, RegisterTable, WireType};

pub use eair::EAirActions;
pub use ewind::EWindActions;

/// Action names shared by both families
pub const ACTION_ECO_MODE: &str = "eco_mode";
pub const ACTION_TARGET_TEMPERATURE: &str = "target_temperature";
pub const ACTION_STATUS_MODE: &str = "status_mode";

/// Coil and register addresses written by the action tables
pub(crate) mod addr {
    pub const COIL_AWAY: u16 = 0;
    pub const COIL_MODE_LOW: u16 = 1;
    pub const COIL_MODE_HIGH: u16 = 3;
    pub const COIL_BOOST: u16 = 10;
    pub const COIL_ECO: u16 = 40;
    pub const REG_TEMPERATURE_SETPOINT: u16 = 135;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceModel {
    EAir,
    EWind,
}

impl DeviceModel {
    pub fn register_table(&self) -> RegisterTable {
        exvent_registers()
    }

    pub fn action_table(&self) -> Arc<dyn ActionTable> {
        match self {
            DeviceModel::EAir => Arc::new(EAirActions),
            DeviceModel::EWind => Arc::new(EWindActions),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceModel::EAir => "eair",
            DeviceModel::EWind => "ewind",
        }
    }
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceModel {
    type Err = VentSrvError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eair" => Ok(DeviceModel::EAir),
            "ewind" => Ok(DeviceModel::EWind),
            other => Err(VentSrvError::config(format!("Unknown device model: {}", other))),
        }
    }
}

/// Pause between the coil writes of a mode change
pub const MODE_STEP_DELAY: Duration = Duration::from_secs(1);

pub(crate) fn eco_mode_steps(value: &ActionValue) -> Result<Vec<WriteStep>> {
    let on = value.as_bool().ok_or_else(|| {
        VentSrvError::validation(format!("{} expects on/off, got {}", ACTION_ECO_MODE, value))
    })?;
    Ok(vec![WriteStep::new(WriteCommand::coil(addr::COIL_ECO, on))])
}

/// Degrees Celsius, written in tenths
pub(crate) fn setpoint_steps(value: &ActionValue, min: f64, max: f64) -> Result<Vec<WriteStep>> {
    let celsius = value.as_number().ok_or_else(|| {
        VentSrvError::validation(format!(
            "{} expects a number, got {}",
            ACTION_TARGET_TEMPERATURE, value
        ))
    })?;
    if !(min..=max).contains(&celsius) {
        return Err(VentSrvError::validation(format!(
            "{} {} outside {}..={}",
            ACTION_TARGET_TEMPERATURE, celsius, min, max
        )));
    }
    let tenths = (celsius * 10.0).round() as u16;
    Ok(vec![WriteStep::new(WriteCommand::register(
        addr::REG_TEMPERATURE_SETPOINT,
        tenths,
    ))])
}

/// Coil writes in order with `MODE_STEP_DELAY` between them
pub(crate) fn coil_sequence(coils: &[(u16, bool)]) -> Vec<WriteStep> {
    let last = coils.len().saturating_sub(1);
    coils
        .iter()
        .enumerate()
        .map(|(index, &(address, value))| {
            let step = WriteStep::new(WriteCommand::coil(address, value));
            if index < last {
                step.then_wait(MODE_STEP_DELAY)
            } else {
                step
            }
        })
        .collect()
}

pub(crate) fn unknown_action(model: DeviceModel, action: &str) -> VentSrvError {
    VentSrvError::validation(format!("{} has no action {}", model, action))
}

pub(crate) fn unknown_mode(model: DeviceModel, value: &ActionValue) -> VentSrvError {
    VentSrvError::validation(format!(
        "{} {} not supported by {}",
        ACTION_STATUS_MODE, value, model
    ))
}

/// Holding registers first, then the coil status block
pub fn exvent_registers() -> RegisterTable {
    let tenths = |address: u16, label: &str| {
        RegisterDefinition::holding(address, WireType::Int16, label).with_divisor(10.0)
    };
    let holding = |address: u16, wire_type: WireType, label: &str| {
        RegisterDefinition::holding(address, wire_type, label)
    };
    let coil = |address: u16, label: &str| RegisterDefinition::coil(address, WireType::Uint32, label);

    [
        ("air_outside", tenths(6, "Fresh air")),
        ("air_supply_HRC", tenths(7, "Supply air after HRC")),
        ("air_supply", tenths(8, "Supply air")),
        ("air_exhaust", tenths(9, "Exhaust air")),
        ("air_extract", tenths(10, "Extract air temperature")),
        ("air_humidity", holding(13, WireType::Uint16, "Air humidity extract")),
        ("air_supply_eff", holding(29, WireType::Uint16, "Heat recovery efficiency, supply air")),
        ("air_extract_eff", holding(30, WireType::Uint16, "Heat recovery efficiency, exhaust air")),
        ("fan_speed_level", holding(50, WireType::Uint16, "Fan speed level")),
        ("temperature_setpoint", tenths(135, "Temperature setpoint")),
        ("status", holding(45, WireType::Int16, "status")),
        ("status_mode", holding(44, WireType::Int16, "statusMode")),
        ("eco_mode", coil(40, "eco Mode")),
        ("alarm_b_desc", coil(42, "Alarm B description")),
        ("heater_status", coil(32, "After-heater On/Off")),
        ("heat_exchanger_state", coil(30, "State of Heat exchanger On/Off")),
    ]
    .into_iter()
    .collect()
}
