//! eAir action table
//!
//! Every mode change first clears the away coil, then selects the fan level.

use super::addr::{COIL_AWAY, COIL_BOOST, COIL_MODE_HIGH, COIL_MODE_LOW};
use super::{
    coil_sequence, eco_mode_steps, setpoint_steps, unknown_action, unknown_mode, DeviceModel,
    ACTION_ECO_MODE, ACTION_STATUS_MODE, ACTION_TARGET_TEMPERATURE,
};
use crate::engine::{ActionTable, ActionValue, WriteStep};
use crate::error::Result;

pub const SETPOINT_MIN: f64 = 0.0;
pub const SETPOINT_MAX: f64 = 40.0;

pub struct EAirActions;

impl EAirActions {
    /// Modes "0" (low) to "3" (boost), "4" (away)
    fn status_mode_steps(value: &ActionValue) -> Result<Vec<WriteStep>> {
        let mode = value
            .as_mode()
            .ok_or_else(|| unknown_mode(DeviceModel::EAir, value))?;
        let coils: &[(u16, bool)] = match mode.as_str() {
            "0" => &[
                (COIL_AWAY, false),
                (COIL_MODE_LOW, false),
                (COIL_MODE_HIGH, false),
                (COIL_BOOST, false),
            ],
            "1" => &[(COIL_AWAY, false), (COIL_BOOST, false), (COIL_MODE_LOW, true)],
            "2" => &[(COIL_AWAY, false), (COIL_BOOST, false), (COIL_MODE_HIGH, true)],
            "3" => &[(COIL_AWAY, false), (COIL_BOOST, true)],
            "4" => &[(COIL_AWAY, true)],
            _ => return Err(unknown_mode(DeviceModel::EAir, value)),
        };
        Ok(coil_sequence(coils))
    }
}

impl ActionTable for EAirActions {
    fn resolve(&self, action: &str, value: &ActionValue) -> Result<Vec<WriteStep>> {
        match action {
            ACTION_ECO_MODE => eco_mode_steps(value),
            ACTION_TARGET_TEMPERATURE => setpoint_steps(value, SETPOINT_MIN, SETPOINT_MAX),
            ACTION_STATUS_MODE => Self::status_mode_steps(value),
            other => Err(unknown_action(DeviceModel::EAir, other)),
        }
    }

    fn actions(&self) -> &[&'static str] {
        &[ACTION_ECO_MODE, ACTION_TARGET_TEMPERATURE, ACTION_STATUS_MODE]
    }
}
