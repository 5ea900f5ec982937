//! eWind action table

use super::addr::{COIL_BOOST, COIL_MODE_HIGH, COIL_MODE_LOW};
use super::{
    coil_sequence, eco_mode_steps, setpoint_steps, unknown_action, unknown_mode, DeviceModel,
    ACTION_ECO_MODE, ACTION_STATUS_MODE, ACTION_TARGET_TEMPERATURE,
};
use crate::engine::{ActionTable, ActionValue, WriteStep};
use crate::error::Result;

pub const SETPOINT_MIN: f64 = 15.0;
pub const SETPOINT_MAX: f64 = 22.0;

pub struct EWindActions;

impl EWindActions {
    /// Modes "0" (low) to "3" (boost)
    fn status_mode_steps(value: &ActionValue) -> Result<Vec<WriteStep>> {
        let mode = value
            .as_mode()
            .ok_or_else(|| unknown_mode(DeviceModel::EWind, value))?;
        let coils: &[(u16, bool)] = match mode.as_str() {
            "0" => &[
                (COIL_MODE_LOW, false),
                (COIL_MODE_HIGH, false),
                (COIL_BOOST, false),
            ],
            "1" => &[(COIL_BOOST, false), (COIL_MODE_LOW, true)],
            "2" => &[(COIL_BOOST, false), (COIL_MODE_HIGH, true)],
            "3" => &[(COIL_BOOST, true)],
            _ => return Err(unknown_mode(DeviceModel::EWind, value)),
        };
        Ok(coil_sequence(coils))
    }
}

impl ActionTable for EWindActions {
    fn resolve(&self, action: &str, value: &ActionValue) -> Result<Vec<WriteStep>> {
        match action {
            ACTION_ECO_MODE => eco_mode_steps(value),
            ACTION_TARGET_TEMPERATURE => setpoint_steps(value, SETPOINT_MIN, SETPOINT_MAX),
            ACTION_STATUS_MODE => Self::status_mode_steps(value),
            other => Err(unknown_action(DeviceModel::EWind, other)),
        }
    }

    fn actions(&self) -> &[&'static str] {
        &[ACTION_ECO_MODE, ACTION_TARGET_TEMPERATURE, ACTION_STATUS_MODE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WriteCommand;
    use crate::error::VentSrvError;

    fn commands(steps: Vec<WriteStep>) -> Vec<WriteCommand> {
        steps.into_iter().map(|s| s.command).collect()
    }

    #[test]
    fn test_eco_mode_accepts_toggle_values() {
        let steps = EWindActions.resolve("eco_mode", &"1".into()).unwrap();
        assert_eq!(commands(steps), vec![WriteCommand::coil(40, true)]);

        let steps = EWindActions.resolve("eco_mode", &false.into()).unwrap();
        assert_eq!(commands(steps), vec![WriteCommand::coil(40, false)]);
    }

    #[test]
    fn test_setpoint_range() {
        let steps = EWindActions.resolve("target_temperature", &18.5.into()).unwrap();
        assert_eq!(commands(steps), vec![WriteCommand::register(135, 185)]);

        for out_of_range in [14.5, 22.5] {
            assert!(matches!(
                EWindActions.resolve("target_temperature", &out_of_range.into()),
                Err(VentSrvError::ValidationError(_))
            ));
        }
    }

    #[test]
    fn test_status_mode_sequences() {
        let steps = EWindActions.resolve("status_mode", &"0".into()).unwrap();
        assert_eq!(
            commands(steps),
            vec![
                WriteCommand::coil(1, false),
                WriteCommand::coil(3, false),
                WriteCommand::coil(10, false),
            ]
        );

        let steps = EWindActions.resolve("status_mode", &"2".into()).unwrap();
        assert_eq!(
            commands(steps),
            vec![WriteCommand::coil(10, false), WriteCommand::coil(3, true)]
        );

        let steps = EWindActions.resolve("status_mode", &ActionValue::Number(3.0)).unwrap();
        assert_eq!(commands(steps), vec![WriteCommand::coil(10, true)]);
    }

    #[test]
    fn test_away_mode_not_available() {
        assert!(EWindActions.resolve("status_mode", &"4".into()).is_err());
        assert!(EWindActions.resolve("fireplace", &true.into()).is_err());
    }
}
