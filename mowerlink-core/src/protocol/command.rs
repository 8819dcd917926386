//! Command vocabulary and wire encoding.
//!
//! | Command          | Bytes            |
//! |------------------|------------------|
//! | `start`          | `01 01`          |
//! | `stop`           | `01 00`          |
//! | `pause`          | `01 02`          |
//! | `return_home`    | `02 01`          |
//! | `emergency_stop` | `FF 00`          |
//! | `blade_on`       | `03 01`          |
//! | `blade_off`      | `03 00`          |
//! | `manual_control` | `04 x y speed`   |
//! | `status_check`   | `10`             |
//! | `battery_check`  | `11`             |

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::error::ParseError;

/// Opcode of the manual drive command
pub const MANUAL_CONTROL_OPCODE: u8 = 0x04;

/// Payload sent for `manual_control` when the caller supplies none
pub const MANUAL_CONTROL_DEFAULT: [u8; 3] = [MANUAL_CONTROL_OPCODE, 0x00, 0x00];

/// Commands understood by the mower.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MowerCommand {
    Start,
    Stop,
    Pause,
    ReturnHome,
    EmergencyStop,
    BladeOn,
    BladeOff,
    /// Raw drive frame, or any caller-supplied payload
    ManualControl,
    /// Status query (`0x10`)
    StatusCheck,
    /// Battery query (`0x11`)
    BatteryCheck,
}

impl MowerCommand {
    /// Look up a command by its wire name (`"return_home"`).
    pub fn from_name(name: &str) -> Result<Self, ParseError> {
        MowerCommand::from_str(name).map_err(|_| ParseError::UnknownCommand(name.to_string()))
    }

    /// All known command names.
    pub fn names() -> Vec<&'static str> {
        MowerCommand::iter().map(|c| c.name()).collect()
    }

    /// Wire name of this command.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Encode the command for the write characteristic.
    ///
    /// `payload` is only used by [`MowerCommand::ManualControl`], which
    /// forwards it verbatim; every other command has a fixed encoding.
    pub fn encode(&self, payload: Option<&[u8]>) -> Vec<u8> {
        match self {
            MowerCommand::Start => vec![0x01, 0x01],
            MowerCommand::Stop => vec![0x01, 0x00],
            MowerCommand::Pause => vec![0x01, 0x02],
            MowerCommand::ReturnHome => vec![0x02, 0x01],
            MowerCommand::EmergencyStop => vec![0xFF, 0x00],
            MowerCommand::BladeOn => vec![0x03, 0x01],
            MowerCommand::BladeOff => vec![0x03, 0x00],
            MowerCommand::ManualControl => match payload {
                Some(data) => data.to_vec(),
                None => MANUAL_CONTROL_DEFAULT.to_vec(),
            },
            MowerCommand::StatusCheck => vec![0x10],
            MowerCommand::BatteryCheck => vec![0x11],
        }
    }
}

// =============================================================================
// Joystick
// =============================================================================

/// Joystick position as reported by a UI control.
///
/// `x` and `y` are percentages in [-100, 100], `speed` in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JoystickInput {
    pub x: f64,
    pub y: f64,
    pub speed: f64,
}

impl JoystickInput {
    pub fn new(x: f64, y: f64, speed: f64) -> Self {
        JoystickInput { x, y, speed }
    }

    /// Axis percentage to signed byte, clamped to [-127, 127].
    pub fn axis_to_i8(value: f64) -> i8 {
        round_half_up(value * 127.0 / 100.0).clamp(-127.0, 127.0) as i8
    }

    /// Speed percentage to unsigned byte, clamped to [0, 255].
    pub fn speed_to_u8(value: f64) -> u8 {
        round_half_up(value * 255.0 / 100.0).clamp(0.0, 255.0) as u8
    }

    /// Build the `manual_control` frame: `04 x y speed`.
    pub fn encode(&self) -> [u8; 4] {
        [
            MANUAL_CONTROL_OPCODE,
            Self::axis_to_i8(self.x) as u8,
            Self::axis_to_i8(self.y) as u8,
            Self::speed_to_u8(self.speed),
        ]
    }
}

/// Round with ties towards +infinity, so -63.5 becomes -63.
fn round_half_up(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value + 0.5).floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_encodings() {
        assert_eq!(MowerCommand::Start.encode(None), vec![0x01, 0x01]);
        assert_eq!(MowerCommand::Stop.encode(None), vec![0x01, 0x00]);
        assert_eq!(MowerCommand::Pause.encode(None), vec![0x01, 0x02]);
        assert_eq!(MowerCommand::ReturnHome.encode(None), vec![0x02, 0x01]);
        assert_eq!(MowerCommand::EmergencyStop.encode(None), vec![0xFF, 0x00]);
        assert_eq!(MowerCommand::BladeOn.encode(None), vec![0x03, 0x01]);
        assert_eq!(MowerCommand::BladeOff.encode(None), vec![0x03, 0x00]);
        // payload is ignored for fixed commands
        assert_eq!(MowerCommand::Stop.encode(Some(&[0x99])), vec![0x01, 0x00]);
    }

    #[test]
    fn test_manual_control_payload() {
        assert_eq!(
            MowerCommand::ManualControl.encode(None),
            vec![0x04, 0x00, 0x00]
        );
        assert_eq!(
            MowerCommand::ManualControl.encode(Some(&[0x10])),
            vec![0x10]
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(
            MowerCommand::from_name("return_home").unwrap(),
            MowerCommand::ReturnHome
        );
        assert_eq!(
            MowerCommand::from_name("emergency_stop").unwrap(),
            MowerCommand::EmergencyStop
        );
        assert_eq!(
            MowerCommand::from_name("self_destruct"),
            Err(ParseError::UnknownCommand("self_destruct".to_string()))
        );
        assert_eq!(MowerCommand::BladeOff.to_string(), "blade_off");
        for cmd in MowerCommand::iter() {
            assert_eq!(cmd.to_string(), cmd.name());
            assert_eq!(MowerCommand::from_name(cmd.name()).unwrap(), cmd);
        }
        assert_eq!(MowerCommand::names().len(), 10);
        assert_eq!(MowerCommand::ReturnHome.name(), "return_home");
    }

    #[test]
    fn test_joystick_extremes() {
        let frame = JoystickInput::new(100.0, -100.0, 50.0).encode();
        // x=100 -> 127, y=-100 -> -127 (0x81, never -128), speed 127.5 -> 128
        assert_eq!(frame, [0x04, 0x7F, 0x81, 0x80]);

        let frame = JoystickInput::new(0.0, 0.0, 100.0).encode();
        assert_eq!(frame, [0x04, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn test_joystick_clamping() {
        assert_eq!(JoystickInput::axis_to_i8(250.0), 127);
        assert_eq!(JoystickInput::axis_to_i8(-250.0), -127);
        assert_eq!(JoystickInput::speed_to_u8(-10.0), 0);
        assert_eq!(JoystickInput::speed_to_u8(400.0), 255);
        assert_eq!(JoystickInput::axis_to_i8(f64::NAN), 0);
    }

    #[test]
    fn test_joystick_rounding() {
        // -50% -> -63.5 rounds towards +inf
        assert_eq!(JoystickInput::axis_to_i8(-50.0), -63);
        assert_eq!(JoystickInput::axis_to_i8(50.0), 64);
    }
}
