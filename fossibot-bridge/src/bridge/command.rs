//! Broker-side command ingress.
//!
//! Commands arrive as JSON on `fossibot/{mac}/command` and are parsed
//! once into a closed [`Command`] sum. Unknown actions, missing values
//! and out-of-range parameters are dropped with a warning; nothing is
//! published back (fire-and-forget contract). Validation happens before
//! any frame is built, so a rejected command never reaches the device.

use serde_json::Value;
use thiserror::Error;

use crate::modbus::{self, build_write_request};
use crate::state::regs;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload has no action field")]
    MissingAction,
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("action {action} needs a numeric {field} field")]
    MissingValue {
        action: &'static str,
        field: &'static str,
    },
    #[error("{field} {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("a sleep time of 0 would brick the device")]
    ForbiddenSleepTime,
}

/// What a command does, which decides its send discipline: output writes
/// may be sent back-to-back, settings writes need >= 2 s spacing per
/// device and a delayed refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Output,
    Setting,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    UsbOn,
    UsbOff,
    DcOn,
    DcOff,
    AcOn,
    AcOff,
    LedOn,
    LedOff,
    SetChargingCurrent { amps: u16 },
    SetAcSilentCharging { enabled: bool },
    SetUsbStandbyTime { minutes: u16 },
    SetAcStandbyTime { minutes: u16 },
    SetDcStandbyTime { minutes: u16 },
    SetScreenRestTime { seconds: u16 },
    SetSleepTime { minutes: u16 },
    SetDischargeLimit { tenths: u16 },
    SetAcChargingLimit { tenths: u16 },
    /// Immediate register poll outside the timer cycle.
    Refresh,
}

impl Command {
    pub fn parse(payload: &[u8]) -> Result<Command, CommandError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| CommandError::InvalidJson(e.to_string()))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingAction)?;

        match action {
            "usb_on" => Ok(Command::UsbOn),
            "usb_off" => Ok(Command::UsbOff),
            "dc_on" => Ok(Command::DcOn),
            "dc_off" => Ok(Command::DcOff),
            "ac_on" => Ok(Command::AcOn),
            "ac_off" => Ok(Command::AcOff),
            "led_on" => Ok(Command::LedOn),
            "led_off" => Ok(Command::LedOff),
            "refresh" => Ok(Command::Refresh),
            "set_charging_current" => {
                let amps = int_field(&value, "set_charging_current", "value")?;
                Ok(Command::SetChargingCurrent {
                    amps: in_range("charging current", amps, 1, 20)?,
                })
            }
            "set_ac_silent_charging" => {
                let enabled = value
                    .get("enabled")
                    .and_then(Value::as_bool)
                    .ok_or(CommandError::MissingValue {
                        action: "set_ac_silent_charging",
                        field: "enabled",
                    })?;
                Ok(Command::SetAcSilentCharging { enabled })
            }
            "set_usb_standby_time" => {
                let minutes = int_field(&value, "set_usb_standby_time", "value")?;
                Ok(Command::SetUsbStandbyTime {
                    minutes: in_range("USB standby time", minutes, 0, 1440)?,
                })
            }
            "set_ac_standby_time" => {
                let minutes = int_field(&value, "set_ac_standby_time", "value")?;
                Ok(Command::SetAcStandbyTime {
                    minutes: in_range("AC standby time", minutes, 0, 1440)?,
                })
            }
            "set_dc_standby_time" => {
                let minutes = int_field(&value, "set_dc_standby_time", "value")?;
                Ok(Command::SetDcStandbyTime {
                    minutes: in_range("DC standby time", minutes, 0, 1440)?,
                })
            }
            "set_screen_rest_time" => {
                let seconds = int_field(&value, "set_screen_rest_time", "value")?;
                Ok(Command::SetScreenRestTime {
                    seconds: in_range("screen rest time", seconds, 0, 1800)?,
                })
            }
            "set_sleep_time" => {
                let minutes = int_field(&value, "set_sleep_time", "value")?;
                if minutes == 0 {
                    return Err(CommandError::ForbiddenSleepTime);
                }
                Ok(Command::SetSleepTime {
                    minutes: in_range("sleep time", minutes, 1, 1440)?,
                })
            }
            "set_discharge_limit" => {
                let tenths = percent_field(&value, "set_discharge_limit")?;
                Ok(Command::SetDischargeLimit { tenths })
            }
            "set_ac_charging_limit" => {
                let tenths = percent_field(&value, "set_ac_charging_limit")?;
                Ok(Command::SetAcChargingLimit { tenths })
            }
            other => Err(CommandError::UnknownAction(other.to_string())),
        }
    }

    pub fn kind(self) -> CommandKind {
        match self {
            Command::UsbOn
            | Command::UsbOff
            | Command::DcOn
            | Command::DcOff
            | Command::AcOn
            | Command::AcOff
            | Command::LedOn
            | Command::LedOff => CommandKind::Output,
            Command::Refresh => CommandKind::Refresh,
            _ => CommandKind::Setting,
        }
    }

    /// The Modbus frame this command publishes to the device.
    pub fn to_frame(self) -> Vec<u8> {
        let (register, value) = match self {
            Command::UsbOn => (regs::USB_OUTPUT, 1),
            Command::UsbOff => (regs::USB_OUTPUT, 0),
            Command::DcOn => (regs::DC_OUTPUT, 1),
            Command::DcOff => (regs::DC_OUTPUT, 0),
            Command::AcOn => (regs::AC_OUTPUT, 1),
            Command::AcOff => (regs::AC_OUTPUT, 0),
            Command::LedOn => (regs::LED, 1),
            Command::LedOff => (regs::LED, 0),
            Command::SetChargingCurrent { amps } => (regs::MAX_CHARGING_CURRENT, amps),
            Command::SetAcSilentCharging { enabled } => {
                (regs::AC_SILENT_CHARGING, u16::from(enabled))
            }
            Command::SetUsbStandbyTime { minutes } => (regs::USB_STANDBY_TIME, minutes),
            Command::SetAcStandbyTime { minutes } => (regs::AC_STANDBY_TIME, minutes),
            Command::SetDcStandbyTime { minutes } => (regs::DC_STANDBY_TIME, minutes),
            Command::SetScreenRestTime { seconds } => (regs::SCREEN_REST_TIME, seconds),
            Command::SetSleepTime { minutes } => (regs::SLEEP_TIME, minutes),
            Command::SetDischargeLimit { tenths } => (regs::DISCHARGE_LOWER_LIMIT, tenths),
            Command::SetAcChargingLimit { tenths } => (regs::AC_CHARGING_UPPER_LIMIT, tenths),
            Command::Refresh => return modbus::build_poll_request(),
        };
        build_write_request(register as u16, value)
    }
}

fn int_field(value: &Value, action: &'static str, field: &'static str) -> Result<i64, CommandError> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .ok_or(CommandError::MissingValue { action, field })
}

fn in_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<u16, CommandError> {
    if value < min || value > max {
        return Err(CommandError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value as u16)
}

/// Percent fields accept fractional values and are stored in tenths of a
/// percent on the device.
fn percent_field(value: &Value, action: &'static str) -> Result<u16, CommandError> {
    let percent = value
        .get("value")
        .and_then(Value::as_f64)
        .ok_or(CommandError::MissingValue {
            action,
            field: "value",
        })?;
    let tenths = (percent * 10.0).round();
    if !(0.0..=1000.0).contains(&tenths) {
        return Err(CommandError::OutOfRange {
            field: "percentage",
            value: percent as i64,
            min: 0,
            max: 100,
        });
    }
    Ok(tenths as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<Command, CommandError> {
        Command::parse(json.as_bytes())
    }

    #[test]
    fn output_actions_map_to_their_registers() {
        let frame = parse(r#"{"action":"usb_on"}"#).unwrap().to_frame();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x18, 0x00, 0x01]);
        let frame = parse(r#"{"action":"dc_off"}"#).unwrap().to_frame();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x19, 0x00, 0x00]);
        let frame = parse(r#"{"action":"ac_on"}"#).unwrap().to_frame();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x1A, 0x00, 0x01]);
        let frame = parse(r#"{"action":"led_off"}"#).unwrap().to_frame();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x1B, 0x00, 0x00]);
    }

    #[test]
    fn sleep_time_zero_is_rejected_before_any_frame_exists() {
        assert_eq!(
            parse(r#"{"action":"set_sleep_time","value":0}"#),
            Err(CommandError::ForbiddenSleepTime)
        );
    }

    #[test]
    fn sleep_time_in_range_builds_a_write() {
        let command = parse(r#"{"action":"set_sleep_time","value":30}"#).unwrap();
        assert_eq!(command, Command::SetSleepTime { minutes: 30 });
        assert_eq!(command.kind(), CommandKind::Setting);
        let frame = command.to_frame();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x44, 0x00, 0x1E]);
    }

    #[test]
    fn percent_limits_scale_to_tenths() {
        let command = parse(r#"{"action":"set_discharge_limit","value":25}"#).unwrap();
        assert_eq!(command, Command::SetDischargeLimit { tenths: 250 });
        let command = parse(r#"{"action":"set_ac_charging_limit","value":80.5}"#).unwrap();
        assert_eq!(command, Command::SetAcChargingLimit { tenths: 805 });
        let command = parse(r#"{"action":"set_discharge_limit","value":100}"#).unwrap();
        assert_eq!(command, Command::SetDischargeLimit { tenths: 1000 });
        let command = parse(r#"{"action":"set_discharge_limit","value":0}"#).unwrap();
        assert_eq!(command, Command::SetDischargeLimit { tenths: 0 });
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            parse(r#"{"action":"set_charging_current","value":21}"#),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse(r#"{"action":"set_charging_current","value":0}"#),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse(r#"{"action":"set_discharge_limit","value":100.1}"#),
            Err(CommandError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse(r#"{"action":"set_screen_rest_time","value":-1}"#),
            Err(CommandError::OutOfRange { .. })
        ));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            Command::parse(b"not json"),
            Err(CommandError::InvalidJson(_))
        ));
        assert_eq!(parse(r#"{"value":3}"#), Err(CommandError::MissingAction));
        assert_eq!(
            parse(r#"{"action":"explode"}"#),
            Err(CommandError::UnknownAction("explode".to_string()))
        );
        assert!(matches!(
            parse(r#"{"action":"set_charging_current"}"#),
            Err(CommandError::MissingValue { .. })
        ));
        assert!(matches!(
            parse(r#"{"action":"set_ac_silent_charging","enabled":"yes"}"#),
            Err(CommandError::MissingValue { .. })
        ));
    }

    #[test]
    fn kinds_drive_the_send_discipline() {
        assert_eq!(parse(r#"{"action":"usb_on"}"#).unwrap().kind(), CommandKind::Output);
        assert_eq!(
            parse(r#"{"action":"set_charging_current","value":8}"#).unwrap().kind(),
            CommandKind::Setting
        );
        assert_eq!(parse(r#"{"action":"refresh"}"#).unwrap().kind(), CommandKind::Refresh);
    }

    #[test]
    fn silent_charging_writes_zero_or_one() {
        let on = parse(r#"{"action":"set_ac_silent_charging","enabled":true}"#).unwrap();
        assert_eq!(&on.to_frame()[..6], &[0x11, 0x06, 0x00, 0x39, 0x00, 0x01]);
        let off = parse(r#"{"action":"set_ac_silent_charging","enabled":false}"#).unwrap();
        assert_eq!(&off.to_frame()[..6], &[0x11, 0x06, 0x00, 0x39, 0x00, 0x00]);
    }
}
