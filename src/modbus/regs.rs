use crate::{EResult, Error};

pub const CHAMBER_ALARM_STATUS: &str = "ChamberAlarmStatus";
pub const T: &str = "T";
pub const T_SETPOINT: &str = "TSetpoint";
pub const T_ALARM_STATUS: &str = "TAlarmStatus";
pub const H: &str = "H";
pub const H_SETPOINT: &str = "HSetpoint";
pub const H_ALARM_STATUS: &str = "HAlarmStatus";
pub const HEATING_POWER: &str = "HeatingPower";
pub const COOLING_POWER: &str = "CoolingPower";
pub const HUMID_POWER: &str = "HumidPower";
pub const DEHUMID_POWER: &str = "DehumidPower";
pub const TIME_SIGNAL: &str = "TimeSignal";

/// A holding register of the chamber controller
///
/// Raw words are signed 16-bit fixed point values with `decimals` decimal places.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Register {
    pub name: &'static str,
    pub address: u16,
    pub decimals: u8,
    pub writable: bool,
}

const fn reg(name: &'static str, address: u16, decimals: u8, writable: bool) -> Register {
    Register {
        name,
        address,
        decimals,
        writable,
    }
}

/// Snapshot fields and log columns follow this order
pub const REGISTER_MAP: [Register; 12] = [
    // digital input 1
    reg(CHAMBER_ALARM_STATUS, 201, 0, false),
    reg(T, 100, 1, false),
    reg(T_SETPOINT, 300, 1, true),
    // alarm 1
    reg(T_ALARM_STATUS, 102, 0, false),
    reg(H, 104, 1, false),
    reg(H_SETPOINT, 319, 1, true),
    // alarm 2
    reg(H_ALARM_STATUS, 106, 0, false),
    reg(HEATING_POWER, 103, 0, false),
    reg(COOLING_POWER, 107, 0, false),
    reg(HUMID_POWER, 111, 0, false),
    reg(DEHUMID_POWER, 115, 0, false),
    // digital output 1, used for lights
    reg(TIME_SIGNAL, 2000, 0, true),
];

impl Register {
    pub fn lookup(name: &str) -> EResult<&'static Register> {
        REGISTER_MAP
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::invalid_operation(format!("unknown register: {}", name)))
    }
    #[inline]
    fn scale(&self) -> f64 {
        10f64.powi(i32::from(self.decimals))
    }
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(&self, raw: u16) -> f64 {
        f64::from(raw as i16) / self.scale()
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn encode(&self, value: f64) -> EResult<u16> {
        let scaled = (value * self.scale()).round();
        if !scaled.is_finite() || scaled < f64::from(i16::MIN) || scaled > f64::from(i16::MAX) {
            return Err(Error::invalid_operation(format!(
                "value {} is out of range for register {}",
                value, self.name
            )));
        }
        Ok(scaled as i16 as u16)
    }
    /// Formats a value with the register resolution
    pub fn format(&self, value: f64) -> String {
        format!("{:.*}", usize::from(self.decimals), value)
    }
}
