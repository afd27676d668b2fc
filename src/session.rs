use crate::comm::{serial::SerialComm, Communicator};
use crate::modbus::{self, regs, Register, REGISTER_MAP};
use crate::{EResult, Error};
use indexmap::IndexMap;
use log::{debug, info};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

/// All readable registers captured by one poll
///
/// Field order is the order of [`REGISTER_MAP`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatSnapshot {
    time: f64,
    values: IndexMap<&'static str, f64>,
}

impl StatSnapshot {
    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }
    #[inline]
    pub fn values(&self) -> &IndexMap<&'static str, f64> {
        &self.values
    }
    /// NaN if the field is unknown
    pub fn get(&self, name: &str) -> f64 {
        self.values.get(name).copied().unwrap_or(f64::NAN)
    }
    pub fn chamber_alarm(&self) -> bool {
        self.get(regs::CHAMBER_ALARM_STATUS) != 0.0
    }
    pub fn t(&self) -> f64 {
        self.get(regs::T)
    }
    pub fn t_setpoint(&self) -> f64 {
        self.get(regs::T_SETPOINT)
    }
    pub fn h(&self) -> f64 {
        self.get(regs::H)
    }
    pub fn h_setpoint(&self) -> f64 {
        self.get(regs::H_SETPOINT)
    }
    pub fn time_signal(&self) -> f64 {
        self.get(regs::TIME_SIGNAL)
    }
    /// Column names of a STAT log record
    pub fn header() -> String {
        let mut s = "time".to_owned();
        for reg in &REGISTER_MAP {
            s.push('\t');
            s.push_str(reg.name);
        }
        s
    }
    /// Tab-separated values with the register resolution
    pub fn format_values(&self) -> String {
        let mut s = String::new();
        for (i, (reg, value)) in REGISTER_MAP.iter().zip(self.values.values()).enumerate() {
            if i > 0 {
                s.push('\t');
            }
            s.push_str(&reg.format(*value));
        }
        s
    }
}

/// Setpoint commands accepted by a chamber
pub trait Setter {
    fn device(&self) -> &str;
    fn set_t_setpoint(&self, value: f64) -> EResult<()>;
    fn set_h_setpoint(&self, value: f64) -> EResult<()>;
    fn set_time_signal(&self, value: f64) -> EResult<()>;
}

pub struct ChamberSession {
    comm: Communicator,
    unit: u8,
    stat: Mutex<Option<Arc<StatSnapshot>>>,
}

impl ChamberSession {
    /// Opens the serial port
    pub fn connect(device: &str, unit: u8, timeout: Duration) -> EResult<Self> {
        let comm = SerialComm::open(device, timeout)?;
        info!("connected to {}, unit {}", device, unit);
        Ok(Self::with_comm(Arc::new(comm), unit))
    }
    pub fn with_comm(comm: Communicator, unit: u8) -> Self {
        Self {
            comm,
            unit,
            stat: <_>::default(),
        }
    }
    #[inline]
    pub fn unit(&self) -> u8 {
        self.unit
    }
    fn read_register(&self, reg: &Register) -> EResult<f64> {
        let raw = modbus::read_holding(self.comm.as_ref(), self.unit, reg.address)?;
        Ok(reg.decode(raw))
    }
    pub fn read(&self, name: &str) -> EResult<f64> {
        self.read_register(Register::lookup(name)?)
    }
    pub fn write(&self, name: &str, value: f64) -> EResult<()> {
        let reg = Register::lookup(name)?;
        if !reg.writable {
            return Err(Error::invalid_operation(format!(
                "register {} is read-only",
                reg.name
            )));
        }
        let raw = reg.encode(value)?;
        debug!("{} set {}={}", self.device(), reg.name, reg.format(value));
        modbus::write_holding(self.comm.as_ref(), self.unit, reg.address, raw)
    }
    /// Reads all registers, the stored snapshot is replaced only if every read succeeds
    #[inline]
    pub fn update_stat(&self) -> EResult<Arc<StatSnapshot>> {
        self.update_stat_at(crate::now())
    }
    /// Same as [`ChamberSession::update_stat`], the snapshot is stamped with `time`
    pub fn update_stat_at(&self, time: f64) -> EResult<Arc<StatSnapshot>> {
        let mut values = IndexMap::with_capacity(REGISTER_MAP.len());
        for reg in &REGISTER_MAP {
            let value = self.read_register(reg).map_err(|e| {
                Error::communication(format!(
                    "poll aborted at {}: {}",
                    reg.name,
                    e.message()
                ))
            })?;
            values.insert(reg.name, value);
        }
        let stat = Arc::new(StatSnapshot { time, values });
        self.stat.lock().replace(stat.clone());
        Ok(stat)
    }
    /// The last successfully captured snapshot
    pub fn get_stat(&self) -> Option<Arc<StatSnapshot>> {
        self.stat.lock().clone()
    }
    pub fn chamber_alarm_status(&self) -> EResult<f64> {
        self.read(regs::CHAMBER_ALARM_STATUS)
    }
    pub fn t(&self) -> EResult<f64> {
        self.read(regs::T)
    }
    pub fn t_setpoint(&self) -> EResult<f64> {
        self.read(regs::T_SETPOINT)
    }
    pub fn h(&self) -> EResult<f64> {
        self.read(regs::H)
    }
    pub fn h_setpoint(&self) -> EResult<f64> {
        self.read(regs::H_SETPOINT)
    }
    pub fn time_signal(&self) -> EResult<f64> {
        self.read(regs::TIME_SIGNAL)
    }
    /// Human readable dump of the last snapshot, one field per line
    pub fn describe(&self) -> String {
        let mut s = String::new();
        if let Some(stat) = self.get_stat() {
            for (reg, value) in REGISTER_MAP.iter().zip(stat.values().values()) {
                let _ = writeln!(s, "{} {}", reg.name, reg.format(*value));
            }
        }
        s
    }
}

impl Setter for ChamberSession {
    fn device(&self) -> &str {
        self.comm.device()
    }
    fn set_t_setpoint(&self, value: f64) -> EResult<()> {
        self.write(regs::T_SETPOINT, value)
    }
    fn set_h_setpoint(&self, value: f64) -> EResult<()> {
        self.write(regs::H_SETPOINT, value)
    }
    fn set_time_signal(&self, value: f64) -> EResult<()> {
        self.write(regs::TIME_SIGNAL, value)
    }
}
