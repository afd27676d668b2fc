//! Periodic tracking of an external T/RH sensor
//!
//! Every cycle the sensor command is run, its output (`T RH [light]`, whitespace separated) is
//! clamped to the chamber ranges and sent as setpoints. Without a light value the light follows a
//! fixed time-of-day cycle.
use crate::interval::Loop;
use crate::profile::scheduler::apply_step;
use crate::profile::ProfileStep;
use crate::session::Setter;
use crate::tasks::{self, Clock};
use crate::{EResult, Error};
use chrono::{Local, NaiveTime, TimeZone};
use log::{debug, error, info, warn};
use std::io::Read as _;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const T_RANGE: (f64, f64) = (-20.0, 99.0);
pub const RH_RANGE: (f64, f64) = (10.0, 95.0);
pub const DEFAULT_SENSOR_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Sensor {
    /// Raw sensor output
    fn read(&self) -> EResult<String>;
}

/// Runs a shell command, e.g. `ssh root@sensor-host /root/read_th.py`
pub struct CommandSensor {
    command: String,
    timeout: Duration,
}

impl CommandSensor {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            timeout: DEFAULT_SENSOR_TIMEOUT,
        }
    }
    #[inline]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Sensor for CommandSensor {
    fn read(&self) -> EResult<String> {
        debug!("running sensor command: {}", self.command);
        let mut child = Command::new("sh")
            .args(["-c", &self.command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io(format!("unable to launch the sensor command: {}", e)))?;
        let (tx, rx) = mpsc::channel();
        if let Some(mut stdout) = child.stdout.take() {
            // descendants of the shell may keep the pipe open after it is killed
            thread::Builder::new()
                .name("Ssensor".to_owned())
                .spawn(move || {
                    let mut output = String::new();
                    let _ = tx.send(stdout.read_to_string(&mut output).map(|_| output));
                })?;
        }
        let status = tasks::wait_child(&mut child, self.timeout)?.ok_or_else(|| {
            Error::io(format!(
                "sensor command timed out after {:?}",
                self.timeout
            ))
        })?;
        if !status.success() {
            return Err(Error::io(format!("sensor command exited with {}", status)));
        }
        rx.recv_timeout(Duration::from_secs(1))
            .map_err(|_| Error::io("no output from the sensor command"))?
            .map_err(Into::into)
    }
}

/// Sensor output
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Reading {
    pub t: f64,
    pub rh: f64,
    pub light: Option<f64>,
}

impl Reading {
    pub fn parse(output: &str) -> EResult<Self> {
        let invalid = || Error::communication(format!("invalid sensor output: '{}'", output.trim()));
        let values = output
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| invalid())?;
        match values[..] {
            [t, rh] => Ok(Self { t, rh, light: None }),
            [t, rh, light, ..] => Ok(Self {
                t,
                rh,
                light: Some(light),
            }),
            _ => Err(invalid()),
        }
    }
}

/// Lights are on strictly between `on` and `off` local time, `on` later than `off` is an
/// overnight cycle
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LightCycle {
    on: NaiveTime,
    off: NaiveTime,
}

impl Default for LightCycle {
    fn default() -> Self {
        Self {
            on: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or_default(),
            off: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

impl LightCycle {
    pub fn new(on_hour: u32, off_hour: u32) -> EResult<Self> {
        let hour = |h| {
            NaiveTime::from_hms_opt(h, 0, 0)
                .ok_or_else(|| Error::configuration(format!("invalid light cycle hour: {}", h)))
        };
        Ok(Self {
            on: hour(on_hour)?,
            off: hour(off_hour)?,
        })
    }
    #[allow(clippy::cast_possible_truncation)]
    pub fn light_at(&self, time: f64) -> f64 {
        let Some(dt) = Local.timestamp_micros((time * 1_000_000.0) as i64).single() else {
            return 0.0;
        };
        let t = dt.time();
        let on = if self.on <= self.off {
            t > self.on && t < self.off
        } else {
            t > self.on || t < self.off
        };
        if on {
            1.0
        } else {
            0.0
        }
    }
}

fn clamp(name: &str, value: f64, (min, max): (f64, f64)) -> f64 {
    if value < min {
        warn!("requested {} value {} too low, set to {}", name, value, min);
        min
    } else if value > max {
        warn!("requested {} value {} too high, set to {}", name, value, max);
        max
    } else {
        value
    }
}

pub struct Tracker<'a> {
    setters: Vec<&'a dyn Setter>,
    sensor: &'a dyn Sensor,
    clock: &'a dyn Clock,
    light_cycle: LightCycle,
    override_light: bool,
    test_only: bool,
}

impl<'a> Tracker<'a> {
    pub fn new(setters: Vec<&'a dyn Setter>, sensor: &'a dyn Sensor, clock: &'a dyn Clock) -> Self {
        Self {
            setters,
            sensor,
            clock,
            light_cycle: LightCycle::default(),
            override_light: false,
            test_only: false,
        }
    }
    pub fn light_cycle(mut self, light_cycle: LightCycle) -> Self {
        self.light_cycle = light_cycle;
        self
    }
    /// Follow the light cycle even if the sensor reports a light value
    pub fn override_light(mut self, override_light: bool) -> Self {
        self.override_light = override_light;
        self
    }
    pub fn test_only(mut self, test_only: bool) -> Self {
        self.test_only = test_only;
        self
    }
    /// Reads the sensor once and sends the targets to the chambers
    pub fn step(&self) -> EResult<ProfileStep> {
        let output = self.sensor.read()?;
        info!("read from sensor: '{}'", output.trim());
        let reading = Reading::parse(&output)?;
        let now = self.clock.now();
        let light = match reading.light {
            Some(light) if !self.override_light => light,
            _ => self.light_cycle.light_at(now),
        };
        let step = ProfileStep::new(
            now,
            Some(clamp("T", reading.t, T_RANGE)),
            Some(clamp("RH", reading.rh, RH_RANGE)),
            Some(light),
        );
        apply_step(&self.setters, &step, self.test_only);
        Ok(step)
    }
    /// Steps on the `freq` grid until the clock is stopped, failed readings are retried on the
    /// next slot
    pub fn run(&self, freq: Duration) {
        let mut cycle = Loop::prepare(self.clock, self.clock.now(), freq);
        loop {
            if let Err(e) = self.step() {
                error!("CRITICAL: tracking step failed: {}", e);
            }
            debug!(
                "next step at {}",
                crate::format_time(cycle.next_slot())
            );
            if !cycle.tick() {
                break;
            }
        }
        info!("tracking stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::sim::SimComm;
    use crate::modbus::regs;
    use crate::session::ChamberSession;
    use crate::tasks::manual::ManualClock;
    use crate::ErrorKind;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct Replies {
        replies: Mutex<VecDeque<EResult<String>>>,
    }

    impl Replies {
        fn new(replies: Vec<EResult<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
            }
        }
    }

    impl Sensor for Replies {
        fn read(&self) -> EResult<String> {
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(Error::io("sensor exhausted")))
        }
    }

    fn local(h: u32, m: u32) -> f64 {
        Local
            .with_ymd_and_hms(2024, 3, 1, h, m, 0)
            .single()
            .unwrap()
            .timestamp() as f64
    }

    #[test]
    fn test_parse_reading() {
        assert_eq!(
            Reading::parse("21.26 55.04\n").unwrap(),
            Reading {
                t: 21.26,
                rh: 55.04,
                light: None
            }
        );
        assert_eq!(Reading::parse("20\t50 0.5").unwrap().light, Some(0.5));
        for invalid in ["", "20", "x 50", "20 50%"] {
            assert_eq!(
                Reading::parse(invalid).unwrap_err().kind(),
                ErrorKind::Communication
            );
        }
    }

    #[test]
    fn test_light_cycle() {
        let cycle = LightCycle::default();
        assert_eq!(cycle.light_at(local(5, 59)), 0.0);
        assert_eq!(cycle.light_at(local(6, 0)), 0.0);
        assert_eq!(cycle.light_at(local(6, 1)), 1.0);
        assert_eq!(cycle.light_at(local(17, 59)), 1.0);
        assert_eq!(cycle.light_at(local(18, 0)), 0.0);
        let night = LightCycle::new(20, 4).unwrap();
        assert_eq!(night.light_at(local(23, 0)), 1.0);
        assert_eq!(night.light_at(local(3, 0)), 1.0);
        assert_eq!(night.light_at(local(12, 0)), 0.0);
        assert_eq!(
            LightCycle::new(6, 24).unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_step() {
        let sim = Arc::new(SimComm::at_rest("/dev/ttyUSB0", 1));
        let session = ChamberSession::with_comm(sim.clone(), 1);
        let clock = ManualClock::new(local(12, 0));
        let sensor = Replies::new(vec![
            Ok("21.26 55.04\n".to_owned()),
            Ok("-30 99.5 0.5".to_owned()),
        ]);
        let tracker = Tracker::new(vec![&session], &sensor, &clock);
        let step = tracker.step().unwrap();
        assert_eq!((step.t, step.rh, step.light), (Some(21.3), Some(55.0), Some(1.0)));
        assert_eq!(sim.value(regs::T_SETPOINT), 21.3);
        assert_eq!(sim.value(regs::H_SETPOINT), 55.0);
        assert_eq!(sim.value(regs::TIME_SIGNAL), 1.0);
        // out of range values are clamped, the sensor light is used
        let step = tracker.step().unwrap();
        assert_eq!((step.t, step.rh, step.light), (Some(-20.0), Some(95.0), Some(0.5)));
        assert_eq!(sim.value(regs::T_SETPOINT), -20.0);
        assert_eq!(sim.value(regs::H_SETPOINT), 95.0);
    }

    #[test]
    fn test_override_light_and_test_only() {
        let sim = Arc::new(SimComm::at_rest("/dev/ttyUSB0", 1));
        let session = ChamberSession::with_comm(sim.clone(), 1);
        let clock = ManualClock::new(local(19, 0));
        let sensor = Replies::new(vec![Ok("22 60 1".to_owned()), Ok("22 60 1".to_owned())]);
        let tracker = Tracker::new(vec![&session], &sensor, &clock).override_light(true);
        assert_eq!(tracker.step().unwrap().light, Some(0.0));
        assert_eq!(sim.value(regs::T_SETPOINT), 22.0);
        let tracker = Tracker::new(vec![&session], &sensor, &clock).test_only(true);
        let before = sim.transactions();
        assert_eq!(tracker.step().unwrap().light, Some(1.0));
        assert_eq!(sim.transactions(), before);
    }

    #[test]
    fn test_run_survives_failures() {
        let sim = Arc::new(SimComm::at_rest("/dev/ttyUSB0", 1));
        let session = ChamberSession::with_comm(sim.clone(), 1);
        let start = local(12, 0);
        let clock = ManualClock::new(start).stop_at(start + 2000.0);
        let sensor = Replies::new(vec![
            Ok("20 50".to_owned()),
            Err(Error::io("sensor command exited with 255")),
            Ok("23 65".to_owned()),
        ]);
        let tracker = Tracker::new(vec![&session], &sensor, &clock);
        tracker.run(Duration::from_secs(900));
        assert_eq!(clock.waits(), [start + 900.0, start + 1800.0, start + 2700.0]);
        assert_eq!(sim.value(regs::T_SETPOINT), 23.0);
        assert_eq!(sim.value(regs::H_SETPOINT), 65.0);
    }

    #[test]
    fn test_command_sensor() {
        assert_eq!(CommandSensor::new("echo 20.5 60").read().unwrap(), "20.5 60\n");
        assert_eq!(
            CommandSensor::new("exit 3").read().unwrap_err().kind(),
            ErrorKind::Io
        );
        let err = CommandSensor::new("sleep 10")
            .timeout(Duration::from_millis(300))
            .read()
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }
}
