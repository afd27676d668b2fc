//! YAML configuration of the logger, the profile runner and the sensor tracker
//!
//! Files are rendered with tera first, the process environment is available as `env`, e.g.
//! `device: "{{ env.CHAMBER_DEVICE }}"`. Command line options override file values.
use crate::alarm::Severity;
use crate::comm::serial::check_path;
use crate::interval::deserialize_interval;
use crate::mail::{DEFAULT_SENDMAIL, DEFAULT_SENDMAIL_TIMEOUT};
use crate::monitor::{ChannelConfig, DisablePolicy, MonitorConfig};
use crate::profile::TimeBase;
use crate::track::{LightCycle, DEFAULT_SENSOR_TIMEOUT};
use crate::{EResult, Error, DEFAULT_TIMEOUT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const LOGGER_DEVICE_PREFIX: &str = "/dev/ttyS";
pub const PROFILE_DEVICE_PREFIX: &str = "/dev/ttyUSB";
pub const DEFAULT_LOGFILE: &str = "chamber.log";
pub const DEFAULT_ALARM_EMAIL: &str = "root";
pub const DEFAULT_FREQ: Duration = Duration::from_secs(30);
pub const DEFAULT_TRACK_FREQ: Duration = Duration::from_secs(900);

/// Serial device path or a port number
#[derive(Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(untagged)]
pub enum DeviceRef {
    Number(u32),
    Path(String),
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Number(n) => write!(f, "{}", n),
            DeviceRef::Path(p) => write!(f, "{}", p),
        }
    }
}

impl From<&str> for DeviceRef {
    fn from(s: &str) -> Self {
        s.trim()
            .parse::<u32>()
            .map_or_else(|_| DeviceRef::Path(s.trim().to_owned()), DeviceRef::Number)
    }
}

impl DeviceRef {
    /// A port number N becomes `<prefix>N`, the result is checked for valid port settings
    pub fn expand(&self, prefix: &str) -> EResult<String> {
        let path = match self {
            DeviceRef::Number(n) => format!("{}{}", prefix, n),
            DeviceRef::Path(p) => p.clone(),
        };
        check_path(&path)?;
        Ok(path)
    }
}

/// Comma separated device list
pub fn parse_device_list(s: &str) -> Vec<DeviceRef> {
    s.split(',')
        .filter(|v| !v.trim().is_empty())
        .map(DeviceRef::from)
        .collect()
}

/// Tera context with the process environment as `env`
pub fn env_context() -> tera::Context {
    let vars: BTreeMap<String, String> = std::env::vars().collect();
    let mut ctx = tera::Context::new();
    ctx.insert("env", &vars);
    ctx
}

fn load<T: DeserializeOwned, P: AsRef<Path>>(path: P, context: &tera::Context) -> EResult<T> {
    let path = path.as_ref();
    let config_tpl = fs::read_to_string(path).map_err(|e| {
        Error::configuration(format!("unable to read {}: {}", path.display(), e))
    })?;
    let config: T =
        serde_yaml::from_str(&tera::Tera::default().render_str(&config_tpl, context)?)?;
    Ok(config)
}

#[inline]
fn default_unit() -> u8 {
    1
}

#[inline]
fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

#[inline]
fn default_freq() -> Duration {
    DEFAULT_FREQ
}

#[inline]
fn default_logger_prefix() -> String {
    LOGGER_DEVICE_PREFIX.to_owned()
}

#[inline]
fn default_profile_prefix() -> String {
    PROFILE_DEVICE_PREFIX.to_owned()
}

#[inline]
fn default_logfile() -> String {
    DEFAULT_LOGFILE.to_owned()
}

#[inline]
fn default_alarm_email() -> String {
    DEFAULT_ALARM_EMAIL.to_owned()
}

#[inline]
fn default_email_level() -> Severity {
    Severity::Critical
}

#[inline]
fn default_sendmail() -> String {
    DEFAULT_SENDMAIL.to_owned()
}

#[inline]
fn default_sendmail_timeout() -> Duration {
    DEFAULT_SENDMAIL_TIMEOUT
}

#[inline]
fn default_track_freq() -> Duration {
    DEFAULT_TRACK_FREQ
}

#[inline]
fn default_sensor_timeout() -> Duration {
    DEFAULT_SENSOR_TIMEOUT
}

#[inline]
fn default_light_on_hour() -> u32 {
    6
}

#[inline]
fn default_light_off_hour() -> u32 {
    18
}

#[inline]
fn default_true() -> bool {
    true
}

fn default_alarm_t() -> ChannelConfig {
    ChannelConfig {
        trigger: 1.0,
        clear: 1.0,
        disable_multiplier: 10.0,
        disable_constant: 10.0,
    }
}

fn default_alarm_h() -> ChannelConfig {
    ChannelConfig {
        trigger: 10.0,
        clear: 10.0,
        disable_multiplier: 10.0,
        disable_constant: 10.0,
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AlarmsConfig {
    #[serde(default = "default_alarm_t")]
    pub t: ChannelConfig,
    #[serde(default = "default_alarm_h")]
    pub h: ChannelConfig,
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            t: default_alarm_t(),
            h: default_alarm_h(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    #[serde(default)]
    pub device: Option<DeviceRef>,
    #[serde(default = "default_logger_prefix")]
    pub device_prefix: String,
    #[serde(default = "default_unit")]
    pub unit: u8,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_interval")]
    pub timeout: Duration,
    #[serde(default = "default_freq", deserialize_with = "deserialize_interval")]
    pub freq: Duration,
    #[serde(default = "default_logfile")]
    pub logfile: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_alarm_email")]
    pub alarm_email: String,
    #[serde(default = "default_email_level")]
    pub email_level: Severity,
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
    #[serde(
        default = "default_sendmail_timeout",
        deserialize_with = "deserialize_interval"
    )]
    pub sendmail_timeout: Duration,
    #[serde(default)]
    pub alarm: AlarmsConfig,
    #[serde(default)]
    pub disable_policy: DisablePolicy,
    #[serde(default = "default_true")]
    pub couple_humidity: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            device: None,
            device_prefix: default_logger_prefix(),
            unit: default_unit(),
            timeout: default_timeout(),
            freq: default_freq(),
            logfile: default_logfile(),
            overwrite: false,
            alarm_email: default_alarm_email(),
            email_level: default_email_level(),
            sendmail: default_sendmail(),
            sendmail_timeout: DEFAULT_SENDMAIL_TIMEOUT,
            alarm: AlarmsConfig::default(),
            disable_policy: DisablePolicy::default(),
            couple_humidity: true,
        }
    }
}

impl LoggerConfig {
    pub fn load<P: AsRef<Path>>(path: P, context: &tera::Context) -> EResult<Self> {
        load(path, context)
    }
    /// # Errors
    ///
    /// Fails if the device is not set or the port settings are invalid
    pub fn device_path(&self) -> EResult<String> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::configuration("device not specified"))?
            .expand(&self.device_prefix)
    }
    /// None if alarm emails are disabled
    pub fn alarm_email(&self) -> Option<&str> {
        let email = self.alarm_email.trim();
        if email.is_empty() || email.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(email)
        }
    }
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            freq: self.freq,
            t: self.alarm.t,
            h: self.alarm.h,
            disable_policy: self.disable_policy,
            couple_humidity: self.couple_humidity,
            email_level: self.email_level,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    #[serde(default)]
    pub devices: Vec<DeviceRef>,
    #[serde(default = "default_profile_prefix")]
    pub device_prefix: String,
    #[serde(default = "default_unit")]
    pub unit: u8,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_interval")]
    pub timeout: Duration,
    /// resume checkpoint
    #[serde(default)]
    pub logfile: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default, deserialize_with = "deserialize_interval")]
    pub repeat: Duration,
    #[serde(default)]
    pub clocktime: bool,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub test_only: bool,
    #[serde(default)]
    pub simulate: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            device_prefix: default_profile_prefix(),
            unit: default_unit(),
            timeout: default_timeout(),
            logfile: None,
            profile: None,
            repeat: Duration::ZERO,
            clocktime: false,
            restart: false,
            test_only: false,
            simulate: false,
        }
    }
}

impl ProfileConfig {
    pub fn load<P: AsRef<Path>>(path: P, context: &tera::Context) -> EResult<Self> {
        load(path, context)
    }
    pub fn device_paths(&self) -> EResult<Vec<String>> {
        if self.devices.is_empty() {
            return Err(Error::configuration("no devices specified"));
        }
        self.devices
            .iter()
            .map(|d| d.expand(&self.device_prefix))
            .collect()
    }
    pub fn logfile(&self) -> EResult<&str> {
        self.logfile
            .as_deref()
            .ok_or_else(|| Error::configuration("logfile not specified"))
    }
    pub fn profile(&self) -> EResult<&str> {
        self.profile
            .as_deref()
            .ok_or_else(|| Error::configuration("profile not specified"))
    }
    pub fn time_base(&self) -> TimeBase {
        if self.clocktime {
            TimeBase::ClockTime
        } else {
            TimeBase::Relative
        }
    }
}

/// Sensor tracking driver
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrackConfig {
    #[serde(default)]
    pub device: Option<DeviceRef>,
    #[serde(default = "default_profile_prefix")]
    pub device_prefix: String,
    #[serde(default = "default_unit")]
    pub unit: u8,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_interval")]
    pub timeout: Duration,
    /// prints `T RH [light]`
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(
        default = "default_sensor_timeout",
        deserialize_with = "deserialize_interval"
    )]
    pub cmd_timeout: Duration,
    #[serde(default = "default_track_freq", deserialize_with = "deserialize_interval")]
    pub freq: Duration,
    #[serde(default = "default_light_on_hour")]
    pub light_on_hour: u32,
    #[serde(default = "default_light_off_hour")]
    pub light_off_hour: u32,
    #[serde(default)]
    pub override_light: bool,
    #[serde(default)]
    pub test_only: bool,
    #[serde(default)]
    pub simulate: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            device: None,
            device_prefix: default_profile_prefix(),
            unit: default_unit(),
            timeout: default_timeout(),
            cmd: None,
            cmd_timeout: DEFAULT_SENSOR_TIMEOUT,
            freq: DEFAULT_TRACK_FREQ,
            light_on_hour: default_light_on_hour(),
            light_off_hour: default_light_off_hour(),
            override_light: false,
            test_only: false,
            simulate: false,
        }
    }
}

impl TrackConfig {
    pub fn load<P: AsRef<Path>>(path: P, context: &tera::Context) -> EResult<Self> {
        load(path, context)
    }
    pub fn device_path(&self) -> EResult<String> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::configuration("device not specified"))?
            .expand(&self.device_prefix)
    }
    pub fn cmd(&self) -> EResult<&str> {
        self.cmd
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::configuration("sensor command not specified"))
    }
    pub fn light_cycle(&self) -> EResult<LightCycle> {
        LightCycle::new(self.light_on_hour, self.light_off_hour)
    }
}
