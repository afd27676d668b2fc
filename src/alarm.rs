use crate::{EResult, Error};
use bmart_derive::EnumStr;
use serde::Deserialize;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, EnumStr)]
#[serde(rename_all = "lowercase")]
#[enumstr(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Notice,
    Warning,
    Critical,
}

impl Severity {
    pub fn log_level(self) -> log::Level {
        match self {
            Severity::Debug => log::Level::Debug,
            Severity::Info | Severity::Notice => log::Level::Info,
            Severity::Warning => log::Level::Warn,
            Severity::Critical => log::Level::Error,
        }
    }
}

pub type Message = (Severity, String);

#[derive(Debug, Copy, Clone, Eq, PartialEq, EnumStr)]
#[enumstr(rename_all = "UPPERCASE")]
pub enum TriggerType {
    Low,
    High,
}

fn same_setpoint(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

fn fmt_setpoint(setpoint: Option<f64>) -> String {
    setpoint.map_or_else(|| "none".to_owned(), |v| v.to_string())
}

/// Software alarm on the deviation of a measured value from its setpoint
///
/// The alarm triggers when the value leaves the trigger band `(sp - low_trigger, sp +
/// high_trigger)` and clears only when it is back strictly inside the (narrower or equal) clear
/// band. After a setpoint change the owner usually disables it for a while with
/// [`DeviationAlarm::disable_until_time`], a disabled alarm never triggers and drops an existing
/// trigger.
#[derive(Debug, Clone)]
pub struct DeviationAlarm {
    name: String,
    setpoint: Option<f64>,
    low_trigger_thresh: f64,
    low_clear_thresh: f64,
    high_trigger_thresh: f64,
    high_clear_thresh: f64,
    trigger_type: Option<TriggerType>,
    first_trigger_time: Option<f64>,
    last_trigger_time: Option<f64>,
    reactivate_time: Option<f64>,
    severity: Severity,
}

impl DeviationAlarm {
    /// Omitted thresholds: `low_clear` = `low_trigger`, `high_trigger` = `low_trigger`,
    /// `high_clear` = `low_clear` if given, otherwise `high_trigger`
    pub fn new(
        name: &str,
        low_trigger: f64,
        low_clear: Option<f64>,
        high_trigger: Option<f64>,
        high_clear: Option<f64>,
    ) -> EResult<Self> {
        let low_clear_thresh = low_clear.unwrap_or(low_trigger);
        let high_trigger_thresh = high_trigger.unwrap_or(low_trigger);
        let high_clear_thresh = high_clear.or(low_clear).unwrap_or(high_trigger_thresh);
        for v in [
            low_trigger,
            low_clear_thresh,
            high_trigger_thresh,
            high_clear_thresh,
        ] {
            if !v.is_finite() {
                return Err(Error::configuration(format!(
                    "alarm {}: invalid threshold {}",
                    name, v
                )));
            }
        }
        if low_clear_thresh > low_trigger {
            return Err(Error::configuration(format!(
                "alarm {}: low clear threshold {} is above the trigger threshold {}",
                name, low_clear_thresh, low_trigger
            )));
        }
        if high_clear_thresh > high_trigger_thresh {
            return Err(Error::configuration(format!(
                "alarm {}: high clear threshold {} is above the trigger threshold {}",
                name, high_clear_thresh, high_trigger_thresh
            )));
        }
        Ok(Self {
            name: name.to_owned(),
            setpoint: None,
            low_trigger_thresh: low_trigger,
            low_clear_thresh,
            high_trigger_thresh,
            high_clear_thresh,
            trigger_type: None,
            first_trigger_time: None,
            last_trigger_time: None,
            reactivate_time: None,
            severity: Severity::Info,
        })
    }
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Sets the setpoint without reporting a change
    pub fn init_setpoint(&mut self, setpoint: f64) {
        self.setpoint = Some(setpoint);
    }
    #[inline]
    pub fn setpoint(&self) -> Option<f64> {
        self.setpoint
    }
    #[inline]
    pub fn thresholds(&self) -> (f64, f64, f64, f64) {
        (
            self.low_trigger_thresh,
            self.low_clear_thresh,
            self.high_trigger_thresh,
            self.high_clear_thresh,
        )
    }
    #[inline]
    pub fn trigger_type(&self) -> Option<TriggerType> {
        self.trigger_type
    }
    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.first_trigger_time.is_some()
    }
    #[inline]
    pub fn first_trigger_time(&self) -> Option<f64> {
        self.first_trigger_time
    }
    #[inline]
    pub fn last_trigger_time(&self) -> Option<f64> {
        self.last_trigger_time
    }
    #[inline]
    pub fn reactivate_time(&self) -> Option<f64> {
        self.reactivate_time
    }
    #[inline]
    pub fn severity(&self) -> Severity {
        self.severity
    }
    /// The window is never shortened unless `override_window` is set
    pub fn disable_until_time(&mut self, reactivate_time: f64, override_window: bool) {
        if override_window
            || self
                .reactivate_time
                .map_or(true, |current| current < reactivate_time)
        {
            self.reactivate_time = Some(reactivate_time);
        }
    }
    pub fn reenable(&mut self) {
        self.reactivate_time = None;
    }
    fn reset_trigger(&mut self) {
        self.trigger_type = None;
        self.first_trigger_time = None;
        self.last_trigger_time = None;
    }
    fn trigger(&mut self, now: f64, trigger_type: TriggerType, msgs: &mut Vec<Message>) {
        if let Some(current) = self.trigger_type.filter(|_| self.is_triggered()) {
            self.severity = Severity::Warning;
            if current != trigger_type {
                msgs.push((
                    Severity::Warning,
                    format!(
                        "{} alarm changed from {} to {}, the value jumped over the setpoint band",
                        self.name, current, trigger_type
                    ),
                ));
                self.trigger_type = Some(trigger_type);
            }
            self.last_trigger_time = Some(now);
        } else {
            self.severity = Severity::Critical;
            self.trigger_type = Some(trigger_type);
            self.first_trigger_time = Some(now);
            self.last_trigger_time = Some(now);
        }
    }
    pub fn update(&mut self, setpoint: f64, value: f64) -> Vec<Message> {
        self.update_at(crate::now(), setpoint, value)
    }
    pub fn update_at(&mut self, now: f64, setpoint: f64, value: f64) -> Vec<Message> {
        let mut msgs = Vec::new();
        if !self
            .setpoint
            .map_or(false, |current| same_setpoint(current, setpoint))
        {
            msgs.push((
                Severity::Info,
                format!(
                    "{} setpoint change from {} to {}",
                    self.name,
                    fmt_setpoint(self.setpoint),
                    setpoint
                ),
            ));
            self.setpoint = Some(setpoint);
        }
        if let Some(reactivate_time) = self.reactivate_time.filter(|t| now < *t) {
            self.reset_trigger();
            msgs.push((
                Severity::Info,
                format!(
                    "ALARM {} disabled until {:.2} ({:.2} more sec)",
                    self.name,
                    reactivate_time,
                    reactivate_time - now
                ),
            ));
            return msgs;
        }
        if value < setpoint - self.low_trigger_thresh {
            self.trigger(now, TriggerType::Low, &mut msgs);
        }
        if value > setpoint + self.high_trigger_thresh {
            self.trigger(now, TriggerType::High, &mut msgs);
        }
        if let (Some(first), Some(trigger_type)) = (self.first_trigger_time, self.trigger_type) {
            if value > setpoint - self.low_clear_thresh && value < setpoint + self.high_clear_thresh
            {
                self.severity = Severity::Info;
                msgs.push((
                    Severity::Notice,
                    format!(
                        "ALARM {} {} CLEARED; first_trigger_time:{:.2}, duration:{:.2} sec",
                        self.name,
                        trigger_type,
                        first,
                        now - first
                    ),
                ));
                self.reset_trigger();
            }
        }
        if let (Some(first), Some(last), Some(trigger_type)) = (
            self.first_trigger_time,
            self.last_trigger_time,
            self.trigger_type,
        ) {
            msgs.push((
                self.severity,
                format!(
                    "ALARM {} {} value={} SP={} time:{:.2} for {:.2}s; first trigger {:.2}s ago",
                    self.name,
                    trigger_type,
                    value,
                    setpoint,
                    first,
                    last - first,
                    now - first
                ),
            ));
        }
        msgs
    }
}
