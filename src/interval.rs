use crate::tasks::{self, Clock, MIN_CYCLE_SLEEP};
use crate::{EResult, Error};
use log::warn;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Fixed-rate loop on the wall-clock grid `start + n * interval`
///
/// Slots which are already in the past when the loop ticks are skipped (with a warning), so an
/// overrun never produces a burst of iterations.
pub struct Loop<'a> {
    clock: &'a dyn Clock,
    start: f64,
    interval: f64,
    n: u64,
}

#[negative_impl::negative_impl]
impl<'a> !Send for Loop<'a> {}

impl<'a> Loop<'a> {
    pub fn prepare(clock: &'a dyn Clock, start: f64, interval: Duration) -> Self {
        Loop {
            clock,
            start,
            interval: interval.as_secs_f64().max(MIN_CYCLE_SLEEP),
            n: 0,
        }
    }
    #[allow(clippy::cast_precision_loss)]
    #[inline]
    fn slot(&self) -> f64 {
        self.start + self.n as f64 * self.interval
    }
    /// Epoch time of the slot the next tick waits for
    #[allow(clippy::cast_precision_loss)]
    pub fn next_slot(&self) -> f64 {
        self.start + (self.n + 1) as f64 * self.interval
    }
    /// Waits for the next slot, returns false if the clock is stopped
    ///
    /// An early wake (SIGALRM) returns immediately, the interrupted slot is not waited for
    /// again.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn tick(&mut self) -> bool {
        if self.clock.stopped() {
            return false;
        }
        self.n += 1;
        let now = self.clock.now();
        if self.slot() < now {
            let missed = ((now - self.slot()) / self.interval).floor() as u64 + 1;
            warn!(
                "{} loop timeout ({:.2}s), {} slot(s) skipped",
                tasks::thread_name(),
                self.interval,
                missed
            );
            self.n += missed;
        }
        self.clock.wait(Duration::from_secs_f64(
            (self.slot() - self.clock.now()).max(MIN_CYCLE_SLEEP),
        ));
        !self.clock.stopped()
    }
}

/// `30`, `30s`, `1.5s`, `500ms` or `250us`
pub fn parse_interval(s: &str) -> EResult<Duration> {
    let s = s.trim();
    let secs: f64 = if let Some(v) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(v.parse::<u64>()?));
    } else if let Some(v) = s.strip_suffix("us") {
        return Ok(Duration::from_micros(v.parse::<u64>()?));
    } else if let Some(v) = s.strip_suffix('s') {
        v.parse()?
    } else {
        s.parse()?
    };
    if secs.is_finite() && secs >= 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(Error::configuration(format!("invalid interval: {}", s)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntervalRepr {
    Secs(f64),
    Str(String),
}

#[inline]
pub(crate) fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match IntervalRepr::deserialize(deserializer)? {
        IntervalRepr::Secs(secs) => parse_interval(&secs.to_string()),
        IntervalRepr::Str(s) => parse_interval(&s),
    }
    .map_err(serde::de::Error::custom)
}
