//! Setpoint profiles: timed rows of temperature, humidity and light targets
//!
//! A profile is CSV text with a header row naming `time` and any of `T`, `RH` and `light`:
//!
//! ```text
//! time, T, RH, light
//! 0, 20, 50, 1
//! 3600, 25, , 0
//! ```
//!
//! Time cells are offsets in seconds, `YYYY-MM-DD HH:MM[:SS]` date-times or `HH:MM[:SS]` times of
//! day, see [`TimeBase`] on how they are turned into offsets from the run start.
use crate::{EResult, Error};
use chrono::{Local, NaiveDateTime, NaiveTime, TimeZone};
use log::debug;
use std::fmt;
use std::fs;

pub mod checkpoint;
pub mod runner;
pub mod scheduler;

pub use checkpoint::Checkpoint;
pub use runner::RunOptions;
pub use scheduler::ProfileScheduler;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%H:%M:%S%.f"];

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TimeSpec {
    Seconds(f64),
    DateTime(NaiveDateTime),
    TimeOfDay(NaiveTime),
}

impl TimeSpec {
    pub fn parse(s: &str) -> EResult<Self> {
        if let Ok(secs) = s.parse::<f64>() {
            if secs.is_finite() {
                return Ok(TimeSpec::Seconds(secs));
            }
        }
        for fmt in DATETIME_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(TimeSpec::DateTime(dt));
            }
        }
        for fmt in TIME_FORMATS {
            if let Ok(t) = NaiveTime::parse_from_str(s, fmt) {
                return Ok(TimeSpec::TimeOfDay(t));
            }
        }
        Err(Error::configuration(format!("invalid profile time: {}", s)))
    }
}

/// How profile times are turned into offsets from the run start
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum TimeBase {
    /// Numbers are offsets, date-times and times of day are taken relative to the first row
    #[default]
    Relative,
    /// Date-times are absolute local times, times of day are on the local date of the run start,
    /// numbers are epoch seconds
    ClockTime,
}

/// One profile row, `time` is seconds from the run start
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ProfileStep {
    pub time: f64,
    pub t: Option<f64>,
    pub rh: Option<f64>,
    pub light: Option<f64>,
}

fn round1(value: Option<f64>) -> Option<f64> {
    value
        .filter(|v| !v.is_nan())
        .map(|v| (v * 10.0).round() / 10.0)
}

impl ProfileStep {
    pub fn new(time: f64, t: Option<f64>, rh: Option<f64>, light: Option<f64>) -> Self {
        Self {
            time,
            t: round1(t),
            rh: round1(rh),
            light: round1(light),
        }
    }
    #[inline]
    pub fn at(mut self, time: f64) -> Self {
        self.time = time;
        self
    }
}

fn fmt_target(f: &mut fmt::Formatter<'_>, name: &str, value: Option<f64>) -> fmt::Result {
    if let Some(v) = value {
        write!(f, "{}={:.1}", name, v)
    } else {
        write!(f, "{}=-", name)
    }
}

impl fmt::Display for ProfileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_target(f, "T", self.t)?;
        write!(f, ", ")?;
        fmt_target(f, "RH", self.rh)?;
        write!(f, ", ")?;
        fmt_target(f, "light", self.light)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Row {
    time: TimeSpec,
    t: Option<f64>,
    rh: Option<f64>,
    light: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    rows: Vec<Row>,
}

fn parse_cell(cell: Option<&str>, column: &str, line: usize) -> EResult<Option<f64>> {
    let Some(cell) = cell.map(str::trim) else {
        return Ok(None);
    };
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    cell.parse::<f64>().map(Some).map_err(|e| {
        Error::configuration(format!(
            "profile line {}, column {}: {} ({})",
            line, column, e, cell
        ))
    })
}

impl Profile {
    /// A source starting with a newline is inline CSV, otherwise a file name
    pub fn load(source: &str) -> EResult<Self> {
        if source.starts_with('\n') {
            Self::parse(source)
        } else {
            debug!("reading profile from {}", source);
            let text = fs::read_to_string(source).map_err(|e| {
                Error::configuration(format!("unable to read profile {}: {}", source, e))
            })?;
            Self::parse(&text)
        }
    }
    pub fn parse(text: &str) -> EResult<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(n, l)| (n + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'));
        let (_, header) = lines
            .next()
            .ok_or_else(|| Error::configuration("profile is empty"))?;
        let columns: Vec<&str> = header.split(',').map(str::trim).collect();
        let position = |name: &str| columns.iter().position(|c| *c == name);
        let time_col = position("time")
            .ok_or_else(|| Error::configuration("profile has no time column"))?;
        let t_col = position("T");
        let rh_col = position("RH");
        let light_col = position("light");
        for c in &columns {
            if !["time", "T", "RH", "light"].contains(c) {
                debug!("profile column {} ignored", c);
            }
        }
        let mut rows = Vec::new();
        for (n, line) in lines {
            let cells: Vec<&str> = line.split(',').collect();
            let cell = |col: Option<usize>| col.and_then(|c| cells.get(c).copied());
            let time = cell(Some(time_col))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::configuration(format!("profile line {}: no time", n)))?;
            rows.push(Row {
                time: TimeSpec::parse(time)?,
                t: parse_cell(cell(t_col), "T", n)?,
                rh: parse_cell(cell(rh_col), "RH", n)?,
                light: parse_cell(cell(light_col), "light", n)?,
            });
        }
        if rows.is_empty() {
            return Err(Error::configuration("profile has no steps"));
        }
        Ok(Self { rows })
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    /// Steps with offsets from `run_start_time`, sorted by time (rows with equal times keep their
    /// order)
    pub fn resolve(&self, base: TimeBase, run_start_time: f64) -> EResult<Vec<ProfileStep>> {
        let mut steps = Vec::with_capacity(self.rows.len());
        let first = self.rows[0].time;
        for row in &self.rows {
            let time = match base {
                TimeBase::Relative => relative_offset(first, row.time)?,
                TimeBase::ClockTime => clock_offset(row.time, run_start_time)?,
            };
            steps.push(ProfileStep::new(time, row.t, row.rh, row.light));
        }
        steps.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(steps)
    }
}

fn relative_offset(first: TimeSpec, time: TimeSpec) -> EResult<f64> {
    match (first, time) {
        (_, TimeSpec::Seconds(secs)) => Ok(secs),
        (TimeSpec::DateTime(first), TimeSpec::DateTime(dt)) => Ok(seconds(dt - first)),
        (TimeSpec::TimeOfDay(first), TimeSpec::TimeOfDay(t)) => Ok(seconds(t - first)),
        (first, time) => Err(Error::configuration(format!(
            "profile time {:?} can not be related to the first row time {:?}",
            time, first
        ))),
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds(d: chrono::Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}

fn local_timestamp(dt: NaiveDateTime) -> EResult<f64> {
    let local = Local
        .from_local_datetime(&dt)
        .earliest()
        .ok_or_else(|| Error::configuration(format!("no such local time: {}", dt)))?;
    #[allow(clippy::cast_precision_loss)]
    Ok(local.timestamp_millis() as f64 / 1000.0)
}

fn clock_offset(time: TimeSpec, run_start_time: f64) -> EResult<f64> {
    let absolute = match time {
        TimeSpec::Seconds(secs) => secs,
        TimeSpec::DateTime(dt) => local_timestamp(dt)?,
        TimeSpec::TimeOfDay(t) => {
            #[allow(clippy::cast_possible_truncation)]
            let start = Local
                .timestamp_millis_opt((run_start_time * 1000.0) as i64)
                .single()
                .ok_or_else(|| {
                    Error::configuration(format!("invalid run start time: {}", run_start_time))
                })?;
            local_timestamp(start.date_naive().and_time(t))?
        }
    };
    Ok(absolute - run_start_time)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse() {
        let profile = Profile::parse(
            "# night and day\n\
             time, T, RH, light\n\
             \n\
             0, 20, 50, 1\n\
             3600, 25.04,,0\n\
             7200, nan, 60, \n",
        )
        .unwrap();
        assert_eq!(profile.len(), 3);
        let steps = profile.resolve(TimeBase::Relative, 1000.0).unwrap();
        assert_eq!(
            steps,
            [
                ProfileStep::new(0.0, Some(20.0), Some(50.0), Some(1.0)),
                ProfileStep::new(3600.0, Some(25.0), None, Some(0.0)),
                ProfileStep::new(7200.0, None, Some(60.0), None),
            ]
        );
        assert_eq!(steps[1].to_string(), "T=25.0, RH=-, light=0.0");
    }

    #[test]
    fn test_partial_columns() {
        let profile = Profile::parse("\nlight,time\n1,0\n0,43200\n").unwrap();
        let steps = profile.resolve(TimeBase::Relative, 0.0).unwrap();
        assert_eq!(steps[1], ProfileStep::new(43200.0, None, None, Some(0.0)));
        assert_eq!(steps[0].t, None);
    }

    #[test]
    fn test_invalid() {
        for text in [
            "",
            "# only a comment\n",
            "T,RH\n20,50\n",
            "time,T\n",
            "time,T\nyesterday,20\n",
            "time,T\n0,warm\n",
        ] {
            assert_eq!(
                Profile::parse(text).unwrap_err().kind(),
                ErrorKind::Configuration,
                "{:?}",
                text
            );
        }
    }

    #[test]
    fn test_relative_datetimes() {
        let profile = Profile::parse(
            "time,T\n2024-03-01 08:00,20\n2024-03-01T09:30:15,25\n2024-03-02 08:00:00,20\n",
        )
        .unwrap();
        let steps = profile.resolve(TimeBase::Relative, 1e9).unwrap();
        let times: Vec<f64> = steps.iter().map(|s| s.time).collect();
        assert_eq!(times, [0.0, 5415.0, 86400.0]);
        let profile = Profile::parse("time,light\n06:00,1\n18:00,0\n").unwrap();
        let steps = profile.resolve(TimeBase::Relative, 1e9).unwrap();
        assert_eq!(steps[1].time, 43200.0);
        let profile = Profile::parse("time,light\n06:00,1\n2024-03-01 18:00,0\n").unwrap();
        assert!(profile.resolve(TimeBase::Relative, 0.0).is_err());
    }

    #[test]
    fn test_clocktime() {
        let run_start = Local
            .with_ymd_and_hms(2024, 3, 1, 10, 0, 0)
            .single()
            .unwrap()
            .timestamp() as f64;
        let profile =
            Profile::parse("time,T\n2024-03-01 08:00,20\n12:30,25\n2024-03-01 11:00,22\n")
                .unwrap();
        let steps = profile.resolve(TimeBase::ClockTime, run_start).unwrap();
        let times: Vec<f64> = steps.iter().map(|s| s.time).collect();
        assert_eq!(times, [-7200.0, 3600.0, 9000.0]);
        assert_eq!(steps[1].t, Some(22.0));
        let profile = Profile::parse(&format!("time,T\n{},20\n", run_start + 60.0)).unwrap();
        let steps = profile.resolve(TimeBase::ClockTime, run_start).unwrap();
        assert_eq!(steps[0].time, 60.0);
    }

    #[test]
    fn test_sorting_keeps_row_order() {
        let profile = Profile::parse("time,T\n60,25\n0,20\n60,26\n").unwrap();
        let steps = profile.resolve(TimeBase::Relative, 0.0).unwrap();
        let ts: Vec<Option<f64>> = steps.iter().map(|s| s.t).collect();
        assert_eq!(ts, [Some(20.0), Some(25.0), Some(26.0)]);
    }

    #[test]
    fn test_load() {
        let profile = Profile::load("\ntime,T\n0,20\n").unwrap();
        assert_eq!(profile.len(), 1);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.csv");
        fs::write(&path, "time,RH\n0,40\n").unwrap();
        let profile = Profile::load(path.to_str().unwrap()).unwrap();
        let steps = profile.resolve(TimeBase::Relative, 0.0).unwrap();
        assert_eq!(steps[0].rh, Some(40.0));
        assert_eq!(
            Profile::load("/nonexistent/profile.csv").unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }
}
