use chrono::{Local, TimeZone};
use log::debug;
use std::env;
use std::panic;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod alarm;
pub mod comm;
pub mod config;
pub mod error;
pub mod interval;
pub mod lock;
pub mod logfile;
pub mod mail;
pub mod modbus;
pub mod monitor;
pub mod profile;
pub mod session;
pub mod tasks;
pub mod track;

pub use error::{EResult, Error, ErrorKind};

pub mod prelude {
    pub use super::alarm::{DeviationAlarm, Severity};
    pub use super::session::{ChamberSession, Setter, StatSnapshot};
    pub use super::{EResult, Error, ErrorKind};
    pub use log::{debug, error, info, trace, warn};
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Current epoch time in seconds
#[inline]
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Local date-time with microseconds and the zone offset
#[allow(clippy::cast_possible_truncation)]
pub fn format_time(t: f64) -> String {
    Local
        .timestamp_micros((t * 1_000_000.0) as i64)
        .single()
        .map_or_else(
            || format!("{:.2}", t),
            |dt| dt.format("%Y-%m-%d %H:%M:%S%.6f %z").to_string(),
        )
}

fn level_filter(verbosity: i8) -> log::LevelFilter {
    match verbosity {
        i8::MIN..=-2 => log::LevelFilter::Off,
        -1 => log::LevelFilter::Error,
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Sets up the panic hook and the logger
///
/// The base level is WARN, each `verbosity` step moves it by one level. `VERBOSE=1` forces
/// trace, `SYSLOG=1` logs to the local syslog instead of stdout.
///
/// # Panics
///
/// Will panic if syslog is selected but can not be connected or a logger is already set
pub fn init_logging(name: &str, verbosity: i8) {
    panic::set_hook(Box::new(|s| {
        println!("PANIC: {}", s);
        std::process::exit(1);
    }));
    let verbose: bool = env::var("VERBOSE").ok().map_or(false, |v| v == "1");
    let syslog: bool = env::var("SYSLOG").ok().map_or(false, |v| v == "1");
    let filter = if verbose {
        log::LevelFilter::Trace
    } else {
        level_filter(verbosity)
    };
    if syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process: name.to_owned(),
            pid: std::process::id(),
        };
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
            syslog::unix(formatter).unwrap(),
        )))
        .unwrap();
        log::set_max_level(filter);
    } else {
        env_logger::Builder::new()
            .target(env_logger::Target::Stdout)
            .filter_level(filter)
            .init();
    }
    debug!("log initialization completed");
}
