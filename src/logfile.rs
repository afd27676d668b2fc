use crate::alarm::Severity;
use crate::lock::FileLock;
use crate::EResult;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

pub const TAIL_CAPACITY: usize = 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Level {
    Msg(Severity),
    Stat,
    StatHeader,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Msg(severity) => write!(f, "{}", severity),
            Level::Stat => write!(f, "STAT"),
            Level::StatHeader => write!(f, "STAT_HEADER"),
        }
    }
}

impl From<Severity> for Level {
    fn from(severity: Severity) -> Self {
        Level::Msg(severity)
    }
}

impl Level {
    fn log_level(self) -> log::Level {
        match self {
            Level::Msg(severity) => severity.log_level(),
            Level::Stat | Level::StatHeader => log::Level::Info,
        }
    }
}

/// Rolling buffer of the most recent log lines
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for TailBuffer {
    fn default() -> Self {
        Self::new(TAIL_CAPACITY)
    }
}

impl TailBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.lines.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Append-only log file shared with other processes
///
/// Each record is `<epoch time>\t<LEVEL>\t<payload>`, the file is opened per record and written
/// under an exclusive flock.
pub struct LogFile {
    path: PathBuf,
    tail: Mutex<TailBuffer>,
}

impl LogFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            tail: <_>::default(),
        }
    }
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
    /// Removes the file if exists
    pub fn remove(&self) -> EResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
    pub fn write<L: Into<Level>>(&self, level: L, payload: &str) -> EResult<()> {
        self.write_at(crate::now(), level, payload)
    }
    /// The line goes to the tail buffer and the log facade even if the file write fails
    pub fn write_at<L: Into<Level>>(&self, time: f64, level: L, payload: &str) -> EResult<()> {
        let level = level.into();
        let line = format!("{:.2}\t{}\t{}", time, level, payload);
        log::log!(level.log_level(), "{}", line);
        self.tail.lock().push(line.clone());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let _lock = FileLock::exclusive(&file)?;
        writeln!(&file, "{}", line)?;
        Ok(())
    }
    pub fn tail(&self) -> TailBuffer {
        self.tail.lock().clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tail_capacity() {
        let mut tail = TailBuffer::new(3);
        assert!(tail.is_empty());
        for i in 0..5 {
            tail.push(i.to_string());
        }
        assert_eq!(tail.len(), 3);
        assert_eq!(tail.lines().collect::<Vec<_>>(), ["2", "3", "4"]);
        assert_eq!(TailBuffer::default().capacity, TAIL_CAPACITY);
    }

    #[test]
    fn test_write() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::new(dir.path().join("chamber.log"));
        log.write_at(1_700_000_000.123, Severity::Info, "Logger started")
            .unwrap();
        log.write_at(1_700_000_000.5, Level::StatHeader, "time\tT").unwrap();
        log.write_at(1_700_000_030.0, Level::Stat, "25.0").unwrap();
        let content = fs::read_to_string(log.path()).unwrap();
        assert_eq!(
            content,
            "1700000000.12\tINFO\tLogger started\n\
             1700000000.50\tSTAT_HEADER\ttime\tT\n\
             1700000030.00\tSTAT\t25.0\n"
        );
        assert_eq!(log.tail().len(), 3);
        log.remove().unwrap();
        assert!(!log.path().exists());
        // removing a missing file is fine
        log.remove().unwrap();
        // appends re-create the file
        log.write(Severity::Critical, "ALARM CHAMBER").unwrap();
        let content = fs::read_to_string(log.path()).unwrap();
        assert!(content.ends_with("\tCRITICAL\tALARM CHAMBER\n"));
    }

    #[test]
    fn test_write_failure_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = LogFile::new(dir.path().join("missing").join("chamber.log"));
        assert!(log.write_at(1.0, Severity::Notice, "cleared").is_err());
        assert_eq!(log.tail().lines().next(), Some("1.00\tNOTICE\tcleared"));
    }
}
