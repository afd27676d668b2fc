use crate::{EResult, Error};
use log::warn;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Resume checkpoint of a profile run, the first line of the file is the run start time
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    run_start_time: f64,
    resumed: bool,
}

impl Checkpoint {
    /// Resumes the run recorded in the file or starts a new one at `now`
    ///
    /// With `restart` an existing file is ignored. Nothing is written until
    /// [`Checkpoint::save`] is called, which replaces the old run.
    pub fn open<P: AsRef<Path>>(path: P, restart: bool, now: f64) -> EResult<Self> {
        let path = path.as_ref();
        let content = if restart {
            if path.exists() {
                warn!("old checkpoint {} is discarded", path.display());
            }
            Err(std::io::Error::from(ErrorKind::NotFound))
        } else {
            fs::read_to_string(path)
        };
        match content {
            Ok(content) => {
                let line = content.lines().next().unwrap_or_default().trim();
                let run_start_time: f64 = line.parse().map_err(|_| {
                    Error::io(format!(
                        "invalid checkpoint {}: {:?} is not a start time",
                        path.display(),
                        line
                    ))
                })?;
                if !run_start_time.is_finite() {
                    return Err(Error::io(format!(
                        "invalid checkpoint {}: {}",
                        path.display(),
                        line
                    )));
                }
                Ok(Self {
                    path: path.to_owned(),
                    run_start_time,
                    resumed: true,
                })
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self {
                path: path.to_owned(),
                run_start_time: now,
                resumed: false,
            }),
            Err(e) => Err(Error::io(format!(
                "unable to read checkpoint {}: {}",
                path.display(),
                e
            ))),
        }
    }
    /// Persists the start time of a new run, a resumed run is left as is
    pub fn save(&self) -> EResult<()> {
        if self.resumed {
            return Ok(());
        }
        fs::write(&self.path, format!("{}\n", self.run_start_time)).map_err(|e| {
            Error::io(format!(
                "unable to write checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })
    }
    #[inline]
    pub fn run_start_time(&self) -> f64 {
        self.run_start_time
    }
    /// True if an earlier run is continued
    #[inline]
    pub fn resumed(&self) -> bool {
        self.resumed
    }
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_new_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let cp = Checkpoint::open(&path, false, 1_700_000_000.25).unwrap();
        assert!(!cp.resumed());
        assert_eq!(cp.run_start_time(), 1_700_000_000.25);
        assert!(!path.exists());
        cp.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1700000000.25\n");
        let cp = Checkpoint::open(&path, false, 1_700_000_500.0).unwrap();
        assert!(cp.resumed());
        assert_eq!(cp.run_start_time(), 1_700_000_000.25);
        cp.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1700000000.25\n");
        let cp = Checkpoint::open(&path, true, 1_700_000_500.0).unwrap();
        assert!(!cp.resumed());
        assert_eq!(cp.run_start_time(), 1_700_000_500.0);
        // the old run is kept until the new one is saved
        assert_eq!(fs::read_to_string(&path).unwrap(), "1700000000.25\n");
        cp.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1700000500\n");
    }

    #[test]
    fn test_extra_lines_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "1000.5\nanything else\n").unwrap();
        let cp = Checkpoint::open(&path, false, 2000.0).unwrap();
        assert_eq!(cp.run_start_time(), 1000.5);
    }

    #[test]
    fn test_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        fs::write(&path, "started yesterday\n").unwrap();
        let err = Checkpoint::open(&path, false, 2000.0).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
        let cp = Checkpoint::open(dir.path().join("no/such/dir"), false, 2000.0).unwrap();
        let err = cp.save().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Io);
    }
}
