//! Start of a profile run on already connected chambers
use super::{Checkpoint, Profile, ProfileScheduler, TimeBase};
use crate::session::Setter;
use crate::tasks::Clock;
use crate::EResult;
use log::info;
use std::path::Path;

#[derive(Debug, Copy, Clone, Default)]
pub struct RunOptions {
    pub time_base: TimeBase,
    /// ignore an existing checkpoint
    pub restart: bool,
    /// seconds, zero disables repeating
    pub repeat: f64,
    pub test_only: bool,
}

/// Resolves the profile against the run start and commands the chambers to the baseline step,
/// the checkpoint of a new run is persisted only after that succeeded
///
/// # Errors
///
/// `Configuration` for profile times which can not be resolved, `InvalidOperation` if no step
/// is due yet, `Io` if the checkpoint can not be read or written
pub fn start<'a, P: AsRef<Path>>(
    profile: &Profile,
    checkpoint: P,
    setters: Vec<&'a dyn Setter>,
    clock: &'a dyn Clock,
    options: RunOptions,
) -> EResult<ProfileScheduler<'a>> {
    let checkpoint = Checkpoint::open(checkpoint, options.restart, clock.now())?;
    if checkpoint.resumed() {
        info!(
            "resuming the run started {}",
            crate::format_time(checkpoint.run_start_time())
        );
    }
    let steps = profile.resolve(options.time_base, checkpoint.run_start_time())?;
    let mut scheduler = ProfileScheduler::new(steps, setters, clock, checkpoint.run_start_time())
        .repeat(options.repeat)
        .test_only(options.test_only);
    scheduler.catch_up()?;
    checkpoint.save()?;
    Ok(scheduler)
}
