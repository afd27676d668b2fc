use super::ProfileStep;
use crate::session::Setter;
use crate::tasks::Clock;
use crate::{EResult, Error};
use log::{error, info};

/// Replays profile steps against one or more chambers
///
/// Steps are kept sorted by time. A step is executed once the wall clock reaches
/// `run_start_time + step.time`, with a repeat period the executed step is queued again one
/// period later.
pub struct ProfileScheduler<'a> {
    setters: Vec<&'a dyn Setter>,
    clock: &'a dyn Clock,
    run_start_time: f64,
    steps: Vec<ProfileStep>,
    repeat_period: f64,
    test_only: bool,
}

impl<'a> ProfileScheduler<'a> {
    pub fn new(
        mut steps: Vec<ProfileStep>,
        setters: Vec<&'a dyn Setter>,
        clock: &'a dyn Clock,
        run_start_time: f64,
    ) -> Self {
        steps.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self {
            setters,
            clock,
            run_start_time,
            steps,
            repeat_period: 0.0,
            test_only: false,
        }
    }
    /// Period in seconds, zero disables repeating
    pub fn repeat(mut self, period: f64) -> Self {
        self.repeat_period = if period > 0.0 { period } else { 0.0 };
        self
    }
    /// Commands are logged only
    pub fn test_only(mut self, test_only: bool) -> Self {
        self.test_only = test_only;
        self
    }
    #[inline]
    pub fn run_start_time(&self) -> f64 {
        self.run_start_time
    }
    /// Steps waiting for execution, in order
    #[inline]
    pub fn pending(&self) -> &[ProfileStep] {
        &self.steps
    }
    fn insert(&mut self, step: ProfileStep) {
        let pos = self.steps.partition_point(|s| s.time <= step.time);
        self.steps.insert(pos, step);
    }
    /// Drops the steps which are already in the past and commands the chambers to the most
    /// recent of them
    ///
    /// With a repeat period every past step is folded into the current cycle: its latest
    /// occurrence decides the baseline and it is queued again at its next occurrence.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if no step has been reached yet
    pub fn catch_up(&mut self) -> EResult<ProfileStep> {
        let elapsed = self.clock.now() - self.run_start_time;
        let split = self.steps.partition_point(|s| s.time <= elapsed);
        if split == 0 {
            return Err(Error::invalid_operation(format!(
                "the first step starts in the future ({:.2}s after the run start, {:.2}s elapsed)",
                self.steps.first().map_or(f64::NAN, |s| s.time),
                elapsed
            )));
        }
        let past: Vec<ProfileStep> = self.steps.drain(..split).collect();
        let baseline = if self.repeat_period > 0.0 {
            let mut baseline: Option<ProfileStep> = None;
            for step in past {
                let k = ((elapsed - step.time) / self.repeat_period).floor();
                let occurrence = step.time + k * self.repeat_period;
                if baseline.map_or(true, |b| occurrence >= b.time) {
                    baseline = Some(step.at(occurrence));
                }
                self.insert(step.at(occurrence + self.repeat_period));
            }
            baseline
        } else {
            past.last().copied()
        }
        .ok_or_else(|| Error::invalid_operation("no baseline step"))?;
        info!(
            "catching up {:.2}s after the run start, baseline step at {:.2}s: {}",
            elapsed, baseline.time, baseline
        );
        self.apply(&baseline);
        Ok(baseline)
    }
    /// Waits for the next step and executes it
    ///
    /// Returns false if there are no more steps or the clock has been stopped.
    pub fn next_step(&mut self) -> bool {
        let Some(step) = self.steps.first().copied() else {
            return false;
        };
        let deadline = self.run_start_time + step.time;
        info!(
            "next step at {:.2} ({:.2}s from the run start): {}",
            deadline, step.time, step
        );
        if !self.clock.wait_until(deadline) {
            return false;
        }
        self.steps.remove(0);
        self.apply(&step);
        if self.repeat_period > 0.0 {
            self.insert(step.at(step.time + self.repeat_period));
        }
        true
    }
    /// Catch-up followed by the steady-state replay, returns when drained or stopped
    pub fn run(&mut self) -> EResult<()> {
        self.catch_up()?;
        self.replay();
        Ok(())
    }
    /// Executes the pending steps as they come due, returns when drained or stopped
    pub fn replay(&mut self) {
        while self.next_step() {}
        if self.clock.stopped() {
            info!("profile run stopped");
        } else {
            info!("profile completed");
        }
    }
    fn apply(&self, step: &ProfileStep) {
        apply_step(&self.setters, step, self.test_only);
    }
}

/// Sends the step targets to every chamber, a failed chamber does not stop the others
pub(crate) fn apply_step(setters: &[&dyn Setter], step: &ProfileStep, test_only: bool) {
    for setter in setters {
        info!("set '{}' {}", setter.device(), step);
        if test_only {
            info!("test only mode, no commands sent");
            continue;
        }
        if let Err(e) = apply_to(*setter, step) {
            error!("CRITICAL: {} step failed: {}", setter.device(), e);
        }
    }
}

fn apply_to(setter: &dyn Setter, step: &ProfileStep) -> EResult<()> {
    if let Some(t) = step.t {
        setter.set_t_setpoint(t)?;
    }
    if let Some(rh) = step.rh {
        setter.set_h_setpoint(rh)?;
    }
    if let Some(light) = step.light {
        setter.set_time_signal(light)?;
    }
    Ok(())
}
