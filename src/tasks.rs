use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};
use signal_hook::consts::{SIGALRM, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shortest slice of an interruptible wait, seconds
pub const MIN_CYCLE_SLEEP: f64 = 0.1;

const CHILD_WAIT_STEP: Duration = Duration::from_millis(50);

/// Wall-clock time source with an interruptible wait
pub trait Clock {
    /// Epoch seconds
    fn now(&self) -> f64;
    /// Waits up to `timeout`, may return earlier if woken
    fn wait(&self, timeout: Duration);
    fn stopped(&self) -> bool {
        false
    }
    /// Waits until `deadline` (epoch seconds), returns false if stopped
    ///
    /// An early wake only re-evaluates the deadline, the method never returns true before it.
    fn wait_until(&self, deadline: f64) -> bool {
        loop {
            if self.stopped() {
                return false;
            }
            let now = self.now();
            if now >= deadline {
                return true;
            }
            self.wait(Duration::from_secs_f64(
                (deadline - now).max(MIN_CYCLE_SLEEP),
            ));
        }
    }
}

/// Process-wide wake/stop control, driven by signals
#[derive(Default)]
pub struct Control {
    woken: Mutex<bool>,
    cond: Condvar,
    stop: AtomicBool,
}

impl Control {
    pub fn new() -> Self {
        Self::default()
    }
    /// The current wait (or the next one) returns immediately
    pub fn wake(&self) {
        *self.woken.lock() = true;
        self.cond.notify_all();
    }
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake();
    }
}

impl Clock for Control {
    fn now(&self) -> f64 {
        crate::now()
    }
    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken && !self.stopped() {
            self.cond.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub fn thread_name() -> String {
    let th = thread::current();
    if let Some(name) = th.name() {
        name.to_owned()
    } else {
        format!("{:?}", th.id())
    }
}

/// Waits for a child process, the child is killed and reaped if it is still running after
/// `timeout`
///
/// Returns `None` if the child was killed
pub fn wait_child(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            // the child may exit between try_wait and kill
            let _ = child.kill();
            child.wait()?;
            return Ok(None);
        }
        thread::sleep(CHILD_WAIT_STEP);
    }
}

/// SIGALRM wakes the control, SIGTERM/SIGINT stop it
///
/// # Panics
///
/// Will panic if unable to register the handlers or spawn the thread
pub fn spawn_signal_handler(control: Arc<Control>) {
    let mut signals = Signals::new([SIGALRM, SIGTERM, SIGINT]).unwrap();
    thread::Builder::new()
        .name("Ssignals".to_owned())
        .spawn(move || {
            for sig in signals.forever() {
                match sig {
                    SIGALRM => {
                        debug!("SIGALRM received, waking up");
                        control.wake();
                    }
                    SIGTERM | SIGINT => {
                        info!("termination signal received, stopping");
                        control.stop();
                    }
                    v => error!("unexpected signal {}", v),
                }
            }
        })
        .unwrap();
}


#[cfg(test)]
mod test {
    use super::manual::ManualClock;
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_until_ignores_early_wake() {
        let clock = ManualClock::new(100.0);
        clock.wake_at(103.0);
        assert!(clock.wait_until(110.0));
        assert_eq!(clock.now(), 110.0);
        assert_eq!(clock.waits(), [103.0, 110.0]);
        // the deadline has passed
        assert!(clock.wait_until(105.0));
        assert_eq!(clock.waits().len(), 2);
    }

    #[test]
    fn test_wait_until_stopped() {
        let clock = ManualClock::new(0.0).stop_at(50.0);
        assert!(!clock.wait_until(100.0));
        assert_eq!(clock.now(), 100.0);
        assert!(!clock.wait_until(200.0));
    }

    #[test]
    fn test_control_wake() {
        let control = Arc::new(Control::new());
        let c = control.clone();
        let t = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            c.wake();
        });
        control.wait(Duration::from_secs(10));
        assert!(t.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
        assert!(!control.stopped());
        control.stop();
        assert!(control.stopped());
        assert!(!control.wait_until(control.now() + 10.0));
    }
}
