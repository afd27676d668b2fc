use crate::alarm::{DeviationAlarm, Message, Severity};
use crate::interval::Loop;
use crate::logfile::{Level, LogFile};
use crate::mail::Mailer;
use crate::session::{ChamberSession, StatSnapshot};
use crate::tasks::Clock;
use crate::EResult;
use std::sync::Arc;
use log::{error, info};
use serde::Deserialize;
use std::fmt::Write as _;
use std::time::Duration;

/// What a setpoint change does to an already running disable window
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisablePolicy {
    /// the window is extended, never shortened
    #[default]
    Extend,
    /// the window is replaced with the one computed for the latest change
    Restart,
}

/// Deviation alarm settings of one channel
#[derive(Debug, Copy, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub trigger: f64,
    pub clear: f64,
    /// seconds per unit of the setpoint change
    pub disable_multiplier: f64,
    /// seconds
    pub disable_constant: f64,
}

impl ChannelConfig {
    pub fn disable_time(&self, change: f64) -> f64 {
        self.disable_constant + self.disable_multiplier * change.abs()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub freq: Duration,
    pub t: ChannelConfig,
    pub h: ChannelConfig,
    pub disable_policy: DisablePolicy,
    pub couple_humidity: bool,
    pub email_level: Severity,
}

/// Chamber monitoring loop: polls the chamber, writes the log and raises alarms
pub struct Monitor<'a> {
    session: &'a ChamberSession,
    log: &'a LogFile,
    mailer: &'a dyn Mailer,
    clock: &'a dyn Clock,
    config: MonitorConfig,
    alarm_t: DeviationAlarm,
    alarm_h: DeviationAlarm,
    seeded: bool,
}

fn setpoint_changed(current: Option<f64>, setpoint: f64) -> Option<f64> {
    current.filter(|sp| *sp != setpoint && !(sp.is_nan() && setpoint.is_nan()))
}

impl<'a> Monitor<'a> {
    pub fn new(
        session: &'a ChamberSession,
        log: &'a LogFile,
        mailer: &'a dyn Mailer,
        clock: &'a dyn Clock,
        config: MonitorConfig,
    ) -> EResult<Self> {
        let alarm_t = DeviationAlarm::new("T", config.t.trigger, Some(config.t.clear), None, None)?;
        let alarm_h = DeviationAlarm::new("H", config.h.trigger, Some(config.h.clear), None, None)?;
        Ok(Self {
            session,
            log,
            mailer,
            clock,
            config,
            alarm_t,
            alarm_h,
            seeded: false,
        })
    }
    #[inline]
    pub fn alarm_t(&self) -> &DeviationAlarm {
        &self.alarm_t
    }
    #[inline]
    pub fn alarm_h(&self) -> &DeviationAlarm {
        &self.alarm_h
    }
    fn device(&self) -> &str {
        crate::session::Setter::device(self.session)
    }
    fn record_at(&self, time: f64, level: Level, payload: &str) {
        if let Err(e) = self.log.write_at(time, level, payload) {
            error!("log file {}: {}", self.log.path().display(), e);
        }
    }
    fn record(&self, level: Level, payload: &str) {
        self.record_at(self.clock.now(), level, payload);
    }
    fn record_stat(&self, stat: &StatSnapshot) {
        self.record_at(stat.time(), Level::Stat, &stat.format_values());
    }
    /// Startup records, the first poll and the initial alarm setpoints
    ///
    /// A failed first poll is reported as any other poll failure, the next cycle retries it.
    pub fn start(&mut self) -> Vec<Message> {
        let now = self.clock.now();
        self.record(
            Severity::Info.into(),
            &format!(
                "Logger started {}; dev={}; pid={}",
                crate::format_time(now),
                self.device(),
                std::process::id()
            ),
        );
        self.record(
            Severity::Info.into(),
            &format!(
                "freq={:?}; T alarm {:?}; H alarm {:?}; disable policy {:?}; email level {}",
                self.config.freq,
                self.config.t,
                self.config.h,
                self.config.disable_policy,
                self.config.email_level
            ),
        );
        self.first_poll()
    }
    /// True once the first poll succeeded and the alarms know the setpoints
    #[inline]
    pub fn seeded(&self) -> bool {
        self.seeded
    }
    fn first_poll(&mut self) -> Vec<Message> {
        match self.poll() {
            Ok(stat) => {
                self.record(Level::StatHeader, &StatSnapshot::header());
                self.record_stat(&stat);
                self.alarm_t.init_setpoint(stat.t_setpoint());
                self.alarm_h.init_setpoint(stat.h_setpoint());
                self.seeded = true;
                Vec::new()
            }
            Err(msgs) => msgs,
        }
    }
    /// On failure the error is recorded at CRITICAL and mailed
    fn poll(&self) -> Result<Arc<StatSnapshot>, Vec<Message>> {
        self.session
            .update_stat_at(self.clock.now())
            .map_err(|e| {
                let msg = (Severity::Critical, e.to_string());
                self.record(msg.0.into(), &msg.1);
                let msgs = vec![msg];
                self.notify(&msgs);
                msgs
            })
    }
    fn disable(alarm: &mut DeviationAlarm, until: f64, policy: DisablePolicy) {
        alarm.disable_until_time(until, policy == DisablePolicy::Restart);
    }
    /// Applies disable windows for setpoint changes since the last cycle
    fn handle_setpoint_changes(&mut self, stat: &StatSnapshot) {
        let now = self.clock.now();
        let policy = self.config.disable_policy;
        if let Some(prev) = setpoint_changed(self.alarm_t.setpoint(), stat.t_setpoint()) {
            let delay = self.config.t.disable_time(stat.t_setpoint() - prev);
            let until = now + delay;
            Self::disable(&mut self.alarm_t, until, policy);
            let msg = if self.config.couple_humidity {
                Self::disable(&mut self.alarm_h, until, policy);
                format!("Disabling T and H alarms for {:.2}s until {:.2}", delay, until)
            } else {
                format!("Disabling T alarm for {:.2}s until {:.2}", delay, until)
            };
            self.record(Severity::Info.into(), &msg);
        }
        if let Some(prev) = setpoint_changed(self.alarm_h.setpoint(), stat.h_setpoint()) {
            let delay = self.config.h.disable_time(stat.h_setpoint() - prev);
            let until = now + delay;
            Self::disable(&mut self.alarm_h, until, policy);
            self.record(
                Severity::Info.into(),
                &format!("Disabling H alarm for {:.2}s until {:.2}", delay, until),
            );
        }
    }
    /// One poll, returns the alarm messages produced
    pub fn cycle(&mut self) -> Vec<Message> {
        if !self.seeded {
            return self.first_poll();
        }
        let stat = match self.poll() {
            Ok(v) => v,
            Err(msgs) => return msgs,
        };
        self.record_stat(&stat);
        self.handle_setpoint_changes(&stat);
        let now = self.clock.now();
        let mut msgs = Vec::new();
        if stat.chamber_alarm() {
            msgs.push((Severity::Critical, "ALARM CHAMBER".to_owned()));
        }
        msgs.extend(self.alarm_t.update_at(now, stat.t_setpoint(), stat.t()));
        msgs.extend(self.alarm_h.update_at(now, stat.h_setpoint(), stat.h()));
        for (severity, msg) in &msgs {
            self.record((*severity).into(), msg);
        }
        self.notify(&msgs);
        msgs
    }
    /// Sends an email if any message reaches the configured level
    fn notify(&self, msgs: &[Message]) {
        let alarms: Vec<String> = msgs
            .iter()
            .filter(|(severity, _)| *severity >= self.config.email_level)
            .map(|(severity, msg)| format!("{}\t{}", severity, msg))
            .collect();
        if alarms.is_empty() {
            return;
        }
        let subject = format!("Chamber Alarm '{}'", self.device());
        let mut body = format!("{}\n{}\n\n", subject, alarms.join("\n"));
        let _ = writeln!(body, "STAT_HEADER\t{}", StatSnapshot::header());
        if let Some(stat) = self.session.get_stat() {
            let _ = writeln!(body, "STAT\t{:.2}\t{}", stat.time(), stat.format_values());
        }
        body.push_str("\ntail of logfile:\n");
        for line in self.log.tail().lines() {
            body.push_str(line);
            body.push('\n');
        }
        if let Err(e) = self.mailer.send(&subject, &body) {
            error!("unable to send alarm email: {}", e);
        }
    }
    /// Polls on the `start + n * freq` grid until the clock is stopped
    pub fn run(&mut self) {
        let start = self.clock.now();
        self.start();
        let clock = self.clock;
        let mut poll = Loop::prepare(clock, start, self.config.freq);
        while poll.tick() {
            self.cycle();
        }
        info!("monitor stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::sim::SimComm;
    use crate::mail::memory::MemoryMailer;
    use crate::modbus::regs;
    use crate::tasks::manual::ManualClock;
    use std::fs;
    use std::sync::Arc;

    struct Bench {
        sim: Arc<SimComm>,
        session: ChamberSession,
        log: LogFile,
        mailer: MemoryMailer,
        clock: ManualClock,
        _dir: tempfile::TempDir,
    }

    impl Bench {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let sim = Arc::new(SimComm::at_rest("/dev/ttyS0", 1));
            sim.set_value(regs::T, 20.0);
            sim.set_value(regs::T_SETPOINT, 20.0);
            Self {
                session: ChamberSession::with_comm(sim.clone(), 1),
                sim,
                log: LogFile::new(dir.path().join("chamber.log")),
                mailer: MemoryMailer::default(),
                clock: ManualClock::new(1000.0),
                _dir: dir,
            }
        }
        fn monitor(&self, config: MonitorConfig) -> Monitor<'_> {
            Monitor::new(&self.session, &self.log, &self.mailer, &self.clock, config).unwrap()
        }
        fn lines(&self) -> Vec<String> {
            fs::read_to_string(self.log.path())
                .unwrap()
                .lines()
                .map(ToOwned::to_owned)
                .collect()
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            freq: Duration::from_secs(30),
            t: ChannelConfig {
                trigger: 1.0,
                clear: 1.0,
                disable_multiplier: 10.0,
                disable_constant: 10.0,
            },
            h: ChannelConfig {
                trigger: 10.0,
                clear: 10.0,
                disable_multiplier: 10.0,
                disable_constant: 10.0,
            },
            disable_policy: DisablePolicy::Extend,
            couple_humidity: true,
            email_level: Severity::Critical,
        }
    }

    fn level(line: &str) -> &str {
        line.split('\t').nth(1).unwrap()
    }

    #[test]
    fn test_start() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(config());
        monitor.start();
        let lines = bench.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("1000.00\tINFO\tLogger started "));
        assert!(lines[0].contains("dev=/dev/ttyS0; pid="));
        assert_eq!(
            lines[2],
            format!("1000.00\tSTAT_HEADER\t{}", StatSnapshot::header())
        );
        assert_eq!(level(&lines[3]), "STAT");
        assert!(lines[3].ends_with("\t0\t20.0\t20.0\t0\t50.0\t50.0\t0\t0\t0\t0\t0\t0"));
        assert_eq!(monitor.alarm_t().setpoint(), Some(20.0));
        assert_eq!(monitor.alarm_h().setpoint(), Some(50.0));
        // the seeded setpoints are not reported as changes
        assert!(monitor.cycle().is_empty());
        assert!(bench.mailer.sent().is_empty());
    }

    #[test]
    fn test_setpoint_change_disables_alarms() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(config());
        monitor.start();
        bench.clock.set(1030.0);
        bench.sim.set_value(regs::T_SETPOINT, 25.0);
        let msgs = monitor.cycle();
        assert_eq!(
            msgs,
            [
                (Severity::Info, "T setpoint change from 20 to 25".to_owned()),
                (
                    Severity::Info,
                    "ALARM T disabled until 1090.00 (60.00 more sec)".to_owned()
                ),
                (
                    Severity::Info,
                    "ALARM H disabled until 1090.00 (60.00 more sec)".to_owned()
                ),
            ]
        );
        assert_eq!(monitor.alarm_t().reactivate_time(), Some(1090.0));
        assert_eq!(monitor.alarm_h().reactivate_time(), Some(1090.0));
        let lines = bench.lines();
        assert!(lines.contains(&"1030.00\tINFO\tDisabling T and H alarms for 60.00s until 1090.00".to_owned()));
        // still far from the new setpoint, but the alarm is disabled
        bench.clock.set(1060.0);
        assert!(!monitor.cycle().iter().any(|(s, _)| *s > Severity::Info));
        // the window is over
        bench.clock.set(1090.0);
        let msgs = monitor.cycle();
        assert_eq!(msgs[0].0, Severity::Critical);
        assert!(msgs[0].1.starts_with("ALARM T LOW value=20 SP=25"));
        let sent = bench.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Chamber Alarm '/dev/ttyS0'");
        assert!(sent[0].1.contains("CRITICAL\tALARM T LOW"));
        assert!(sent[0].1.contains("\nSTAT_HEADER\ttime\tChamberAlarmStatus\t"));
        assert!(sent[0].1.contains("\ntail of logfile:\n"));
        assert!(sent[0].1.contains("Disabling T and H alarms"));
    }

    #[test]
    fn test_uncoupled_humidity() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(MonitorConfig {
            couple_humidity: false,
            ..config()
        });
        monitor.start();
        bench.sim.set_value(regs::T_SETPOINT, 22.0);
        monitor.cycle();
        assert_eq!(monitor.alarm_t().reactivate_time(), Some(1030.0));
        assert_eq!(monitor.alarm_h().reactivate_time(), None);
    }

    #[test]
    fn test_disable_policy() {
        for (policy, expected) in [
            (DisablePolicy::Extend, 1210.0),
            (DisablePolicy::Restart, 1040.0),
        ] {
            let bench = Bench::new();
            let mut monitor = bench.monitor(MonitorConfig {
                disable_policy: policy,
                ..config()
            });
            monitor.start();
            // 20 -> 40: 210 s
            bench.sim.set_value(regs::T_SETPOINT, 40.0);
            monitor.cycle();
            assert_eq!(monitor.alarm_t().reactivate_time(), Some(1210.0));
            // 40 -> 39: 20 s
            bench.clock.set(1020.0);
            bench.sim.set_value(regs::T_SETPOINT, 39.0);
            monitor.cycle();
            assert_eq!(monitor.alarm_t().reactivate_time(), Some(expected));
        }
    }

    #[test]
    fn test_chamber_alarm() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(config());
        monitor.start();
        bench.sim.set_value(regs::CHAMBER_ALARM_STATUS, 1.0);
        let msgs = monitor.cycle();
        assert_eq!(msgs, [(Severity::Critical, "ALARM CHAMBER".to_owned())]);
        assert_eq!(bench.mailer.sent().len(), 1);
        assert!(bench.lines().last().unwrap().ends_with("\tCRITICAL\tALARM CHAMBER"));
    }

    #[test]
    fn test_poll_failure() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(config());
        monitor.start();
        let before = bench.lines().len();
        bench.sim.fail_register(regs::REGISTER_MAP[4].address);
        let msgs = monitor.cycle();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].0, Severity::Critical);
        assert!(msgs[0].1.starts_with("communication error: poll aborted at H"));
        let lines = bench.lines();
        // no STAT record for the failed poll
        assert_eq!(lines.len(), before + 1);
        assert_eq!(level(lines.last().unwrap()), "CRITICAL");
        assert_eq!(bench.mailer.sent().len(), 1);
        bench.sim.clear_failures();
        assert!(monitor.cycle().is_empty());
        assert_eq!(level(bench.lines().last().unwrap()), "STAT");
    }

    #[test]
    fn test_email_level() {
        let bench = Bench::new();
        let mut monitor = bench.monitor(MonitorConfig {
            email_level: Severity::Warning,
            ..config()
        });
        monitor.start();
        bench.sim.set_value(regs::T, 18.0);
        monitor.cycle();
        monitor.cycle();
        // fresh trigger and the re-trigger
        assert_eq!(bench.mailer.sent().len(), 2);
        bench.sim.set_value(regs::T, 20.0);
        let msgs = monitor.cycle();
        assert_eq!(msgs[0].0, Severity::Notice);
        assert_eq!(bench.mailer.sent().len(), 2);
    }

    #[test]
    fn test_run() {
        let bench = Bench::new();
        let clock = ManualClock::new(1000.0).stop_at(1100.0);
        let mut monitor =
            Monitor::new(&bench.session, &bench.log, &bench.mailer, &clock, config()).unwrap();
        monitor.run();
        let stats: Vec<String> = bench
            .lines()
            .into_iter()
            .filter(|l| level(l) == "STAT")
            .collect();
        // the first poll and the 1030, 1060 and 1090 slots
        assert_eq!(stats.len(), 4);
        assert!(stats[0].starts_with("1000.00\tSTAT\t"));
        assert!(stats[3].starts_with("1090.00\tSTAT\t"));
        assert_eq!(clock.waits(), [1030.0, 1060.0, 1090.0, 1120.0]);
    }

    #[test]
    fn test_first_poll_failure_is_retried() {
        let bench = Bench::new();
        let clock = ManualClock::new(1000.0).stop_at(1050.0);
        let mut monitor =
            Monitor::new(&bench.session, &bench.log, &bench.mailer, &clock, config()).unwrap();
        bench.sim.fail_register(regs::REGISTER_MAP[4].address);
        let msgs = monitor.start();
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].1.starts_with("communication error: poll aborted at H"));
        assert!(!monitor.seeded());
        assert_eq!(monitor.alarm_t().setpoint(), None);
        let lines = bench.lines();
        assert_eq!(level(lines.last().unwrap()), "CRITICAL");
        assert!(!lines.iter().any(|l| level(l) == "STAT_HEADER"));
        assert_eq!(bench.mailer.sent().len(), 1);
        // still failing: reported again, nothing else happens
        assert_eq!(monitor.cycle().len(), 1);
        assert_eq!(bench.mailer.sent().len(), 2);
        bench.sim.clear_failures();
        clock.set(1030.0);
        assert!(monitor.cycle().is_empty());
        assert!(monitor.seeded());
        assert_eq!(monitor.alarm_t().setpoint(), Some(20.0));
        let lines = bench.lines();
        let n = lines.len();
        assert_eq!(level(&lines[n - 2]), "STAT_HEADER");
        assert!(lines[n - 1].starts_with("1030.00\tSTAT\t"));
    }

    #[test]
    fn test_run_survives_failed_first_poll() {
        let bench = Bench::new();
        let clock = ManualClock::new(1000.0).stop_at(1050.0);
        let mut monitor =
            Monitor::new(&bench.session, &bench.log, &bench.mailer, &clock, config()).unwrap();
        bench.sim.fail_register(regs::REGISTER_MAP[4].address);
        monitor.run();
        // the first poll and the 1030 slot
        assert_eq!(bench.mailer.sent().len(), 2);
        assert!(bench.mailer.sent()[0].1.contains("poll aborted at H"));
        assert!(!bench.lines().iter().any(|l| level(l) == "STAT"));
    }
}
