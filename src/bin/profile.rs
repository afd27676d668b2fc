use chamberctl::comm::sim::SimComm;
use chamberctl::config::{self, ProfileConfig};
use chamberctl::interval::parse_interval;
use chamberctl::profile::{runner, Profile, RunOptions};
use chamberctl::session::{ChamberSession, Setter};
use chamberctl::tasks::{self, Control};
use chamberctl::EResult;
use clap::Parser;
use log::error;
use std::sync::Arc;

#[derive(Parser)]
#[clap(version, about = "Replays a T/RH/light profile on one or more chambers")]
struct Args {
    #[clap(short = 'c', long = "config", help = "YAML configuration file")]
    config: Option<String>,
    #[clap(
        short = 'd',
        long = "dev",
        help = "serial devices, comma separated, a port number N means /dev/ttyUSBN"
    )]
    devices: Option<String>,
    #[clap(long = "unit", help = "Modbus unit id")]
    unit: Option<u8>,
    #[clap(long = "timeout", help = "serial timeout (1s, 500ms)")]
    timeout: Option<String>,
    #[clap(short = 'l', long = "logfile", help = "run checkpoint file")]
    logfile: Option<String>,
    #[clap(short = 'p', long = "profile", help = "profile CSV file or inline CSV text")]
    profile: Option<String>,
    #[clap(short = 'r', long = "repeat", help = "repeat period (86400s), 0 disables")]
    repeat: Option<String>,
    #[clap(long = "clocktime", help = "profile times are wall clock times")]
    clocktime: bool,
    #[clap(long = "restart", help = "discard the checkpoint and start a new run")]
    restart: bool,
    #[clap(short = 'T', long = "test-only", help = "log the commands, do not send them")]
    test_only: bool,
    #[clap(long = "simulate", help = "use simulated chambers instead of serial ports")]
    simulate: bool,
    #[clap(short = 'v', action = clap::ArgAction::Count, help = "more verbose, repeatable")]
    verbose: u8,
    #[clap(short = 'q', action = clap::ArgAction::Count, help = "less verbose, repeatable")]
    quiet: u8,
}

impl Args {
    fn verbosity(&self) -> i8 {
        i8::try_from(self.verbose)
            .unwrap_or(i8::MAX)
            .saturating_sub(i8::try_from(self.quiet).unwrap_or(i8::MAX))
    }
    fn load_config(&self) -> EResult<ProfileConfig> {
        let mut config = if let Some(ref path) = self.config {
            ProfileConfig::load(path, &config::env_context())?
        } else {
            ProfileConfig::default()
        };
        if let Some(ref devices) = self.devices {
            config.devices = config::parse_device_list(devices);
        }
        if let Some(unit) = self.unit {
            config.unit = unit;
        }
        if let Some(ref timeout) = self.timeout {
            config.timeout = parse_interval(timeout)?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref profile) = self.profile {
            config.profile = Some(profile.clone());
        }
        if let Some(ref repeat) = self.repeat {
            config.repeat = parse_interval(repeat)?;
        }
        config.clocktime |= self.clocktime;
        config.restart |= self.restart;
        config.test_only |= self.test_only;
        config.simulate |= self.simulate;
        Ok(config)
    }
}

fn run(args: &Args) -> EResult<()> {
    let config = args.load_config()?;
    let devices = config.device_paths()?;
    let logfile = config.logfile()?;
    let profile = Profile::load(config.profile()?)?;
    let sessions = devices
        .iter()
        .map(|dev| {
            if config.simulate {
                Ok(ChamberSession::with_comm(
                    Arc::new(SimComm::at_rest(dev, config.unit)),
                    config.unit,
                ))
            } else {
                ChamberSession::connect(dev, config.unit, config.timeout)
            }
        })
        .collect::<EResult<Vec<ChamberSession>>>()?;
    let control = Arc::new(Control::new());
    tasks::spawn_signal_handler(control.clone());
    let setters: Vec<&dyn Setter> = sessions.iter().map(|s| s as &dyn Setter).collect();
    let mut scheduler = runner::start(
        &profile,
        logfile,
        setters,
        control.as_ref(),
        RunOptions {
            time_base: config.time_base(),
            restart: config.restart,
            repeat: config.repeat.as_secs_f64(),
            test_only: config.test_only,
        },
    )?;
    scheduler.replay();
    Ok(())
}

fn main() {
    let args = Args::parse();
    chamberctl::init_logging("chamber-profile", args.verbosity());
    if let Err(e) = run(&args) {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(e.kind().exit_code());
    }
}
