use chamberctl::comm::sim::SimComm;
use chamberctl::config::{self, TrackConfig};
use chamberctl::interval::parse_interval;
use chamberctl::session::ChamberSession;
use chamberctl::tasks::{self, Control};
use chamberctl::track::{CommandSensor, Tracker};
use chamberctl::EResult;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

#[derive(Parser)]
#[clap(
    version,
    about = "Periodically sets a chamber to the values read from an external sensor"
)]
struct Args {
    #[clap(short = 'c', long = "config", help = "YAML configuration file")]
    config: Option<String>,
    #[clap(
        short = 'd',
        long = "dev",
        help = "serial device, a port number N means /dev/ttyUSBN"
    )]
    device: Option<String>,
    #[clap(
        short = 'C',
        long = "cmd",
        help = "command printing temperature, humidity and optionally light"
    )]
    cmd: Option<String>,
    #[clap(short = 'F', long = "frequency", help = "update interval (900s)")]
    freq: Option<String>,
    #[clap(long = "light-on-hour", help = "lights on hour if the command reports no light")]
    light_on_hour: Option<u32>,
    #[clap(long = "light-off-hour", help = "lights off hour if the command reports no light")]
    light_off_hour: Option<u32>,
    #[clap(
        long = "override-light",
        help = "use the light cycle even if the command reports light"
    )]
    override_light: bool,
    #[clap(short = 'T', long = "test-only", help = "log the commands, do not send them")]
    test_only: bool,
    #[clap(long = "unit", help = "Modbus unit id")]
    unit: Option<u8>,
    #[clap(long = "timeout", help = "serial timeout (1s, 500ms)")]
    timeout: Option<String>,
    #[clap(long = "simulate", help = "use a simulated chamber instead of the serial port")]
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
    fn load_config(&self) -> EResult<TrackConfig> {
        let mut config = if let Some(ref path) = self.config {
            TrackConfig::load(path, &config::env_context())?
        } else {
            TrackConfig::default()
        };
        if let Some(ref dev) = self.device {
            config.device = Some(dev.as_str().into());
        }
        if let Some(ref cmd) = self.cmd {
            config.cmd = Some(cmd.clone());
        }
        if let Some(ref freq) = self.freq {
            config.freq = parse_interval(freq)?;
        }
        if let Some(hour) = self.light_on_hour {
            config.light_on_hour = hour;
        }
        if let Some(hour) = self.light_off_hour {
            config.light_off_hour = hour;
        }
        if let Some(unit) = self.unit {
            config.unit = unit;
        }
        if let Some(ref timeout) = self.timeout {
            config.timeout = parse_interval(timeout)?;
        }
        config.override_light |= self.override_light;
        config.test_only |= self.test_only;
        config.simulate |= self.simulate;
        Ok(config)
    }
}

fn run(args: &Args) -> EResult<()> {
    let config = args.load_config()?;
    let device = config.device_path()?;
    let sensor = CommandSensor::new(config.cmd()?).timeout(config.cmd_timeout);
    let light_cycle = config.light_cycle()?;
    let session = if config.simulate {
        ChamberSession::with_comm(Arc::new(SimComm::at_rest(&device, config.unit)), config.unit)
    } else {
        ChamberSession::connect(&device, config.unit, config.timeout)?
    };
    info!("tracking {} every {:?}", device, config.freq);
    let control = Arc::new(Control::new());
    tasks::spawn_signal_handler(control.clone());
    Tracker::new(vec![&session], &sensor, control.as_ref())
        .light_cycle(light_cycle)
        .override_light(config.override_light)
        .test_only(config.test_only)
        .run(config.freq);
    Ok(())
}

fn main() {
    let args = Args::parse();
    chamberctl::init_logging("chamber-track", args.verbosity());
    if let Err(e) = run(&args) {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(e.kind().exit_code());
    }
}
