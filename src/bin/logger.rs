use chamberctl::config::{self, LoggerConfig};
use chamberctl::interval::parse_interval;
use chamberctl::logfile::LogFile;
use chamberctl::mail::{Mailer, NullMailer, SendmailMailer};
use chamberctl::monitor::Monitor;
use chamberctl::session::ChamberSession;
use chamberctl::tasks::{self, Control};
use chamberctl::EResult;
use clap::Parser;
use log::error;
use std::sync::Arc;

#[derive(Parser)]
#[clap(version, about = "Chamber logger and deviation alarm monitor")]
struct Args {
    #[clap(short = 'c', long = "config", help = "YAML configuration file")]
    config: Option<String>,
    #[clap(
        short = 'd',
        long = "dev",
        help = "serial device: path[:baud[:char_size[:parity[:stop_bits]]]] or port number N (/dev/ttySN)"
    )]
    device: Option<String>,
    #[clap(long = "unit", help = "Modbus unit id")]
    unit: Option<u8>,
    #[clap(long = "timeout", help = "serial timeout (1s, 500ms)")]
    timeout: Option<String>,
    #[clap(short = 'f', long = "freq", help = "poll interval (30s)")]
    freq: Option<String>,
    #[clap(short = 'l', long = "logfile")]
    logfile: Option<String>,
    #[clap(
        short = 'e',
        long = "alarm-email",
        help = "alarm email recipients, comma separated, \"none\" disables emails"
    )]
    alarm_email: Option<String>,
    #[clap(long = "overwrite", help = "remove the old log file first")]
    overwrite: bool,
    #[clap(short = 'T', long = "test", help = "print the chamber state and exit")]
    test: bool,
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
    fn load_config(&self) -> EResult<LoggerConfig> {
        let mut config = if let Some(ref path) = self.config {
            LoggerConfig::load(path, &config::env_context())?
        } else {
            LoggerConfig::default()
        };
        if let Some(ref dev) = self.device {
            config.device = Some(dev.as_str().into());
        }
        if let Some(unit) = self.unit {
            config.unit = unit;
        }
        if let Some(ref timeout) = self.timeout {
            config.timeout = parse_interval(timeout)?;
        }
        if let Some(ref freq) = self.freq {
            config.freq = parse_interval(freq)?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile.clone_from(logfile);
        }
        if let Some(ref email) = self.alarm_email {
            config.alarm_email.clone_from(email);
        }
        if self.overwrite {
            config.overwrite = true;
        }
        Ok(config)
    }
}

fn run(args: &Args) -> EResult<()> {
    let config = args.load_config()?;
    let device = config.device_path()?;
    let session = ChamberSession::connect(&device, config.unit, config.timeout)?;
    if args.test {
        session.update_stat()?;
        print!("{}", session.describe());
        return Ok(());
    }
    let log = LogFile::new(&config.logfile);
    if config.overwrite {
        log.remove()?;
    }
    let mailer: Box<dyn Mailer> = match config.alarm_email() {
        Some(to) => Box::new(
            SendmailMailer::new(
                &config.sendmail,
                to.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(ToOwned::to_owned)
                    .collect(),
            )
            .timeout(config.sendmail_timeout),
        ),
        None => Box::new(NullMailer),
    };
    let control = Arc::new(Control::new());
    tasks::spawn_signal_handler(control.clone());
    let mut monitor = Monitor::new(
        &session,
        &log,
        mailer.as_ref(),
        control.as_ref(),
        config.monitor_config(),
    )?;
    monitor.run();
    Ok(())
}

fn main() {
    let args = Args::parse();
    chamberctl::init_logging("chamber-logger", args.verbosity());
    if let Err(e) = run(&args) {
        error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(e.kind().exit_code());
    }
}
