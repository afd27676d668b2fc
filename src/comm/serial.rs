use super::{Comm, CommGuard};
use crate::lock::FileLock;
use crate::{EResult, Error};
use log::debug;
use parking_lot::Mutex;
use serial::prelude::*;
use serial::SystemPort;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_BAUD_RATE: &str = "19200";
const DEFAULT_CHAR_SIZE: &str = "8";
const DEFAULT_PARITY: &str = "N";
const DEFAULT_STOP_BITS: &str = "1";

struct PortSettings<'a> {
    dev: &'a str,
    baud_rate: serial::BaudRate,
    char_size: serial::CharSize,
    parity: serial::Parity,
    stop_bits: serial::StopBits,
}

/// path[:baud[:char_size[:parity[:stop_bits]]]], defaults are 19200:8:N:1
fn parse_path(path: &str) -> EResult<PortSettings> {
    let mut sp = path.split(':');
    let dev = sp
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::configuration(format!("serial device not specified: {}", path)))?;
    let baud_rate = match sp.next().unwrap_or(DEFAULT_BAUD_RATE) {
        "110" => serial::Baud110,
        "300" => serial::Baud300,
        "600" => serial::Baud600,
        "1200" => serial::Baud1200,
        "2400" => serial::Baud2400,
        "4800" => serial::Baud4800,
        "9600" => serial::Baud9600,
        "19200" => serial::Baud19200,
        "38400" => serial::Baud38400,
        "57600" => serial::Baud57600,
        "115200" => serial::Baud115200,
        v => {
            return Err(Error::configuration(format!(
                "specified serial baud rate not supported: {}",
                v
            )))
        }
    };
    let char_size = match sp.next().unwrap_or(DEFAULT_CHAR_SIZE) {
        "5" => serial::Bits5,
        "6" => serial::Bits6,
        "7" => serial::Bits7,
        "8" => serial::Bits8,
        v => {
            return Err(Error::configuration(format!(
                "specified serial char size not supported: {}",
                v
            )))
        }
    };
    let parity = match sp.next().unwrap_or(DEFAULT_PARITY) {
        "N" => serial::ParityNone,
        "E" => serial::ParityEven,
        "O" => serial::ParityOdd,
        v => {
            return Err(Error::configuration(format!(
                "specified serial parity not supported: {}",
                v
            )))
        }
    };
    let stop_bits = match sp.next().unwrap_or(DEFAULT_STOP_BITS) {
        "1" => serial::Stop1,
        "2" => serial::Stop2,
        v => {
            return Err(Error::configuration(format!(
                "specified serial stop bits not supported: {}",
                v
            )))
        }
    };
    if let Some(v) = sp.next() {
        return Err(Error::configuration(format!(
            "extra serial parameters not supported: {}",
            v
        )));
    }
    Ok(PortSettings {
        dev,
        baud_rate,
        char_size,
        parity,
        stop_bits,
    })
}

pub fn check_path(path: &str) -> EResult<()> {
    parse_path(path).map(|_| ())
}

/// Device part of the path (without port settings)
pub fn device_of(path: &str) -> &str {
    path.split(':').next().unwrap_or(path)
}

pub fn open(path: &str, timeout: Duration) -> EResult<SystemPort> {
    let s = parse_path(path)?;
    let mut port = serial::open(s.dev)?;
    port.reconfigure(&|settings| {
        settings.set_baud_rate(s.baud_rate)?;
        settings.set_char_size(s.char_size);
        settings.set_parity(s.parity);
        settings.set_stop_bits(s.stop_bits);
        settings.set_flow_control(serial::FlowNone);
        Ok(())
    })?;
    port.set_timeout(timeout)?;
    share(&port)?;
    Ok(port)
}

/// Drops the TIOCEXCL mode set on open, other processes may open the port and share it under
/// flock
fn share(port: &SystemPort) -> EResult<()> {
    if unsafe { libc::ioctl(port.as_raw_fd(), libc::TIOCNXCL) } < 0 {
        return Err(Error::connection(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[allow(clippy::module_name_repetitions)]
pub struct SerialComm {
    path: String,
    port: Mutex<Option<SystemPort>>,
    timeout: Duration,
    busy: Mutex<()>,
    broken: AtomicBool,
}

impl Comm for SerialComm {
    /// flock is taken on the port itself, the port is (re)opened here only and is never closed
    /// while locked
    fn lock(&self) -> EResult<CommGuard<'_>> {
        let local = self.busy.lock();
        let fd = {
            let mut port = self.port.lock();
            if self.broken.swap(false, Ordering::SeqCst) {
                port.take();
            }
            if port.is_none() {
                port.replace(open(&self.path, self.timeout).map_err(|e| {
                    Error::communication(format!("{}: reconnect failed: {}", self.device(), e))
                })?);
            }
            port.as_ref().ok_or_else(not_connected)?.as_raw_fd()
        };
        let file = FileLock::exclusive_fd(fd).map_err(|e| {
            Error::communication(format!("unable to lock {}: {}", self.device(), e))
        })?;
        Ok(CommGuard::new(local, Some(file)))
    }
    fn reconnect(&self) {
        let _local = self.busy.lock();
        self.port.lock().take();
    }
    fn write(&self, buf: &[u8]) -> Result<(), std::io::Error> {
        let mut port = self.port.lock();
        let res = port.as_mut().ok_or_else(not_connected)?.write_all(buf);
        if res.is_err() {
            self.broken.store(true, Ordering::SeqCst);
        }
        res
    }
    fn read_exact(&self, buf: &mut [u8]) -> Result<(), std::io::Error> {
        let mut port = self.port.lock();
        let res = port.as_mut().ok_or_else(not_connected)?.read_exact(buf);
        if res.is_err() {
            self.broken.store(true, Ordering::SeqCst);
        }
        res
    }
    fn device(&self) -> &str {
        device_of(&self.path)
    }
}

fn not_connected() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::NotConnected, "serial port not connected")
}

impl SerialComm {
    /// Opens the port immediately
    pub fn open(path: &str, timeout: Duration) -> EResult<Self> {
        check_path(path)?;
        let port = open(path, timeout)?;
        debug!("serial port {} opened", path);
        Ok(Self {
            path: path.to_owned(),
            port: Mutex::new(Some(port)),
            busy: <_>::default(),
            broken: AtomicBool::new(false),
            timeout,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn test_parse_path() {
        let s = parse_path("/dev/ttyS0").unwrap();
        assert_eq!(s.dev, "/dev/ttyS0");
        assert_eq!(s.baud_rate, serial::Baud19200);
        assert_eq!(s.char_size, serial::Bits8);
        assert_eq!(s.parity, serial::ParityNone);
        assert_eq!(s.stop_bits, serial::Stop1);
        let s = parse_path("/dev/ttyUSB0:9600:7:E:2").unwrap();
        assert_eq!(s.baud_rate, serial::Baud9600);
        assert_eq!(s.char_size, serial::Bits7);
        assert_eq!(s.parity, serial::ParityEven);
        assert_eq!(s.stop_bits, serial::Stop2);
    }

    #[test]
    fn test_parse_path_invalid() {
        for p in ["", "/dev/ttyS0:1234", "/dev/ttyS0:9600:9", "/dev/ttyS0:9600:8:X"] {
            assert_eq!(
                parse_path(p).err().unwrap().kind(),
                ErrorKind::Configuration,
                "{}",
                p
            );
        }
        assert!(parse_path("/dev/ttyS0:9600:8:N:1:x").is_err());
        assert_eq!(device_of("/dev/ttyS0:9600:8:N:1"), "/dev/ttyS0");
    }

    #[test]
    fn test_open_missing_device() {
        let err = SerialComm::open("/dev/chamberctl-no-such-port", Duration::from_millis(100))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
