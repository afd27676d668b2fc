//! Simulated chamber controller: an in-process Modbus RTU slave behind the [`Comm`] interface
//!
//! Used for dry runs (no hardware attached) and in tests. Requests are processed by the rmodbus
//! server frame parser against a holding register context, so the client side goes through the
//! same framing and CRC checks as with a real serial port.
use super::{Comm, CommGuard};
use crate::modbus::Register;
use crate::{modbus::regs, EResult};
use log::warn;
use parking_lot::Mutex;
use rmodbus::server::{context::ModbusContext, ModbusFrame};
use rmodbus::{ModbusFrameBuf, ModbusProto};
use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

const SIM_HOLDINGS: usize = 2048;

type SimContext = ModbusContext<1, 1, 1, SIM_HOLDINGS>;

pub struct SimComm {
    device: String,
    unit: u8,
    context: Mutex<Box<SimContext>>,
    response: Mutex<VecDeque<u8>>,
    busy: Mutex<()>,
    silent: Mutex<BTreeSet<u16>>,
    transactions: AtomicUsize,
}

impl SimComm {
    pub fn new(device: &str, unit: u8) -> Self {
        Self {
            device: device.to_owned(),
            unit,
            context: Mutex::new(<_>::default()),
            response: <_>::default(),
            busy: <_>::default(),
            silent: <_>::default(),
            transactions: AtomicUsize::new(0),
        }
    }
    /// A chamber at rest: 25.0 C, 50.0 %RH, setpoints reached, lights off
    pub fn at_rest(device: &str, unit: u8) -> Self {
        let sim = Self::new(device, unit);
        for (name, value) in [
            (regs::T, 25.0),
            (regs::T_SETPOINT, 25.0),
            (regs::H, 50.0),
            (regs::H_SETPOINT, 50.0),
        ] {
            sim.set_value(name, value);
        }
        sim
    }
    pub fn set_holding(&self, reg: u16, value: u16) {
        if let Err(e) = self.context.lock().set_holding(reg, value) {
            warn!("simulated register {} can not be set: {}", reg, e);
        }
    }
    pub fn holding(&self, reg: u16) -> u16 {
        self.context.lock().get_holding(reg).unwrap_or_default()
    }
    /// Sets a register by its name, the value is scaled as the controller does
    ///
    /// # Panics
    ///
    /// Will panic if the register is unknown or the value does not fit
    pub fn set_value(&self, name: &str, value: f64) {
        let reg = Register::lookup(name).unwrap();
        self.set_holding(reg.address, reg.encode(value).unwrap());
    }
    /// # Panics
    ///
    /// Will panic if the register is unknown
    pub fn value(&self, name: &str) -> f64 {
        let reg = Register::lookup(name).unwrap();
        reg.decode(self.holding(reg.address))
    }
    /// Requests to the register are left unanswered (the client times out)
    pub fn fail_register(&self, reg: u16) {
        self.silent.lock().insert(reg);
    }
    pub fn clear_failures(&self) {
        self.silent.lock().clear();
    }
    /// Number of requests received
    pub fn transactions(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }
    fn process(&self, request: &[u8]) -> EResult<Option<Vec<u8>>> {
        if request.len() > 256 {
            return Ok(None);
        }
        if request.len() >= 4 {
            let reg = u16::from_be_bytes([request[2], request[3]]);
            if self.silent.lock().contains(&reg) {
                return Ok(None);
            }
        }
        let mut buf: ModbusFrameBuf = [0; 256];
        buf[..request.len()].copy_from_slice(request);
        let mut response = Vec::new();
        let mut frame = ModbusFrame::new(self.unit, &buf, ModbusProto::Rtu, &mut response);
        if frame.parse().is_err() {
            warn!("broken frame received on {}", self.device);
            return Ok(None);
        }
        if frame.processing_required {
            let result = if frame.readonly {
                frame.process_read(&**self.context.lock())
            } else {
                frame.process_write(&mut **self.context.lock())
            };
            if let Err(e) = result {
                warn!("frame processing error on {}: {}", self.device, e);
                return Ok(None);
            }
        }
        if frame.response_required {
            frame.finalize_response()?;
            Ok(Some(response))
        } else {
            Ok(None)
        }
    }
}

impl Comm for SimComm {
    fn lock(&self) -> EResult<CommGuard<'_>> {
        Ok(CommGuard::new(self.busy.lock(), None))
    }
    fn reconnect(&self) {
        self.response.lock().clear();
    }
    fn write(&self, buf: &[u8]) -> Result<(), io::Error> {
        self.transactions.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.response.lock();
        pending.clear();
        if let Some(response) = self
            .process(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        {
            pending.extend(response);
        }
        Ok(())
    }
    fn read_exact(&self, buf: &mut [u8]) -> Result<(), io::Error> {
        let mut pending = self.response.lock();
        if pending.len() < buf.len() {
            pending.clear();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "operation timed out",
            ));
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(pending.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }
    fn device(&self) -> &str {
        &self.device
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_at_rest() {
        let sim = SimComm::at_rest("/dev/sim0", 1);
        assert_eq!(sim.value(regs::T), 25.0);
        assert_eq!(sim.value(regs::H_SETPOINT), 50.0);
        assert_eq!(sim.holding(300), 250);
        assert_eq!(sim.value(regs::TIME_SIGNAL), 0.0);
        assert_eq!(sim.transactions(), 0);
    }

    #[test]
    fn test_silent_register() {
        let sim = SimComm::new("/dev/sim0", 1);
        sim.fail_register(100);
        // unit 1, FC03, reg 100, count 1
        let mut request = vec![0x01, 0x03, 0x00, 0x64, 0x00, 0x01];
        let crc = rtu_crc(&request);
        request.extend(crc.to_le_bytes());
        sim.write(&request).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(
            sim.read_exact(&mut buf).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        sim.clear_failures();
        sim.write(&request).unwrap();
        let mut buf = [0u8; 7];
        sim.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..3], &[0x01, 0x03, 0x02]);
    }

    #[test]
    fn test_response_read_in_parts() {
        let sim = SimComm::at_rest("/dev/sim0", 1);
        // unit 1, FC03, reg 300, count 1
        let mut request = vec![0x01, 0x03, 0x01, 0x2c, 0x00, 0x01];
        let crc = rtu_crc(&request);
        request.extend(crc.to_le_bytes());
        sim.write(&request).unwrap();
        let mut head = [0u8; 3];
        sim.read_exact(&mut head).unwrap();
        assert_eq!(head, [0x01, 0x03, 0x02]);
        let mut rest = [0u8; 4];
        sim.read_exact(&mut rest).unwrap();
        assert_eq!(&rest[..2], &250u16.to_be_bytes());
        // nothing left
        assert_eq!(
            sim.read_exact(&mut head).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
    }

    fn rtu_crc(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for b in data {
            crc ^= u16::from(*b);
            for _ in 0..8 {
                if crc & 1 == 0 {
                    crc >>= 1;
                } else {
                    crc = (crc >> 1) ^ 0xA001;
                }
            }
        }
        crc
    }
}
