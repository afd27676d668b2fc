use crate::comm::Comm;
use crate::{EResult, Error};
use log::trace;
use rmodbus::{client::ModbusRequest, guess_response_frame_len, ModbusProto};

pub mod regs;

pub use regs::{Register, REGISTER_MAP};

// unit id, function and the byte count (or the exception code) are enough to guess the frame
// length
const RTU_HEADER_LEN: usize = 3;

fn comm_err(comm: &dyn Comm, e: std::io::Error) -> Error {
    Error::communication(format!("{}: {}", comm.device(), e))
}

/// One request/response exchange, the device lock is held for its duration only
fn exchange(comm: &dyn Comm, request: &[u8]) -> EResult<Vec<u8>> {
    let _lock = comm.lock()?;
    comm.write(request).map_err(|e| comm_err(comm, e))?;
    let mut buf = [0u8; RTU_HEADER_LEN];
    comm.read_exact(&mut buf).map_err(|e| comm_err(comm, e))?;
    let mut response = buf.to_vec();
    let len = usize::from(guess_response_frame_len(&buf, ModbusProto::Rtu)?);
    if len > RTU_HEADER_LEN {
        let mut rest = vec![0u8; len - RTU_HEADER_LEN];
        comm.read_exact(&mut rest).map_err(|e| comm_err(comm, e))?;
        response.extend(rest);
    }
    trace!("{} request {:x?} response {:x?}", comm.device(), request, response);
    Ok(response)
}

fn check_response(comm: &dyn Comm, res: Result<(), rmodbus::ErrorKind>) -> EResult<()> {
    if let Err(e) = res {
        if e == rmodbus::ErrorKind::UnknownError {
            comm.reconnect();
        }
        return Err(Error::communication(format!("{}: {}", comm.device(), e)));
    }
    Ok(())
}

pub fn read_holding(comm: &dyn Comm, unit: u8, reg: u16) -> EResult<u16> {
    let mut mreq = ModbusRequest::new(unit, ModbusProto::Rtu);
    let mut request = Vec::new();
    mreq.generate_get_holdings(reg, 1, &mut request)?;
    let response = exchange(comm, &request)?;
    let mut data: Vec<u16> = Vec::new();
    check_response(comm, mreq.parse_u16(&response, &mut data))?;
    data.first().copied().ok_or_else(|| {
        Error::communication(format!("{}: empty response for register {}", comm.device(), reg))
    })
}

pub fn write_holding(comm: &dyn Comm, unit: u8, reg: u16, value: u16) -> EResult<()> {
    let mut mreq = ModbusRequest::new(unit, ModbusProto::Rtu);
    let mut request = Vec::new();
    mreq.generate_set_holding(reg, value, &mut request)?;
    let response = exchange(comm, &request)?;
    check_response(comm, mreq.parse_ok(&response))
}
