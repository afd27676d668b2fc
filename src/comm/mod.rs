use crate::lock::FileLock;
use crate::EResult;
use parking_lot::MutexGuard;
use std::sync::Arc;

pub mod serial;
pub mod sim;

pub type Communicator = Arc<dyn Comm + Send + Sync>;

/// Held for exactly one request/response exchange
pub struct CommGuard<'a> {
    _file: Option<FileLock<'a>>,
    _local: MutexGuard<'a, ()>,
}

impl<'a> CommGuard<'a> {
    pub fn new(local: MutexGuard<'a, ()>, file: Option<FileLock<'a>>) -> Self {
        Self {
            _file: file,
            _local: local,
        }
    }
}

pub trait Comm {
    /// Serializes transactions on the device, both in-process and across processes
    fn lock(&self) -> EResult<CommGuard<'_>>;
    fn reconnect(&self);
    fn write(&self, buf: &[u8]) -> Result<(), std::io::Error>;
    fn read_exact(&self, buf: &mut [u8]) -> Result<(), std::io::Error>;
    /// Device path, used in messages
    fn device(&self) -> &str;
}
