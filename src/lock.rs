use std::io;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};

/// Exclusive advisory lock (flock) held on an open file until dropped
///
/// flock locks the inode, so every process which has the same file (or device node) open
/// competes for the same lock, no matter which path it was opened with.
pub struct FileLock<'a> {
    fd: RawFd,
    _owner: PhantomData<&'a ()>,
}

impl<'a> FileLock<'a> {
    /// Blocks until the lock is acquired
    pub fn exclusive<F: AsRawFd>(file: &'a F) -> io::Result<Self> {
        Self::exclusive_fd(file.as_raw_fd())
    }
    /// The caller must keep `fd` open until the lock is dropped
    pub(crate) fn exclusive_fd(fd: RawFd) -> io::Result<Self> {
        loop {
            let res = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if res == 0 {
                return Ok(Self {
                    fd,
                    _owner: PhantomData,
                });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}
