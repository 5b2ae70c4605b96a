//! Byte-stream endpoints a port can drive.
//!
//! A [`Transport`] is owned by exactly one port task. Writes are
//! non-blocking attempts that may report [`io::ErrorKind::WouldBlock`];
//! reads wait for readiness and are dropped whenever another event wins the
//! port task's select, so they must be cancel safe.

#[cfg(any(test, feature = "mock"))]
mod mock;
mod tty;
mod unix;

use core::future::Future;
use std::io;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockDevice, MockTransport};
pub use tty::TtyTransport;
pub use unix::UnixTransport;

use crate::{config::Config, error::Error};

/// What kind of endpoint sits behind a transport.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// A serial TTY with line settings
    Tty,
    /// A Unix-domain socket standing in for a TTY
    UnixSocket,
}

pub trait Transport: Send + 'static {
    fn kind(&self) -> TransportKind;

    /// Device path or socket path, used in logs and errors.
    fn device(&self) -> &str;

    /// Acquire the endpoint. Only called while closed.
    fn open(&mut self, config: &Config) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release the endpoint. Pending I/O is discarded.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write as much of `buf` as the endpoint accepts right now.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Wait until bytes are available and read them. `Ok(0)` means hangup.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Take or release the exclusive lock on the endpoint.
    fn set_exclusive(&mut self, _exclusive: bool) -> io::Result<()> {
        Ok(())
    }

    /// Current line speed in baud.
    fn speed(&self) -> io::Result<u32> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn set_speed(&mut self, _baud: u32) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

pub(crate) fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not open")
}
