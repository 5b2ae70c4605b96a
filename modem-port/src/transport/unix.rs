use std::io;

use tokio::{io::AsyncReadExt, net::UnixStream};

use super::{not_open, Transport, TransportKind};
use crate::{config::Config, error::Error};

/// A Unix-domain socket standing in for a serial device, as exported by
/// modem emulators and some virtualised modems.
pub struct UnixTransport {
    path: String,
    stream: Option<UnixStream>,
}

impl UnixTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stream: None,
        }
    }
}

impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::UnixSocket
    }

    fn device(&self) -> &str {
        &self.path
    }

    async fn open(&mut self, _config: &Config) -> Result<(), Error> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::OpenFailedNoDevice(format!("{}: {}", self.path, e))
            } else {
                Error::OpenFailed(format!("{}: {}", self.path, e))
            }
        })?;
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.as_ref().ok_or_else(not_open)?.try_write(buf)
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.as_mut().ok_or_else(not_open)?.read(buf).await
    }
}
