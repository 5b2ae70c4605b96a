use std::io;

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, FlowControl, SerialPort, SerialPortBuilderExt, SerialStream};

use super::{not_open, Transport, TransportKind};
use crate::{
    config::{Config, DataBits, Parity, StopBits},
    error::Error,
};

/// A serial TTY driven through `tokio-serial`.
pub struct TtyTransport {
    path: String,
    stream: Option<SerialStream>,
}

impl TtyTransport {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            stream: None,
        }
    }

    fn stream(&mut self) -> io::Result<&mut SerialStream> {
        self.stream.as_mut().ok_or_else(not_open)
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => Self::Five,
            DataBits::Six => Self::Six,
            DataBits::Seven => Self::Seven,
            DataBits::Eight => Self::Eight,
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => Self::None,
            Parity::Odd => Self::Odd,
            Parity::Even => Self::Even,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => Self::One,
            StopBits::Two => Self::Two,
        }
    }
}

fn is_missing_device(e: &tokio_serial::Error) -> bool {
    matches!(
        e.kind(),
        tokio_serial::ErrorKind::NoDevice | tokio_serial::ErrorKind::Io(io::ErrorKind::NotFound)
    )
}

impl Transport for TtyTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tty
    }

    fn device(&self) -> &str {
        &self.path
    }

    async fn open(&mut self, config: &Config) -> Result<(), Error> {
        let flow_control = if config.rts_cts {
            FlowControl::Hardware
        } else {
            FlowControl::None
        };

        let mut stream = tokio_serial::new(&self.path, config.baud)
            .data_bits(config.data_bits.into())
            .parity(config.parity.into())
            .stop_bits(config.stop_bits.into())
            .flow_control(flow_control)
            .open_native_async()
            .map_err(|e| {
                if is_missing_device(&e) {
                    Error::OpenFailedNoDevice(format!("{}: {}", self.path, e))
                } else {
                    Error::OpenFailed(format!("{}: {}", self.path, e))
                }
            })?;

        #[cfg(unix)]
        stream
            .set_exclusive(true)
            .map_err(|e| Error::OpenFailed(format!("{}: could not lock: {}", self.path, e)))?;

        // Drop whatever the device queued up while nobody was listening
        if let Err(e) = stream.clear(ClearBuffer::All) {
            warn!("{}: could not flush serial port: {}", self.path, e);
        }

        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            #[cfg(unix)]
            let _ = stream.set_exclusive(false);
            let _ = stream.clear(ClearBuffer::All);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        stream
            .write(buf)
            .now_or_never()
            .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf).await
    }

    fn set_exclusive(&mut self, exclusive: bool) -> io::Result<()> {
        #[cfg(unix)]
        self.stream()?.set_exclusive(exclusive)?;
        #[cfg(not(unix))]
        let _ = exclusive;
        Ok(())
    }

    fn speed(&self) -> io::Result<u32> {
        let stream = self.stream.as_ref().ok_or_else(not_open)?;
        Ok(stream.baud_rate()?)
    }

    fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        Ok(self.stream()?.set_baud_rate(baud)?)
    }
}
