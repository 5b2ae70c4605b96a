use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::mpsc;

use super::{not_open, Transport, TransportKind};
use crate::{config::Config, error::Error};

enum Inbound {
    Data(Vec<u8>),
    Error(io::ErrorKind),
    Hangup,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    exclusive: bool,
    open_calls: usize,
    fail_open: Option<bool>,
    would_block: usize,
    speed: u32,
    speed_history: Vec<u32>,
}

/// In-memory transport. Everything the port writes shows up on the paired
/// [`MockDevice`], and everything the device sends is read by the port.
pub struct MockTransport {
    kind: TransportKind,
    name: String,
    state: Arc<Mutex<MockState>>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Vec<u8>,
}

/// The modem side of a [`MockTransport`].
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
    to_host: mpsc::UnboundedSender<Inbound>,
    from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    received: Vec<u8>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn pair() -> (Self, MockDevice) {
        Self::pair_with_kind(TransportKind::Tty)
    }

    pub fn pair_with_kind(kind: TransportKind) -> (Self, MockDevice) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (to_host, inbound) = mpsc::unbounded_channel();
        let (outbound, from_host) = mpsc::unbounded_channel();
        (
            Self {
                kind,
                name: String::from("mock0"),
                state: state.clone(),
                inbound,
                outbound,
                pending: Vec::new(),
            },
            MockDevice {
                state,
                to_host,
                from_host,
                received: Vec::new(),
            },
        )
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn device(&self) -> &str {
        &self.name
    }

    async fn open(&mut self, config: &Config) -> Result<(), Error> {
        {
            let mut state = lock(&self.state);
            state.open_calls += 1;
            match state.fail_open.take() {
                Some(true) => return Err(Error::OpenFailedNoDevice(self.name.clone())),
                Some(false) => return Err(Error::OpenFailed(self.name.clone())),
                None => {}
            }
            state.open = true;
            state.exclusive = true;
            state.speed = config.baud;
        }

        // Stale input is flushed on open, like a real TTY
        self.pending.clear();
        while let Ok(msg) = self.inbound.try_recv() {
            if matches!(msg, Inbound::Hangup) {
                break;
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.open = false;
        state.exclusive = false;
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        {
            let mut state = lock(&self.state);
            if !state.open {
                return Err(not_open());
            }
            if state.would_block > 0 {
                state.would_block -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
        }
        self.outbound
            .send(buf.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(buf.len())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => self.pending = data,
                Some(Inbound::Error(kind)) => return Err(kind.into()),
                Some(Inbound::Hangup) | None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn set_exclusive(&mut self, exclusive: bool) -> io::Result<()> {
        lock(&self.state).exclusive = exclusive;
        Ok(())
    }

    fn speed(&self) -> io::Result<u32> {
        let state = lock(&self.state);
        if state.open {
            Ok(state.speed)
        } else {
            Err(not_open())
        }
    }

    fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.speed = baud;
        state.speed_history.push(baud);
        Ok(())
    }
}

impl MockDevice {
    /// Queue bytes for the port to read.
    pub fn send(&self, bytes: impl AsRef<[u8]>) {
        let bytes = bytes.as_ref();
        if !bytes.is_empty() {
            let _ = self.to_host.send(Inbound::Data(bytes.to_vec()));
        }
    }

    /// Make the next read on the port fail with `kind`.
    pub fn send_error(&self, kind: io::ErrorKind) {
        let _ = self.to_host.send(Inbound::Error(kind));
    }

    /// Simulate the device going away.
    pub fn hangup(&self) {
        let _ = self.to_host.send(Inbound::Hangup);
    }

    /// Wait until the port has written bytes ending in `terminator` and
    /// return everything written up to and including it.
    pub async fn read_until(&mut self, terminator: &[u8]) -> Option<Vec<u8>> {
        loop {
            if let Some(pos) = self
                .received
                .windows(terminator.len())
                .position(|w| w == terminator)
            {
                let end = pos + terminator.len();
                return Some(self.received.drain(..end).collect());
            }
            let chunk = self.from_host.recv().await?;
            self.received.extend_from_slice(&chunk);
        }
    }

    /// Everything written by the port that has not been consumed yet.
    pub fn written(&mut self) -> Vec<u8> {
        while let Ok(chunk) = self.from_host.try_recv() {
            self.received.extend_from_slice(&chunk);
        }
        core::mem::take(&mut self.received)
    }

    /// Number of separate write calls that reached the device so far and are
    /// still unconsumed.
    pub fn pending_writes(&mut self) -> usize {
        let mut count = 0;
        let mut chunks = Vec::new();
        while let Ok(chunk) = self.from_host.try_recv() {
            count += 1;
            chunks.push(chunk);
        }
        for chunk in chunks {
            self.received.extend_from_slice(&chunk);
        }
        count
    }

    /// The next `count` writes report would-block.
    pub fn set_would_block(&self, count: usize) {
        lock(&self.state).would_block = count;
    }

    /// The next open fails, as a missing device when `no_device` is set.
    pub fn fail_next_open(&self, no_device: bool) {
        lock(&self.state).fail_open = Some(no_device);
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    pub fn is_exclusive(&self) -> bool {
        lock(&self.state).exclusive
    }

    pub fn open_calls(&self) -> usize {
        lock(&self.state).open_calls
    }

    pub fn speed(&self) -> u32 {
        lock(&self.state).speed
    }

    /// Every speed set through the transport, oldest first.
    pub fn speed_history(&self) -> Vec<u32> {
        lock(&self.state).speed_history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback() {
        let (mut transport, mut device) = MockTransport::pair();
        assert!(transport.try_write(b"AT").is_err());

        transport.open(&Config::new().baud(115_200)).await.unwrap();
        assert!(device.is_open());
        assert!(device.is_exclusive());
        assert_eq!(device.speed(), 115_200);

        assert_eq!(transport.try_write(b"AT\r").unwrap(), 3);
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT\r");

        device.send(b"\r\nOK\r\n");
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"\r\nOK");
        assert_eq!(transport.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"\r\n");

        device.hangup();
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scripted_failures() {
        let (mut transport, device) = MockTransport::pair();
        device.fail_next_open(true);
        assert!(matches!(
            transport.open(&Config::new()).await,
            Err(Error::OpenFailedNoDevice(_))
        ));
        transport.open(&Config::new()).await.unwrap();
        assert_eq!(device.open_calls(), 2);

        device.set_would_block(1);
        assert_eq!(
            transport.try_write(b"A").unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        assert_eq!(transport.try_write(b"A").unwrap(), 1);
    }
}
