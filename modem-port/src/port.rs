//! The port task: single owner of a transport and everything layered on it.

use core::time::Duration;
use std::io;

use regex::bytes::Regex;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::ResponseBuffer,
    config::Config,
    error::{Error, SendFailure},
    helpers::LossyStr,
    parser::{ParserVerdict, ResponseParser},
    queue::{CommandQueue, Transaction, TxState},
    reply_cache::ReplyCache,
    transport::{Transport, TransportKind},
    urc::{UrcCallback, UrcDispatcher},
};

/// Bytes pulled from the transport per read.
const READ_CHUNK: usize = 2048;

/// Consecutive failed reads after which the device is considered gone.
const MAX_READ_ERRORS: u32 = 3;

/// Commands longer than this are logged by length only.
const MAX_LOGGED_COMMAND: usize = 50;

/// Timeout used for the commands queued when the port is physically opened.
pub(crate) const INIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Notifications about the health of a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A command timed out, or could not be written. Carries the number of
    /// consecutive timeouts so far.
    TimedOut(u32),
    /// Spew control truncated the response buffer. Carries the buffer as it
    /// was before truncation.
    BufferFull(Vec<u8>),
    /// The port was closed for good, e.g. because the device hung up.
    ForcedClose,
}

/// Snapshot of the port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortStatus {
    pub open_count: u32,
    pub consecutive_timeouts: u32,
    pub forced_closed: bool,
    pub connected: bool,
    /// Transactions queued or in flight.
    pub queued: usize,
}

pub(crate) enum Request {
    Open(oneshot::Sender<Result<(), Error>>),
    Close,
    ForceClose,
    Submit {
        tx: Transaction,
        run_next: bool,
    },
    AddUrc {
        pattern: Regex,
        callback: Option<UrcCallback>,
    },
    EnableUrc {
        pattern: String,
        enabled: bool,
    },
    SetParser(Box<dyn ResponseParser>),
    SetInitSequence(Vec<Vec<u8>>),
    SetConnected(bool),
    Flash {
        duration: Duration,
        ignore_errors: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Reopen {
        delay: Duration,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Status(oneshot::Sender<PortStatus>),
}

enum Event {
    Request(Option<Request>),
    Read(io::Result<usize>),
    SendStep,
    ResponseTimeout,
    Cancelled,
    FlashDone,
    ReopenDue,
}

struct FlashOp {
    at: Instant,
    restore: Option<u32>,
    reply: oneshot::Sender<Result<(), Error>>,
}

struct ReopenOp {
    at: Instant,
    count: u32,
    reply: oneshot::Sender<Result<(), Error>>,
}

pub(crate) struct PortTask<T> {
    transport: T,
    config: Config,
    requests: mpsc::UnboundedReceiver<Request>,
    events: broadcast::Sender<PortEvent>,

    queue: CommandQueue,
    buffer: ResponseBuffer,
    cache: ReplyCache,
    urc: UrcDispatcher,
    parser: Option<Box<dyn ResponseParser>>,
    init_sequence: Vec<Vec<u8>>,
    read_buf: Vec<u8>,

    open_count: u32,
    forced_closed: bool,
    connected: bool,
    consecutive_timeouts: u32,
    read_errors: u32,

    /// When the next byte (or retry) of the head command is due.
    send_at: Option<Instant>,
    /// When the in-flight command times out.
    deadline: Option<Instant>,
    flash: Option<FlashOp>,
    reopen: Option<ReopenOp>,
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => core::future::pending().await,
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => core::future::pending().await,
    }
}

/// Set the line speed, retrying a few times while the driver is busy.
async fn set_speed<T: Transport>(transport: &mut T, baud: u32) -> io::Result<()> {
    let mut attempts = 4;
    loop {
        match transport.set_speed(baud) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && attempts > 1 => {
                attempts -= 1;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            result => return result,
        }
    }
}

impl<T: Transport> PortTask<T> {
    pub fn new(
        transport: T,
        config: Config,
        requests: mpsc::UnboundedReceiver<Request>,
        events: broadcast::Sender<PortEvent>,
    ) -> Self {
        Self {
            transport,
            buffer: ResponseBuffer::new(config.buffer_size, config.spew_control),
            config,
            requests,
            events,
            queue: CommandQueue::default(),
            cache: ReplyCache::default(),
            urc: UrcDispatcher::default(),
            parser: None,
            init_sequence: Vec::new(),
            read_buf: vec![0; READ_CHUNK],
            open_count: 0,
            forced_closed: false,
            connected: false,
            consecutive_timeouts: 0,
            read_errors: 0,
            send_at: None,
            deadline: None,
            flash: None,
            reopen: None,
        }
    }

    pub async fn run(mut self) {
        loop {
            match self.next_event().await {
                Event::Request(Some(request)) => self.handle_request(request).await,
                Event::Request(None) => break,
                Event::Read(result) => self.on_read(result),
                Event::SendStep => {
                    self.send_at = None;
                    self.pump();
                }
                Event::ResponseTimeout => self.on_response_timeout(),
                Event::Cancelled => self.on_cancelled(),
                Event::FlashDone => self.finish_flash().await,
                Event::ReopenDue => self.finish_reopen().await,
            }
        }

        if self.open_count > 0 {
            self.shutdown(SendFailure::PortClosed);
        }
        debug!("({}) port task finished", self.transport.device());
    }

    async fn next_event(&mut self) -> Event {
        let reading = self.transport.is_open() && !self.connected;
        let awaiting = self
            .queue
            .head()
            .filter(|head| head.state == TxState::AwaitingResponse);
        let cancel = awaiting.and_then(|head| head.cancel.clone());
        let deadline = awaiting.and(self.deadline);
        let send_at = self.send_at;
        let flash_at = self.flash.as_ref().map(|f| f.at);
        let reopen_at = self.reopen.as_ref().map(|r| r.at);

        tokio::select! {
            biased;

            request = self.requests.recv() => Event::Request(request),
            _ = cancelled(cancel) => Event::Cancelled,
            _ = sleep_until(deadline) => Event::ResponseTimeout,
            _ = sleep_until(send_at) => Event::SendStep,
            _ = sleep_until(flash_at) => Event::FlashDone,
            _ = sleep_until(reopen_at) => Event::ReopenDue,
            result = self.transport.read(&mut self.read_buf), if reading => Event::Read(result),
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Open(reply) => {
                let _ = reply.send(self.open().await);
            }
            Request::Close => self.close(),
            Request::ForceClose => self.force_close(),
            Request::Submit { tx, run_next } => self.submit(tx, run_next),
            Request::AddUrc { pattern, callback } => self.urc.add(pattern, callback),
            Request::EnableUrc { pattern, enabled } => {
                if !self.urc.enable(&pattern, enabled) {
                    debug!("No unsolicited handler for {}", pattern);
                }
            }
            Request::SetParser(parser) => self.parser = Some(parser),
            Request::SetInitSequence(commands) => self.init_sequence = commands,
            Request::SetConnected(connected) => self.set_connected(connected),
            Request::Flash {
                duration,
                ignore_errors,
                reply,
            } => self.start_flash(duration, ignore_errors, reply).await,
            Request::Reopen { delay, reply } => self.start_reopen(delay, reply),
            Request::Status(reply) => {
                let _ = reply.send(PortStatus {
                    open_count: self.open_count,
                    consecutive_timeouts: self.consecutive_timeouts,
                    forced_closed: self.forced_closed,
                    connected: self.connected,
                    queued: self.queue.len(),
                });
            }
        }
    }

    fn emit(&self, event: PortEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn is_open(&self) -> bool {
        self.open_count > 0 && !self.forced_closed
    }

    // Lifecycle

    async fn open(&mut self) -> Result<(), Error> {
        let device = self.transport.device().to_string();
        if self.forced_closed {
            return Err(Error::OpenFailed(format!(
                "{device}: it has been forced close"
            )));
        }
        if self.reopen.is_some() {
            return Err(Error::OpenFailed(format!(
                "{device}: reopen operation in progress"
            )));
        }

        if self.open_count == 0 {
            debug!("({}) opening serial port...", device);
            if let Err(e) = self.transport.open(&self.config).await {
                warn!("({}) could not open serial device: {}", device, e);
                return Err(e);
            }
            self.read_errors = 0;
            self.buffer.clear();
        }

        self.open_count += 1;
        debug!("({}) device open count is {} (open)", device, self.open_count);

        if self.open_count == 1 && !self.init_sequence.is_empty() {
            debug!("({}) running init sequence...", device);
            for command in self.init_sequence.clone() {
                let (reply, _) = oneshot::channel();
                let tx = Transaction::new(command, INIT_COMMAND_TIMEOUT, false, None, reply);
                self.submit(tx, false);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.forced_closed {
            return;
        }
        if self.open_count == 0 {
            warn!("({}) close on a port that is not open", self.transport.device());
            return;
        }

        self.open_count -= 1;
        debug!(
            "({}) device open count is {} (close)",
            self.transport.device(),
            self.open_count
        );
        if self.open_count == 0 {
            self.shutdown(SendFailure::PortClosed);
        }
    }

    /// Physical teardown. Every pending transaction fails with `reason`.
    fn shutdown(&mut self, reason: SendFailure) {
        debug!("({}) closing serial port...", self.transport.device());

        if let Some(flash) = self.flash.take() {
            let _ = flash.reply.send(Err(Error::Cancelled));
        }
        self.connected = false;
        self.transport.close();
        self.buffer.clear();
        self.send_at = None;
        self.deadline = None;
        self.read_errors = 0;
        if !self.queue.is_empty() {
            debug!(
                "({}) failing {} pending commands: {}",
                self.transport.device(),
                self.queue.len(),
                reason
            );
            self.queue.fail_all(|| reason.clone().into());
        }

        debug!("({}) serial port closed", self.transport.device());
    }

    fn force_close(&mut self) {
        if self.forced_closed {
            return;
        }
        error!("({}) forced to close port", self.transport.device());

        if let Some(reopen) = self.reopen.take() {
            let _ = reopen.reply.send(Err(Error::Cancelled));
        }
        self.open_count = 0;
        self.shutdown(SendFailure::ForcedClosed);
        self.forced_closed = true;
        self.emit(PortEvent::ForcedClose);
    }

    fn set_connected(&mut self, connected: bool) {
        if self.connected == connected {
            return;
        }
        self.connected = connected;
        if !self.transport.is_open() {
            return;
        }

        // Passthrough users (pppd) need the device unlocked
        if let Err(e) = self.transport.set_exclusive(!connected) {
            warn!(
                "({}) could not {} serial port lock: {}",
                self.transport.device(),
                if connected { "drop" } else { "re-acquire" },
                e
            );
        }
        if !connected {
            self.pump();
        }
    }

    async fn start_flash(
        &mut self,
        duration: Duration,
        ignore_errors: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        if !self.is_open() {
            let _ = reply.send(Err(SendFailure::NotOpen.into()));
            return;
        }
        if self.flash.is_some() {
            let _ = reply.send(Err(Error::InProgress("flash")));
            return;
        }
        if !self.config.flash_ok || self.transport.kind() != TransportKind::Tty {
            let _ = reply.send(Ok(()));
            return;
        }

        let restore = match self.transport.speed() {
            Ok(speed) => Some(speed),
            Err(e) if ignore_errors => {
                debug!("({}) ignoring speed read error: {}", self.transport.device(), e);
                None
            }
            Err(e) => {
                let _ = reply.send(Err(Error::FlashFailed(format!(
                    "could not read current speed: {e}"
                ))));
                return;
            }
        };

        if let Err(e) = set_speed(&mut self.transport, 0).await {
            if !ignore_errors {
                let _ = reply.send(Err(Error::FlashFailed(format!(
                    "could not drop speed: {e}"
                ))));
                return;
            }
            debug!("({}) ignoring speed drop error: {}", self.transport.device(), e);
        }

        self.flash = Some(FlashOp {
            at: Instant::now() + duration,
            restore,
            reply,
        });
    }

    async fn finish_flash(&mut self) {
        let Some(flash) = self.flash.take() else {
            return;
        };

        let result = match flash.restore {
            Some(speed) => set_speed(&mut self.transport, speed)
                .await
                .map_err(|e| Error::FlashFailed(format!("could not restore speed: {e}"))),
            None => Err(Error::FlashFailed(String::from(
                "Failed to retrieve current speed",
            ))),
        };
        let _ = flash.reply.send(result);
    }

    fn start_reopen(&mut self, delay: Duration, reply: oneshot::Sender<Result<(), Error>>) {
        if self.forced_closed {
            let _ = reply.send(Err(Error::OpenFailed(format!(
                "{}: serial port has been forced close",
                self.transport.device()
            ))));
            return;
        }
        if self.reopen.is_some() {
            let _ = reply.send(Err(Error::InProgress("reopen")));
            return;
        }

        let count = self.open_count;
        debug!("({}) reopening port ({})", self.transport.device(), count);
        for _ in 0..count {
            self.close();
        }
        self.reopen = Some(ReopenOp {
            at: Instant::now() + delay,
            count,
            reply,
        });
    }

    async fn finish_reopen(&mut self) {
        let Some(reopen) = self.reopen.take() else {
            return;
        };

        let mut result = Ok(());
        for i in 0..reopen.count {
            if let Err(e) = self.open().await {
                result = Err(Error::OpenFailed(format!("Couldn't reopen port ({i}): {e}")));
                break;
            }
        }

        // A half-done reopen leaves the open count meaningless
        if result.is_err() {
            self.force_close();
        }
        let _ = reopen.reply.send(result);
    }

    // Scheduling

    fn submit(&mut self, tx: Transaction, run_next: bool) {
        if !self.is_open() {
            tx.complete(Err(SendFailure::NotOpen.into()));
            return;
        }
        if self.connected {
            tx.complete(Err(SendFailure::Connected.into()));
            return;
        }
        if self.parser.is_none() {
            tx.complete(Err(Error::NoParser));
            return;
        }
        if !tx.allow_cached {
            self.cache.evict(&tx.command);
        }

        self.queue.push(tx, run_next);
        self.pump();
    }

    /// Pop the head and hand it its result.
    fn finish_head(&mut self, result: Result<Vec<u8>, Error>) {
        self.deadline = None;
        self.send_at = None;
        if let Some(head) = self.queue.pop() {
            head.complete(result);
        }
    }

    /// Move the queue along as far as possible without waiting.
    fn pump(&mut self) {
        while let Some(head) = self.queue.head() {
            match head.state {
                TxState::AwaitingResponse => return,
                TxState::Sending if self.send_at.is_some() => return,
                TxState::Sending => {
                    if !self.write_step() {
                        return;
                    }
                }
                TxState::Queued => self.start_head(),
            }
        }
    }

    fn start_head(&mut self) {
        let budget = self.config.write_retry_budget();
        let Some(head) = self.queue.head_mut() else {
            return;
        };

        if head.is_cancelled() {
            self.finish_head(Err(Error::Cancelled));
            return;
        }
        if self.connected {
            self.finish_head(Err(SendFailure::Connected.into()));
            return;
        }

        if head.allow_cached {
            if let Some(cached) = self.cache.get(&head.command) {
                let cached = cached.to_vec();
                if !self.buffer.is_empty() {
                    warn!(
                        "({}) response buffer not empty when using cached reply, cleaning up {} bytes",
                        self.transport.device(),
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                self.finish_head(Ok(cached));
                return;
            }
        }

        head.state = TxState::Sending;
        head.retries_left = budget;
        if head.command.len() > MAX_LOGGED_COMMAND {
            debug!(
                "({}) --> ({} bytes)",
                self.transport.device(),
                head.command.len()
            );
        } else {
            debug!(
                "({}) --> {:?}",
                self.transport.device(),
                LossyStr(&head.command)
            );
        }
    }

    /// Write the next piece of the head command. Returns true when the queue
    /// can be pumped further right away.
    fn write_step(&mut self) -> bool {
        let send_delay = self.config.send_delay;
        let Some(head) = self.queue.head_mut() else {
            return false;
        };

        let remaining = head.remaining();
        if !remaining.is_empty() {
            let chunk = if send_delay.is_zero() {
                remaining
            } else {
                &remaining[..1]
            };

            match self.transport.try_write(chunk) {
                Ok(n) if n > 0 => head.written += n,
                Ok(_) => return self.write_blocked(),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return self.write_blocked(),
                Err(e) => {
                    warn!("({}) write failed: {}", self.transport.device(), e);
                    self.finish_head(Err(SendFailure::Write(e.to_string()).into()));
                    return true;
                }
            }
        }

        if head.written < head.command.len() {
            if send_delay.is_zero() {
                return true;
            }
            self.send_at = Some(Instant::now() + send_delay);
            return false;
        }

        head.state = TxState::AwaitingResponse;
        if head.is_cancelled() {
            self.finish_head(Err(Error::Cancelled));
            return true;
        }
        self.deadline = Some(Instant::now() + head.timeout);

        // Anything that arrived while the command was being written
        self.process_buffer();
        true
    }

    fn write_blocked(&mut self) -> bool {
        let Some(head) = self.queue.head_mut() else {
            return false;
        };

        head.retries_left = head.retries_left.saturating_sub(1);
        if head.retries_left > 0 {
            let retry = self.config.send_delay.max(Duration::from_millis(1));
            self.send_at = Some(Instant::now() + retry);
            return false;
        }

        self.consecutive_timeouts += 1;
        warn!(
            "({}) giving up on write after too many retries",
            self.transport.device()
        );
        self.finish_head(Err(SendFailure::WriteRetriesExhausted.into()));
        self.emit(PortEvent::TimedOut(self.consecutive_timeouts));
        true
    }

    fn on_response_timeout(&mut self) {
        if !matches!(self.queue.head(), Some(head) if head.state == TxState::AwaitingResponse) {
            self.deadline = None;
            return;
        }

        self.consecutive_timeouts += 1;
        debug!(
            "({}) command timed out ({} in a row)",
            self.transport.device(),
            self.consecutive_timeouts
        );
        self.finish_head(Err(Error::ResponseTimeout));
        self.emit(PortEvent::TimedOut(self.consecutive_timeouts));
        self.pump();
    }

    fn on_cancelled(&mut self) {
        if !matches!(self.queue.head(), Some(head) if head.state == TxState::AwaitingResponse) {
            return;
        }
        debug!("({}) waiting for the reply cancelled", self.transport.device());
        self.finish_head(Err(Error::Cancelled));
        self.pump();
    }

    // Response assembly

    fn on_read(&mut self, result: io::Result<usize>) {
        let n = match result {
            Ok(0) => {
                debug!("({}) unexpected port hangup!", self.transport.device());
                self.buffer.clear();
                self.force_close();
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("({}) read error: {}", self.transport.device(), e);
                self.buffer.clear();
                self.read_errors += 1;
                if self.read_errors >= MAX_READ_ERRORS {
                    self.force_close();
                }
                return;
            }
        };
        self.read_errors = 0;

        let data = &self.read_buf[..n];
        debug!("({}) <-- {:?}", self.transport.device(), LossyStr(data));
        if let Some(overrun) = self.buffer.extend(data) {
            warn!(
                "({}) response buffer full, dropping {} bytes",
                self.transport.device(),
                overrun.len() - self.buffer.len()
            );
            self.emit(PortEvent::BufferFull(overrun));
        }

        // Nothing is parsed until the command is completely written
        if matches!(self.queue.head(), Some(head) if head.state == TxState::Sending) {
            return;
        }
        self.process_buffer();
        self.pump();
    }

    /// Run unsolicited handlers and the response parser over the buffer.
    fn process_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        if let Some(parser) = self.parser.as_mut() {
            parser.preprocess(self.buffer.as_mut_vec());
        }
        let unsolicited = self.urc.dispatch(&mut self.buffer);
        if self.buffer.is_empty() {
            return;
        }

        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        // An unsolicited code in front of the echo hides it from the first pass
        if unsolicited > 0 {
            parser.preprocess(self.buffer.as_mut_vec());
        }
        let result = match parser.parse(&self.buffer) {
            ParserVerdict::Incomplete => return,
            ParserVerdict::Matched(payload) => Ok(payload),
            ParserVerdict::MatchedError(e) => Err(Error::Parse(e)),
        };
        let consumed = self.buffer.take();
        self.consecutive_timeouts = 0;

        match self.queue.head() {
            Some(head) if head.state == TxState::AwaitingResponse => {
                if let (true, Ok(payload)) = (head.allow_cached, &result) {
                    self.cache.insert(&head.command, payload);
                }
                self.finish_head(result);
            }
            _ => debug!(
                "({}) discarding reply without a pending command: {:?}",
                self.transport.device(),
                LossyStr(&consumed)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handle::PortHandle,
        parser::AtParser,
        transport::{MockDevice, MockTransport},
    };
    use env_logger::Env;
    use regex::bytes::Captures;
    use std::sync::Once;
    use tokio::time::sleep;

    static INIT: Once = Once::new();

    fn setup_log() {
        INIT.call_once(|| {
            env_logger::Builder::from_env(Env::default().default_filter_or("info"))
                .is_test(true)
                .init();
        });
    }

    async fn open_port(config: Config) -> (PortHandle, MockDevice) {
        setup_log();
        let (transport, device) = MockTransport::pair();
        let port = PortHandle::spawn(transport, config).unwrap();
        port.set_response_parser(AtParser::new());
        port.open().await.unwrap();
        (port, device)
    }

    #[tokio::test(start_paused = true)]
    async fn command_round_trip() {
        let (port, mut device) = open_port(Config::new()).await;

        let reply = port.submit(b"AT+CSQ\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT+CSQ\r");
        device.send(b"AT+CSQ\r\r\n+CSQ: 20,99\r\n\r\nOK\r\n");

        assert_eq!(reply.await.unwrap(), b"+CSQ: 20,99");
    }

    #[tokio::test(start_paused = true)]
    async fn replies_complete_in_submission_order() {
        let (port, mut device) = open_port(Config::new()).await;

        let first = port.submit(b"ATA\r".to_vec(), Duration::from_secs(3), false, false, None);
        let second = port.submit(b"ATB\r".to_vec(), Duration::from_secs(3), false, false, None);
        let third = port.submit(b"ATC\r".to_vec(), Duration::from_secs(3), false, false, None);

        for (cmd, answer) in [
            (&b"ATA\r"[..], "a"),
            (&b"ATB\r"[..], "b"),
            (&b"ATC\r"[..], "c"),
        ] {
            assert_eq!(device.read_until(b"\r").await.unwrap(), cmd);
            device.send(format!("\r\n{answer}\r\n\r\nOK\r\n"));
        }

        assert_eq!(first.await.unwrap(), b"a");
        assert_eq!(second.await.unwrap(), b"b");
        assert_eq!(third.await.unwrap(), b"c");
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_command_in_flight() {
        let (port, mut device) = open_port(Config::new()).await;

        let first = port.submit(b"ATA\r".to_vec(), Duration::from_secs(3), false, false, None);
        let second = port.submit(b"ATB\r".to_vec(), Duration::from_secs(3), false, false, None);

        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATA\r");
        sleep(Duration::from_millis(100)).await;
        assert!(device.written().is_empty());

        device.send(b"\r\nOK\r\n");
        assert!(first.await.is_ok());
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATB\r");
        device.send(b"\r\nOK\r\n");
        assert!(second.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn run_next_overtakes_queued_commands() {
        let (port, mut device) = open_port(Config::new()).await;

        let first = port.submit(b"ATA\r".to_vec(), Duration::from_secs(3), false, false, None);
        let second = port.submit(b"ATB\r".to_vec(), Duration::from_secs(3), false, false, None);
        let urgent = port.submit(b"+++".to_vec(), Duration::from_secs(3), false, true, None);

        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATA\r");
        device.send(b"\r\nOK\r\n");
        first.await.unwrap();

        assert_eq!(device.read_until(b"+++").await.unwrap(), b"+++");
        device.send(b"\r\nOK\r\n");
        urgent.await.unwrap();

        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATB\r");
        device.send(b"\r\nOK\r\n");
        second.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cached_reply_skips_transport() {
        let (port, mut device) = open_port(Config::new()).await;

        let reply = port.submit(b"ATI\r".to_vec(), Duration::from_secs(3), true, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\nModem 1.0\r\n\r\nOK\r\n");
        assert_eq!(reply.await.unwrap(), b"Modem 1.0");

        let cached = port.submit(b"ATI\r".to_vec(), Duration::from_secs(3), true, false, None);
        assert_eq!(cached.await.unwrap(), b"Modem 1.0");
        assert!(device.written().is_empty());

        // A non-cached request evicts the entry
        let fresh = port.submit(b"ATI\r".to_vec(), Duration::from_secs(3), false, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\nModem 2.0\r\n\r\nOK\r\n");
        assert_eq!(fresh.await.unwrap(), b"Modem 2.0");

        let uncached = port.submit(b"ATI\r".to_vec(), Duration::from_secs(3), true, false, None);
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATI\r");
        device.send(b"\r\nModem 3.0\r\n\r\nOK\r\n");
        assert_eq!(uncached.await.unwrap(), b"Modem 3.0");
    }

    #[tokio::test(start_paused = true)]
    async fn error_replies_are_not_cached() {
        let (port, mut device) = open_port(Config::new()).await;

        let reply = port.submit(b"AT+CPIN?\r".to_vec(), Duration::from_secs(3), true, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\n+CME ERROR: 10\r\n");
        assert!(matches!(
            reply.await,
            Err(Error::Parse(crate::error::ResponseError::CmeError(10)))
        ));

        let again = port.submit(b"AT+CPIN?\r".to_vec(), Duration::from_secs(3), true, false, None);
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT+CPIN?\r");
        device.send(b"\r\n+CPIN: READY\r\n\r\nOK\r\n");
        assert_eq!(again.await.unwrap(), b"+CPIN: READY");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_until_a_reply_arrives() {
        let (port, mut device) = open_port(Config::new()).await;
        let mut events = port.subscribe();

        for n in 1..=3 {
            let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(1), false, false, None);
            device.read_until(b"\r").await.unwrap();
            assert!(matches!(reply.await, Err(Error::ResponseTimeout)));
            assert_eq!(events.recv().await.unwrap(), PortEvent::TimedOut(n));
        }
        assert_eq!(port.consecutive_timeouts().await.unwrap(), 3);

        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(1), false, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\nOK\r\n");
        reply.await.unwrap();
        assert_eq!(port.consecutive_timeouts().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_reply() {
        let (port, mut device) = open_port(Config::new()).await;

        let token = CancellationToken::new();
        let reply = port.submit(
            b"ATD*99#\r".to_vec(),
            Duration::from_secs(30),
            false,
            false,
            Some(token.clone()),
        );
        let next = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);

        device.read_until(b"\r").await.unwrap();
        token.cancel();
        // The late reply must not complete anything twice
        device.send(b"\r\nOK\r\n");

        assert!(matches!(reply.await, Err(Error::Cancelled)));
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT\r");
        device.send(b"\r\nOK\r\n");
        assert!(next.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_command_is_never_written() {
        let (port, mut device) = open_port(Config::new()).await;

        let token = CancellationToken::new();
        token.cancel();
        let reply = port.submit(b"ATZ\r".to_vec(), Duration::from_secs(3), false, false, Some(token));
        assert!(matches!(reply.await, Err(Error::Cancelled)));
        assert!(device.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_delay_writes_byte_by_byte() {
        let config = Config::new().send_delay(Duration::from_millis(10));
        let (port, mut device) = open_port(config).await;

        let reply = port.submit(b"ATE0\r".to_vec(), Duration::from_secs(3), false, false, None);
        // A reply arriving mid-write is held until the command is out
        sleep(Duration::from_millis(15)).await;
        device.send(b"\r\nOK\r\n");

        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATE0\r");
        assert!(reply.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn send_delay_uses_one_write_per_byte() {
        let config = Config::new().send_delay(Duration::from_millis(10));
        let (port, mut device) = open_port(config).await;

        let _reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(device.pending_writes(), 3);
        assert_eq!(device.written(), b"AT\r");
    }

    #[tokio::test(start_paused = true)]
    async fn would_block_is_retried() {
        let (port, mut device) = open_port(Config::new()).await;
        device.set_would_block(5);

        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT\r");
        device.send(b"\r\nOK\r\n");
        assert!(reply.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_would_block_becomes_timeout() {
        let (port, device) = open_port(Config::new()).await;
        let mut events = port.subscribe();
        device.set_would_block(usize::MAX);

        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert!(matches!(
            reply.await,
            Err(Error::SendFailed(SendFailure::WriteRetriesExhausted))
        ));
        assert_eq!(events.recv().await.unwrap(), PortEvent::TimedOut(1));
        assert_eq!(port.consecutive_timeouts().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_codes_are_stripped_before_parsing() {
        let (port, mut device) = open_port(Config::new()).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        port.add_unsolicited_handler(
            Regex::new(r"\r\n\+CREG: (\d)\r\n").unwrap(),
            Some(Box::new(move |caps: &Captures<'_>| {
                let _ = seen_tx.send(caps[1].to_vec());
            })),
        );

        let reply = port.submit(b"AT+COPS?\r".to_vec(), Duration::from_secs(3), false, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\n+COPS: 0\r\n\r\n+CREG: 1\r\n\r\nOK\r\n");

        assert_eq!(reply.await.unwrap(), b"+COPS: 0");
        assert_eq!(seen_rx.recv().await.unwrap(), b"1");
    }

    #[tokio::test(start_paused = true)]
    async fn echo_behind_unsolicited_code_is_removed() {
        let (port, mut device) = open_port(Config::new()).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        port.add_unsolicited_handler(
            Regex::new(r"\r\n\+CREG: (\d)\r\n").unwrap(),
            Some(Box::new(move |caps: &Captures<'_>| {
                let _ = seen_tx.send(caps[1].to_vec());
            })),
        );

        let reply = port.submit(b"ATI\r".to_vec(), Duration::from_secs(3), false, false, None);
        device.read_until(b"\r").await.unwrap();
        device.send(b"\r\n+CREG: 1\r\nATI\r\r\nModem\r\n\r\nOK\r\n");

        assert_eq!(reply.await.unwrap(), b"Modem");
        assert_eq!(seen_rx.recv().await.unwrap(), b"1");
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_codes_without_command() {
        let (port, device) = open_port(Config::new()).await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        port.add_unsolicited_handler(
            Regex::new(r"\r\nRING\r\n").unwrap(),
            Some(Box::new(move |_: &Captures<'_>| {
                let _ = seen_tx.send(());
            })),
        );

        device.send(b"\r\nRING\r\n");
        seen_rx.recv().await.unwrap();

        port.enable_unsolicited_handler(r"\r\nRING\r\n", false);
        device.send(b"\r\nRING\r\n");
        sleep(Duration::from_millis(10)).await;
        assert!(seen_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn spew_control() {
        let config = Config::new().buffer_size(16);
        let (port, device) = open_port(config).await;
        let mut events = port.subscribe();

        device.send([b'x'; 20]);
        match events.recv().await.unwrap() {
            PortEvent::BufferFull(contents) => assert_eq!(contents.len(), 20),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_preconditions() {
        let (transport, _device) = MockTransport::pair();
        let port = PortHandle::spawn(transport, Config::new()).unwrap();

        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert!(matches!(
            reply.await,
            Err(Error::SendFailed(SendFailure::NotOpen))
        ));

        port.open().await.unwrap();
        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert!(matches!(reply.await, Err(Error::NoParser)));

        port.set_response_parser(AtParser::new());
        port.set_connected(true);
        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        assert!(matches!(
            reply.await,
            Err(Error::SendFailed(SendFailure::Connected))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connected_mode_drops_lock() {
        let (port, device) = open_port(Config::new()).await;
        assert!(device.is_exclusive());

        port.set_connected(true);
        let status = port.status().await.unwrap();
        assert!(status.connected);
        assert!(!device.is_exclusive());

        port.set_connected(false);
        port.status().await.unwrap();
        assert!(device.is_exclusive());
    }

    #[tokio::test(start_paused = true)]
    async fn open_is_reference_counted() {
        let (port, device) = open_port(Config::new()).await;
        port.open().await.unwrap();
        assert_eq!(port.open_count().await.unwrap(), 2);
        assert_eq!(device.open_calls(), 1);

        port.close();
        assert_eq!(port.open_count().await.unwrap(), 1);
        assert!(port.is_open().await.unwrap());
        assert!(device.is_open());

        port.close();
        assert_eq!(port.open_count().await.unwrap(), 0);
        assert!(!port.is_open().await.unwrap());
        assert!(!device.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_commands() {
        let (port, mut device) = open_port(Config::new()).await;

        let first = port.submit(b"ATA\r".to_vec(), Duration::from_secs(3), false, false, None);
        let second = port.submit(b"ATB\r".to_vec(), Duration::from_secs(3), false, false, None);
        device.read_until(b"\r").await.unwrap();
        port.close();

        assert!(matches!(
            first.await,
            Err(Error::SendFailed(SendFailure::PortClosed))
        ));
        assert!(matches!(
            second.await,
            Err(Error::SendFailed(SendFailure::PortClosed))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_forces_close() {
        let (port, mut device) = open_port(Config::new()).await;
        let mut events = port.subscribe();

        let reply = port.submit(b"AT\r".to_vec(), Duration::from_secs(3), false, false, None);
        device.read_until(b"\r").await.unwrap();
        device.hangup();

        assert!(matches!(
            reply.await,
            Err(Error::SendFailed(SendFailure::ForcedClosed))
        ));
        assert_eq!(events.recv().await.unwrap(), PortEvent::ForcedClose);
        assert!(port.is_forced_closed().await.unwrap());
        assert!(matches!(port.open().await, Err(Error::OpenFailed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_read_errors_force_close() {
        let (port, device) = open_port(Config::new()).await;
        let mut events = port.subscribe();

        device.send_error(io::ErrorKind::Other);
        device.send_error(io::ErrorKind::Other);
        port.status().await.unwrap();
        assert!(!port.is_forced_closed().await.unwrap());

        device.send_error(io::ErrorKind::Other);
        assert_eq!(events.recv().await.unwrap(), PortEvent::ForcedClose);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_force_close() {
        let (port, device) = open_port(Config::new()).await;
        port.open().await.unwrap();

        port.force_close();
        let status = port.status().await.unwrap();
        assert!(status.forced_closed);
        assert_eq!(status.open_count, 0);
        assert!(!device.is_open());

        // Closing afterwards is silently ignored
        port.close();
        assert_eq!(port.open_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flash_restores_speed() {
        let (port, device) = open_port(Config::new().baud(115_200)).await;

        port.flash(Duration::from_millis(500), false).await.unwrap();
        assert_eq!(device.speed_history(), vec![0, 115_200]);
        assert_eq!(device.speed(), 115_200);
    }

    #[tokio::test(start_paused = true)]
    async fn flash_preconditions() {
        let (transport, _device) = MockTransport::pair();
        let port = PortHandle::spawn(transport, Config::new()).unwrap();
        assert!(matches!(
            port.flash(Duration::from_millis(100), false).await,
            Err(Error::SendFailed(SendFailure::NotOpen))
        ));

        port.open().await.unwrap();
        let first = port.flash(Duration::from_millis(100), false);
        let second = port.flash(Duration::from_millis(100), false);
        let (first, second) = tokio::join!(first, second);
        assert!(first.is_ok());
        assert!(matches!(second, Err(Error::InProgress("flash"))));
    }

    #[tokio::test(start_paused = true)]
    async fn flash_disabled_leaves_speed_alone() {
        let (port, device) = open_port(Config::new().flash_ok(false)).await;
        port.flash(Duration::from_millis(100), false).await.unwrap();
        assert!(device.speed_history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_flash() {
        let (port, _device) = open_port(Config::new()).await;
        let flash = port.flash(Duration::from_secs(10), false);
        port.close();
        assert!(matches!(flash.await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_restores_open_count() {
        let (port, device) = open_port(Config::new()).await;
        port.open().await.unwrap();

        let reopen = port.reopen(Duration::from_millis(200));
        // While reopening, explicit opens are refused
        assert!(matches!(port.open().await, Err(Error::OpenFailed(_))));
        assert!(matches!(
            port.reopen(Duration::ZERO).await,
            Err(Error::InProgress("reopen"))
        ));

        reopen.await.unwrap();
        assert_eq!(port.open_count().await.unwrap(), 2);
        assert_eq!(device.open_calls(), 2);
        assert!(device.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_forces_close() {
        let (port, device) = open_port(Config::new()).await;
        device.fail_next_open(false);

        assert!(matches!(
            port.reopen(Duration::ZERO).await,
            Err(Error::OpenFailed(_))
        ));
        assert!(port.is_forced_closed().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device() {
        let (transport, device) = MockTransport::pair();
        let port = PortHandle::spawn(transport, Config::new()).unwrap();
        device.fail_next_open(true);
        assert!(matches!(
            port.open().await,
            Err(Error::OpenFailedNoDevice(_))
        ));
        assert_eq!(port.open_count().await.unwrap(), 0);
        port.open().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn init_sequence_runs_on_physical_open() {
        let (transport, mut device) = MockTransport::pair();
        let port = PortHandle::spawn(transport, Config::new()).unwrap();
        port.set_response_parser(AtParser::new());
        port.set_init_sequence(vec![b"ATE0\r".to_vec(), b"AT+CMEE=1\r".to_vec()]);

        port.open().await.unwrap();
        port.open().await.unwrap();
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"ATE0\r");
        device.send(b"\r\nOK\r\n");
        assert_eq!(device.read_until(b"\r").await.unwrap(), b"AT+CMEE=1\r");
        device.send(b"\r\nOK\r\n");

        sleep(Duration::from_millis(10)).await;
        assert!(device.written().is_empty());
        assert_eq!(port.status().await.unwrap().queued, 0);
    }
}
