use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use regex::bytes::Regex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::Error,
    parser::ResponseParser,
    port::{PortEvent, PortStatus, PortTask, Request},
    queue::Transaction,
    transport::Transport,
    urc::UrcCallback,
};

const EVENT_CAPACITY: usize = 16;

/// Completion of a request handed to the port task.
///
/// Resolves to [`Error::EngineGone`] if the task stopped before answering.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

/// Completion of a submitted command.
pub type Reply = Pending<Vec<u8>>;

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::EngineGone)))
    }
}

/// Handle to a running port.
///
/// The port itself lives in a tokio task that owns the transport. Handles are
/// cheap to clone. Once every handle is dropped the task closes the port and
/// exits.
#[derive(Clone)]
pub struct PortHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<PortEvent>,
}

impl PortHandle {
    /// Validate `config` and start the port task on the current runtime. The
    /// port starts closed.
    pub fn spawn<T: Transport>(transport: T, config: Config) -> Result<Self, Error> {
        config.validate()?;

        let (requests, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(PortTask::new(transport, config, rx, events.clone()).run());

        Ok(Self { requests, events })
    }

    fn send(&self, request: Request) {
        // A stopped task drops the reply sender, which the caller observes
        let _ = self.requests.send(request);
    }

    fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> Request,
    ) -> Pending<T> {
        let (tx, rx) = oneshot::channel();
        self.send(request(tx));
        Pending { rx }
    }

    /// Take a reference on the port, opening the device if this is the first
    /// one.
    pub fn open(&self) -> Pending<()> {
        self.call(Request::Open)
    }

    /// Drop a reference on the port. The device is closed, and every pending
    /// command failed, when the last reference goes away.
    pub fn close(&self) {
        self.send(Request::Close);
    }

    /// Close the device regardless of the open count. The port refuses to
    /// open again afterwards.
    pub fn force_close(&self) {
        self.send(Request::ForceClose);
    }

    /// Queue `command` to be written verbatim.
    ///
    /// `allow_cached` lets a previous reply to the same bytes answer without
    /// touching the device. `run_next` puts the command in front of
    /// everything that has not been written yet.
    pub fn submit(
        &self,
        command: Vec<u8>,
        timeout: Duration,
        allow_cached: bool,
        run_next: bool,
        cancel: Option<CancellationToken>,
    ) -> Reply {
        self.call(|reply| Request::Submit {
            tx: Transaction::new(command, timeout, allow_cached, cancel, reply),
            run_next,
        })
    }

    /// Register a handler for bytes the device sends on its own. Matches are
    /// removed from the response buffer whether or not a callback is given.
    ///
    /// Registering a pattern again replaces the callback of the existing
    /// handler and enables it.
    pub fn add_unsolicited_handler(&self, pattern: Regex, callback: Option<UrcCallback>) {
        self.send(Request::AddUrc { pattern, callback });
    }

    pub fn enable_unsolicited_handler(&self, pattern: &str, enabled: bool) {
        self.send(Request::EnableUrc {
            pattern: pattern.to_string(),
            enabled,
        });
    }

    pub fn set_response_parser(&self, parser: impl ResponseParser + 'static) {
        self.send(Request::SetParser(Box::new(parser)));
    }

    /// Commands written, in order, whenever the device is physically opened.
    pub fn set_init_sequence(&self, commands: Vec<Vec<u8>>) {
        self.send(Request::SetInitSequence(commands));
    }

    /// In connected mode the port stops reading, refuses commands and drops
    /// its exclusive lock so another program can drive the line.
    pub fn set_connected(&self, connected: bool) {
        self.send(Request::SetConnected(connected));
    }

    /// Drop the line speed to zero for `duration`, then restore it. This
    /// lowers DTR and makes most modems hang up.
    pub fn flash(&self, duration: Duration, ignore_errors: bool) -> Pending<()> {
        self.call(|reply| Request::Flash {
            duration,
            ignore_errors,
            reply,
        })
    }

    /// Close the device and open it again after `delay`, keeping the open
    /// count.
    pub fn reopen(&self, delay: Duration) -> Pending<()> {
        self.call(|reply| Request::Reopen { delay, reply })
    }

    pub async fn status(&self) -> Result<PortStatus, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Status(tx));
        rx.await.map_err(|_| Error::EngineGone)
    }

    pub async fn is_open(&self) -> Result<bool, Error> {
        let status = self.status().await?;
        Ok(status.open_count > 0 && !status.forced_closed)
    }

    pub async fn open_count(&self) -> Result<u32, Error> {
        Ok(self.status().await?.open_count)
    }

    pub async fn consecutive_timeouts(&self) -> Result<u32, Error> {
        Ok(self.status().await?.consecutive_timeouts)
    }

    pub async fn is_forced_closed(&self) -> Result<bool, Error> {
        Ok(self.status().await?.forced_closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }
}
