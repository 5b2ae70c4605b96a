//! AT command front-end.

use core::{fmt::Write as _, future::Future, ops::Deref, time::Duration};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::Error,
    handle::PortHandle,
    parser::{AtParser, ResponseClassifier},
    port::INIT_COMMAND_TIMEOUT,
    transport::{Transport, TransportKind},
};

/// Settings of the AT layer, on top of the line [`Config`].
#[derive(Debug, Clone)]
pub struct AtConfig {
    pub(crate) remove_echo: bool,
    pub(crate) send_lf: bool,
    pub(crate) init_sequence_enabled: bool,
    pub(crate) init_sequence: Vec<String>,
}

impl Default for AtConfig {
    fn default() -> Self {
        Self {
            remove_echo: true,
            send_lf: false,
            init_sequence_enabled: true,
            init_sequence: vec![String::from("E0 V1"), String::from("+CMEE=1")],
        }
    }
}

impl AtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Strip the echo of the command from replies.
    #[must_use]
    pub fn remove_echo(mut self, enabled: bool) -> Self {
        self.remove_echo = enabled;
        self
    }

    /// Terminate commands with `\r\n` instead of `\r`. Always on for
    /// Unix-socket transports.
    #[must_use]
    pub fn send_lf(mut self, enabled: bool) -> Self {
        self.send_lf = enabled;
        self
    }

    #[must_use]
    pub fn init_sequence_enabled(mut self, enabled: bool) -> Self {
        self.init_sequence_enabled = enabled;
        self
    }

    /// Commands sent, without `AT` prefix, every time the device is opened.
    #[must_use]
    pub fn init_sequence(mut self, commands: Vec<String>) -> Self {
        self.init_sequence = commands;
        self
    }
}

/// Turn `command` into the bytes to write.
///
/// `AT` is prepended unless already there, and `\r` (then `\n` with
/// `send_lf`) appended unless one of the last two bytes already is one.
/// Raw commands are passed through untouched.
pub fn frame_command(command: &str, raw: bool, send_lf: bool) -> Vec<u8> {
    let cmd = command.as_bytes();
    let mut buf = Vec::with_capacity(cmd.len() + 4);

    if raw {
        buf.extend_from_slice(cmd);
        return buf;
    }

    if !cmd.starts_with(b"AT") {
        buf.extend_from_slice(b"AT");
    }
    buf.extend_from_slice(cmd);

    let terminated = |c: u8| cmd.iter().rev().take(2).any(|&b| b == c);
    if !terminated(b'\r') {
        buf.push(b'\r');
    }
    if send_lf && !terminated(b'\n') {
        buf.push(b'\n');
    }
    buf
}

/// Quote `s` as an AT string argument. Control characters, `"` and `\` are
/// written as `\HH`.
pub fn quote_string(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.chars() {
        if c < ' ' || c == '"' || c == '\\' {
            let _ = write!(quoted, "\\{:02X}", c as u32);
        } else {
            quoted.push(c);
        }
    }
    quoted.push('"');
    quoted
}

/// A port speaking the AT protocol.
///
/// Dereferences to the underlying [`PortHandle`] for lifecycle operations
/// and unsolicited handlers.
pub struct AtPort {
    port: PortHandle,
    config: AtConfig,
    remove_echo: Arc<AtomicBool>,
}

impl AtPort {
    pub fn new<T: Transport>(
        transport: T,
        config: Config,
        mut at_config: AtConfig,
    ) -> Result<Self, Error> {
        if transport.kind() == TransportKind::UnixSocket {
            at_config.send_lf = true;
        }

        let port = PortHandle::spawn(transport, config)?;
        let parser = AtParser::new().remove_echo(at_config.remove_echo);
        let remove_echo = parser.shared_echo_switch();
        port.set_response_parser(parser);

        let at = Self {
            port,
            config: at_config,
            remove_echo,
        };
        at.update_init_sequence();
        Ok(at)
    }

    fn framed_init_sequence(&self) -> Vec<Vec<u8>> {
        self.config
            .init_sequence
            .iter()
            .map(|cmd| frame_command(cmd, false, self.config.send_lf))
            .collect()
    }

    fn update_init_sequence(&self) {
        let commands = if self.config.init_sequence_enabled {
            self.framed_init_sequence()
        } else {
            Vec::new()
        };
        self.port.set_init_sequence(commands);
    }

    /// Send an AT command and wait for its reply payload.
    ///
    /// Raw commands skip framing and go in front of the queue. The command
    /// is queued right away, before the returned future is polled.
    pub fn command(
        &self,
        command: &str,
        timeout: Duration,
        raw: bool,
        allow_cached: bool,
        cancel: Option<CancellationToken>,
    ) -> impl Future<Output = Result<String, Error>> + Send + 'static {
        let framed = frame_command(command, raw, self.config.send_lf);
        let reply = self.port.submit(framed, timeout, allow_cached, raw, cancel);
        async move {
            let payload = reply.await?;
            Ok(String::from_utf8_lossy(&payload).into_owned())
        }
    }

    /// Queue the init sequence now, without waiting for the replies.
    pub fn run_init_sequence(&self) {
        for command in self.framed_init_sequence() {
            // Replies to init commands are not interesting
            drop(self.port.submit(command, INIT_COMMAND_TIMEOUT, false, false, None));
        }
    }

    pub fn set_init_sequence(&mut self, commands: Vec<String>) {
        self.config.init_sequence = commands;
        self.update_init_sequence();
    }

    pub fn set_init_sequence_enabled(&mut self, enabled: bool) {
        self.config.init_sequence_enabled = enabled;
        self.update_init_sequence();
    }

    /// Replace the final result classification, e.g. with a vendor one.
    pub fn set_classifier(&self, classifier: impl ResponseClassifier + 'static) {
        self.port.set_response_parser(
            AtParser::with_classifier(classifier).echo_switch(self.remove_echo.clone()),
        );
    }

    /// Toggle echo removal. The installed classifier is kept.
    pub fn set_remove_echo(&mut self, enabled: bool) {
        self.config.remove_echo = enabled;
        self.remove_echo.store(enabled, Ordering::Relaxed);
    }

    pub fn send_lf(&self) -> bool {
        self.config.send_lf
    }

    pub fn handle(&self) -> &PortHandle {
        &self.port
    }
}

impl Deref for AtPort {
    type Target = PortHandle;

    fn deref(&self) -> &PortHandle {
        &self.port
    }
}
