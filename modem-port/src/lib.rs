//! A transaction engine for modem control ports.
//!
//! A port serializes commands to a modem over a byte stream (a serial TTY
//! or a Unix socket), assembles the replies, strips unsolicited result codes
//! out of the stream and hands them to registered handlers.
//!
//! Every port is a tokio task owning its [`Transport`]. Callers talk to it
//! through a cloneable [`PortHandle`]:
//!
//! - Commands are queued with [`PortHandle::submit`] and run strictly one at
//!   a time, in order. A reply is complete once the configured
//!   [`ResponseParser`] says so.
//! - Replies can be cached per command, commands can be cancelled with a
//!   [`CancellationToken`](tokio_util::sync::CancellationToken), and every
//!   command has its own timeout.
//! - Opening is reference counted. Hangups and repeated read errors force
//!   the port closed for good.
//!
//! [`AtPort`] adds AT command framing and the generic AT result codes on
//! top, [`GpsPort`] turns a port into a receiver of NMEA traces.
//!
//! # Examples
//!
//! ```no_run
//! use core::time::Duration;
//! use modem_port::{AtConfig, AtPort, Config, TtyTransport};
//!
//! # async fn run() -> Result<(), modem_port::Error> {
//! let transport = TtyTransport::new("/dev/ttyUSB2");
//! let port = AtPort::new(transport, Config::new().baud(115_200), AtConfig::new())?;
//! port.open().await?;
//!
//! let quality = port
//!     .command("+CSQ", Duration::from_secs(3), false, false, None)
//!     .await?;
//! println!("signal: {quality}");
//!
//! port.close();
//! # Ok(())
//! # }
//! ```
//!
//! # Optional Cargo Features
//!
//! - **`log`** *(enabled by default)*: logs port traffic and state changes
//!   through the [`log`](https://crates.io/crates/log) facade. Bytes written
//!   and read are logged on the `DEBUG` level.
//! - **`mock`**: exports `MockTransport` and its scripted `MockDevice`, an
//!   in-memory modem for tests and demos.

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod at;
mod buffer;
mod config;
mod error;
mod gps;
mod handle;
pub mod helpers;
pub mod parser;
mod port;
mod queue;
mod reply_cache;
pub mod transport;
mod urc;

pub use at::{frame_command, quote_string, AtConfig, AtPort};
pub use config::{Config, ConfigError, DataBits, Parity, StopBits};
pub use error::{ConnectionError, Error, ResponseError, SendFailure};
pub use gps::GpsPort;
pub use handle::{Pending, PortHandle, Reply};
pub use parser::{ParserVerdict, ResponseParser};
pub use port::{PortEvent, PortStatus};
#[cfg(feature = "mock")]
pub use transport::{MockDevice, MockTransport};
pub use transport::{Transport, TransportKind, TtyTransport, UnixTransport};
pub use urc::UrcCallback;

pub use regex;
