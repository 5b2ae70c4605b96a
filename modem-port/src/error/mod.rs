mod connection_error;

pub use connection_error::ConnectionError;

use crate::config::ConfigError;

/// Why a command could not be written to the port.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("sending command failed: device is not open")]
    NotOpen,
    #[error("sending command failed: device is connected")]
    Connected,
    #[error("serial port is now closed")]
    PortClosed,
    #[error("serial port was forced closed")]
    ForcedClosed,
    #[error("sending command failed: write retries exhausted")]
    WriteRetriesExhausted,
    #[error("sending command failed: {0}")]
    Write(String),
}

/// Error replies recognized by a response parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// Plain `ERROR` final result code
    #[error("modem replied ERROR")]
    Error,
    /// GSM equipment related error
    #[error("+CME ERROR: {0}")]
    CmeError(u16),
    /// GSM network related error
    #[error("+CMS ERROR: {0}")]
    CmsError(u16),
    /// Dial attempt did not connect
    #[error("connection failed: {0}")]
    Connection(ConnectionError),
    /// Anything a vendor parser wants to report
    #[error("{0}")]
    Custom(String),
}

/// Errors returned by the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("open failed: {0}")]
    OpenFailed(String),
    #[error("serial device {0} is not present")]
    OpenFailedNoDevice(String),
    #[error(transparent)]
    SendFailed(#[from] SendFailure),
    #[error("serial command timed out")]
    ResponseTimeout,
    #[error("operation was cancelled")]
    Cancelled,
    #[error(transparent)]
    Parse(#[from] ResponseError),
    #[error("{0} already in progress")]
    InProgress(&'static str),
    #[error("flash failed: {0}")]
    FlashFailed(String),
    #[error("no response parser configured")]
    NoParser,
    #[error("invalid port configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    /// The port task is no longer running.
    #[error("port engine has shut down")]
    EngineGone,
}

impl Error {
    /// True for the errors that count against link health.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ResponseTimeout | Self::SendFailed(SendFailure::WriteRetriesExhausted)
        )
    }
}
