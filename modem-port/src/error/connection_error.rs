/// Final result codes a modem sends when a dial attempt does not connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionError {
    Unknown,
    NoCarrier,
    NoDialtone,
    Busy,
    NoAnswer,
}

impl ConnectionError {
    /// Maps a final result line (without line endings) to a connection error.
    pub fn from_result_code(code: &[u8]) -> Option<Self> {
        match code {
            b"NO CARRIER" => Some(Self::NoCarrier),
            b"NO DIALTONE" => Some(Self::NoDialtone),
            b"BUSY" => Some(Self::Busy),
            b"NO ANSWER" => Some(Self::NoAnswer),
            _ => None,
        }
    }
}

impl core::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::NoCarrier => write!(f, "No carrier"),
            Self::NoDialtone => write!(f, "No dialtone"),
            Self::Busy => write!(f, "Busy"),
            Self::NoAnswer => write!(f, "No answer"),
        }
    }
}
