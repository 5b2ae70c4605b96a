//! Deciding when the response buffer holds a complete reply.

mod at;
mod generic;
mod nmea;

pub use at::{remove_echo, AtParser, ResponseClassifier};
pub use generic::{GenericAtClassifier, NumericAtClassifier};
pub use nmea::{NmeaParser, TraceCallback};

use crate::error::ResponseError;

/// Outcome of looking at the response buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserVerdict {
    /// No complete reply yet. The buffer is left as is.
    Incomplete,
    /// A complete successful reply. The buffer is consumed.
    Matched(Vec<u8>),
    /// A complete error reply. The buffer is consumed.
    MatchedError(ResponseError),
}

/// Protocol specific framing of replies.
///
/// On every read the port first calls [`preprocess`](Self::preprocess), then
/// runs the unsolicited handlers, then calls [`parse`](Self::parse) on what
/// is left.
pub trait ResponseParser: Send {
    /// Rewrite the raw buffer in place, e.g. to drop echo or garbage.
    fn preprocess(&mut self, _buf: &mut Vec<u8>) {}

    fn parse(&mut self, buf: &[u8]) -> ParserVerdict;
}

impl<F> ResponseParser for F
where
    F: FnMut(&[u8]) -> ParserVerdict + Send,
{
    fn parse(&mut self, buf: &[u8]) -> ParserVerdict {
        self(buf)
    }
}
