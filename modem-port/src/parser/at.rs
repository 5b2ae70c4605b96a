use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::{GenericAtClassifier, ParserVerdict, ResponseParser};
use crate::helpers::{LossyStr, SliceExt};

/// Recognizes the final result of an AT reply. Vendor layers implement this
/// for their own result codes.
pub trait ResponseClassifier: Send {
    fn classify(&mut self, buf: &[u8]) -> ParserVerdict;
}

impl<F> ResponseClassifier for F
where
    F: FnMut(&[u8]) -> ParserVerdict + Send,
{
    fn classify(&mut self, buf: &[u8]) -> ParserVerdict {
        self(buf)
    }
}

/// Drop everything in front of the first `\r\n`, which is the echo of the
/// command just sent.
///
/// Buffers of two bytes or less are left alone.
pub fn remove_echo(buf: &mut Vec<u8>) {
    if buf.len() <= 2 {
        return;
    }
    if let Some(pos) = buf.find(b"\r\n") {
        if pos > 0 {
            trace!("Removing echo {:?}", LossyStr(&buf[..pos]));
            buf.drain(..pos);
        }
    }
}

/// AT protocol parser: optional echo removal in front of a
/// [`ResponseClassifier`].
///
/// Echo removal is a switch shared with whoever built the parser, so it can
/// be flipped after the parser was handed to a port.
pub struct AtParser<C = GenericAtClassifier> {
    classifier: C,
    remove_echo: Arc<AtomicBool>,
}

impl AtParser {
    pub fn new() -> Self {
        Self::with_classifier(GenericAtClassifier)
    }
}

impl Default for AtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ResponseClassifier> AtParser<C> {
    pub fn with_classifier(classifier: C) -> Self {
        Self {
            classifier,
            remove_echo: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn remove_echo(self, enabled: bool) -> Self {
        self.remove_echo.store(enabled, Ordering::Relaxed);
        self
    }

    /// Use `switch` to decide on echo removal, replacing the current one.
    #[must_use]
    pub fn echo_switch(mut self, switch: Arc<AtomicBool>) -> Self {
        self.remove_echo = switch;
        self
    }

    /// The switch this parser reads before every echo removal.
    pub fn shared_echo_switch(&self) -> Arc<AtomicBool> {
        self.remove_echo.clone()
    }
}

impl<C: ResponseClassifier> ResponseParser for AtParser<C> {
    fn preprocess(&mut self, buf: &mut Vec<u8>) {
        if self.remove_echo.load(Ordering::Relaxed) {
            remove_echo(buf);
        }
    }

    fn parse(&mut self, buf: &[u8]) -> ParserVerdict {
        self.classifier.classify(buf)
    }
}
