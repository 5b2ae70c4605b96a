use regex::bytes::{Captures, Regex};

use crate::{buffer::ResponseBuffer, helpers::LossyStr};

/// Called for every match of an unsolicited handler's pattern.
pub type UrcCallback = Box<dyn FnMut(&Captures<'_>) + Send>;

struct UrcHandler {
    pattern: Regex,
    callback: Option<UrcCallback>,
    enabled: bool,
}

/// Pattern handlers run against the response buffer before any response
/// parsing. Matched spans are removed from the buffer.
#[derive(Default)]
pub(crate) struct UrcDispatcher {
    handlers: Vec<UrcHandler>,
}

impl UrcDispatcher {
    /// Register `pattern`. Re-registering the same pattern replaces its
    /// callback and enables it in place; a new pattern is tried before all
    /// the ones registered earlier.
    pub fn add(&mut self, pattern: Regex, callback: Option<UrcCallback>) {
        if let Some(handler) = self
            .handlers
            .iter_mut()
            .find(|h| h.pattern.as_str() == pattern.as_str())
        {
            handler.callback = callback;
            handler.enabled = true;
            return;
        }

        self.handlers.insert(
            0,
            UrcHandler {
                pattern,
                callback,
                enabled: true,
            },
        );
    }

    /// Returns false when no handler has this pattern.
    pub fn enable(&mut self, pattern: &str, enabled: bool) -> bool {
        match self.handlers.iter_mut().find(|h| h.pattern.as_str() == pattern) {
            Some(handler) => {
                handler.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Run every enabled handler over the whole buffer, then strip all
    /// matched spans. Returns the number of matches.
    pub fn dispatch(&mut self, buf: &mut ResponseBuffer) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut spans = Vec::new();
        for handler in self.handlers.iter_mut().filter(|h| h.enabled) {
            for caps in handler.pattern.captures_iter(buf) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                if whole.is_empty() {
                    continue;
                }
                trace!("URC {:?}", LossyStr(whole.as_bytes()));
                spans.push(whole.range());
                if let Some(callback) = handler.callback.as_mut() {
                    callback(&caps);
                }
            }
        }

        let matches = spans.len();
        buf.remove_spans(&mut spans);
        matches
    }
}
