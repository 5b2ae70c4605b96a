use core::ops::{Deref, Range};

/// Accumulates bytes read from the transport until a parser claims them.
#[derive(Debug)]
pub(crate) struct ResponseBuffer {
    buf: Vec<u8>,
    high_water: usize,
    spew_control: bool,
}

impl ResponseBuffer {
    pub fn new(high_water: usize, spew_control: bool) -> Self {
        Self {
            buf: Vec::with_capacity(high_water),
            high_water,
            spew_control,
        }
    }

    /// Append freshly read bytes.
    ///
    /// With spew control on, a buffer that grows past the high-water mark is
    /// cut down to its newest `high_water / 2` bytes. The contents from
    /// before the cut are returned so they can be reported.
    pub fn extend(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.buf.extend_from_slice(data);
        if !self.spew_control || self.buf.len() <= self.high_water {
            return None;
        }

        let overrun = self.buf.clone();
        let keep = self.high_water / 2;
        self.buf.drain(..self.buf.len() - keep);
        Some(overrun)
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Drop every byte covered by `spans`. Spans may overlap and come in any
    /// order.
    pub fn remove_spans(&mut self, spans: &mut [Range<usize>]) {
        if spans.is_empty() {
            return;
        }
        spans.sort_unstable_by_key(|r| r.start);

        let mut kept = Vec::with_capacity(self.buf.len());
        let mut cursor = 0;
        for span in spans.iter() {
            if span.start > cursor {
                kept.extend_from_slice(&self.buf[cursor..span.start]);
            }
            cursor = cursor.max(span.end);
        }
        if cursor < self.buf.len() {
            kept.extend_from_slice(&self.buf[cursor..]);
        }
        self.buf = kept;
    }

    pub fn take(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.buf)
    }
}

impl Deref for ResponseBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}
