use nom::{
    bytes::streaming::{tag, take_till},
    combinator::recognize,
    sequence::{pair, terminated},
    IResult,
};

use super::{ParserVerdict, ResponseParser};
use crate::helpers::LossyStr;

/// Receives every complete NMEA sentence, without its `\r\n`.
pub type TraceCallback = Box<dyn FnMut(&str) + Send>;

/// Frames the receive-only NMEA stream of a GPS port.
///
/// Complete `$...\r\n` sentences are handed to the trace callback and
/// removed. Bytes in front of the first `$` are garbage and dropped. A
/// sentence still missing its line ending stays buffered.
#[derive(Default)]
pub struct NmeaParser {
    trace: Option<TraceCallback>,
}

/// A `$` and everything up to and including the next `\n`.
fn line(i: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(recognize(pair(tag("$"), take_till(|c| c == b'\n'))), tag("\n"))(i)
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_trace_callback(&mut self, callback: Option<TraceCallback>) {
        self.trace = callback;
    }
}

impl ResponseParser for NmeaParser {
    fn preprocess(&mut self, buf: &mut Vec<u8>) {
        let mut consumed = 0;
        loop {
            let pending = &buf[consumed..];
            let Some(start) = pending.iter().position(|&c| c == b'$') else {
                consumed = buf.len();
                break;
            };
            let pending = &pending[start..];

            match line(pending) {
                Ok((remaining, sentence)) => {
                    if let Some(sentence) = sentence.strip_suffix(b"\r") {
                        if let Some(trace) = self.trace.as_mut() {
                            trace(&String::from_utf8_lossy(sentence));
                        }
                    } else {
                        debug!("Dropping malformed trace {:?}", LossyStr(sentence));
                    }
                    consumed += start + pending.len() - remaining.len();
                }
                Err(_) => {
                    consumed += start;
                    break;
                }
            }
        }
        buf.drain(..consumed);
    }

    fn parse(&mut self, _buf: &[u8]) -> ParserVerdict {
        ParserVerdict::Incomplete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn parser() -> (NmeaParser, Arc<Mutex<Vec<String>>>) {
        let traces = Arc::new(Mutex::new(Vec::new()));
        let sink = traces.clone();
        let mut parser = NmeaParser::new();
        parser.set_trace_callback(Some(Box::new(move |t: &str| {
            sink.lock().unwrap().push(t.to_string())
        })));
        (parser, traces)
    }

    #[test]
    fn garbage_before_first_sentence_is_dropped() {
        let (mut parser, traces) = parser();
        let mut buf = b"\x00junk$GPGGA,1*00\r\n".to_vec();
        parser.preprocess(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(*traces.lock().unwrap(), vec!["$GPGGA,1*00"]);
    }

    #[test]
    fn partial_sentence_stays_buffered() {
        let (mut parser, traces) = parser();
        let mut buf = b"$GPGGA,1*00\r\n$GPRMC,2".to_vec();
        parser.preprocess(&mut buf);
        assert_eq!(buf, b"$GPRMC,2");
        assert_eq!(parser.parse(&buf), ParserVerdict::Incomplete);

        buf.extend_from_slice(b"*11\r\n");
        parser.preprocess(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(*traces.lock().unwrap(), vec!["$GPGGA,1*00", "$GPRMC,2*11"]);
    }

    #[test]
    fn bare_line_feed_is_not_a_sentence() {
        let (mut parser, traces) = parser();
        let mut buf = b"$BROKEN\n$GPGSV,3*22\r\n".to_vec();
        parser.preprocess(&mut buf);
        assert!(buf.is_empty());
        assert_eq!(*traces.lock().unwrap(), vec!["$GPGSV,3*22"]);
    }

    #[test]
    fn no_dollar_means_all_garbage() {
        let (mut parser, traces) = parser();
        let mut buf = b"\r\nOK\r\n".to_vec();
        parser.preprocess(&mut buf);
        assert!(buf.is_empty());
        assert!(traces.lock().unwrap().is_empty());
    }
}
