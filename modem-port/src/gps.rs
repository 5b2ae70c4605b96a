//! Receive-only NMEA front-end.

use core::ops::Deref;

use crate::{
    config::Config,
    error::Error,
    handle::PortHandle,
    parser::{NmeaParser, TraceCallback},
    transport::Transport,
};

/// A port that only ever receives NMEA traces.
pub struct GpsPort {
    port: PortHandle,
}

impl GpsPort {
    pub fn new<T: Transport>(transport: T, config: Config) -> Result<Self, Error> {
        let port = PortHandle::spawn(transport, config)?;
        port.set_response_parser(NmeaParser::new());
        Ok(Self { port })
    }

    /// Deliver every complete sentence to `callback`, or drop them with
    /// `None`. Sentences still being received are kept.
    pub fn set_trace_handler(&self, callback: Option<TraceCallback>) {
        let mut parser = NmeaParser::new();
        parser.set_trace_callback(callback);
        self.port.set_response_parser(parser);
    }
}

impl Deref for GpsPort {
    type Target = PortHandle;

    fn deref(&self) -> &PortHandle {
        &self.port
    }
}
