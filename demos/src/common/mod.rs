//! Bits shared by the demo binaries.

use modem_port::{
    regex::bytes::{Captures, Regex},
    PortEvent, PortHandle,
};

/// Network registration URCs: `+CREG`, `+CGREG` and `+CEREG`.
pub const REGISTRATION_URC: &str = r"\r\n\+C(?:E|G)?REG: (\d)(?:,[^\r\n]*)?\r\n";

/// Incoming call.
pub const RING_URC: &str = r"\r\nRING\r\n";

/// Log registration changes and rings as they come in.
pub fn register_urc_handlers(port: &PortHandle) -> Result<(), modem_port::regex::Error> {
    port.add_unsolicited_handler(
        Regex::new(REGISTRATION_URC)?,
        Some(Box::new(|caps: &Captures<'_>| {
            log::info!(
                "registration state {}",
                String::from_utf8_lossy(&caps[1])
            );
        })),
    );
    port.add_unsolicited_handler(
        Regex::new(RING_URC)?,
        Some(Box::new(|_: &Captures<'_>| log::info!("RING"))),
    );
    Ok(())
}

/// Log every port event until the port goes away.
pub fn spawn_event_logger(port: &PortHandle) {
    let mut events = port.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PortEvent::TimedOut(n) => log::warn!("{} commands timed out in a row", n),
                PortEvent::BufferFull(contents) => {
                    log::warn!("dropped {} bytes of garbage", contents.len())
                }
                PortEvent::ForcedClose => log::error!("port forced closed"),
            }
        }
    });
}
