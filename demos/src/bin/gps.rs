//! Print the NMEA traces of a GPS port.
//!
//! `cargo run --bin gps -- /dev/ttyUSB1`

use core::time::Duration;
use std::process::exit;

use modem_port::{Config, GpsPort, TtyTransport};
use modem_port_demos::common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("/dev/ttyUSB1"));

    // GPS ports of most modems run at 9600 and never answer commands
    let config = Config::new().baud(9600).flash_ok(false);
    let gps = match GpsPort::new(TtyTransport::new(path.as_str()), config) {
        Ok(gps) => gps,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            exit(1);
        }
    };
    gps.set_trace_handler(Some(Box::new(|trace: &str| println!("{trace}"))));
    common::spawn_event_logger(&gps);

    if let Err(e) = gps.open().await {
        log::error!("could not open {}: {}", path, e);
        exit(1);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(60)) => {}
    }
    gps.close();
}
