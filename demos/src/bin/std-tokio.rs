//! Talk to a real modem on a serial TTY.
//!
//! `cargo run --bin std-tokio -- /dev/ttyUSB2`

use core::time::Duration;
use std::process::exit;

use modem_port::{AtConfig, AtPort, Config, TtyTransport};
use modem_port_demos::common;

const QUERIES: &[&str] = &["+CGMI", "+CGMM", "+CGMR", "+CSQ", "+CREG?"];

#[tokio::main]
async fn main() {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| String::from("/dev/ttyUSB2"));

    let config = Config::new()
        .baud(115_200)
        .send_delay(Duration::from_millis(1));
    let port = match AtPort::new(TtyTransport::new(path.as_str()), config, AtConfig::new()) {
        Ok(port) => port,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            exit(1);
        }
    };

    if let Err(e) = common::register_urc_handlers(&port) {
        log::error!("bad URC pattern: {}", e);
        exit(1);
    }
    common::spawn_event_logger(&port);

    if let Err(e) = port.open().await {
        log::error!("could not open {}: {}", path, e);
        exit(1);
    }

    for query in QUERIES {
        // Identification never changes while the port is open
        let cached = query.starts_with("+CGM");
        match port
            .command(query, Duration::from_secs(3), false, cached, None)
            .await
        {
            Ok(reply) => log::info!("{} -> {}", query, reply),
            Err(e) => log::error!("{} failed: {}", query, e),
        }
    }

    // Get the modem out of any data call it might be in
    if let Err(e) = port.flash(Duration::from_millis(500), true).await {
        log::warn!("flash failed: {}", e);
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
    }
    port.close();
}
