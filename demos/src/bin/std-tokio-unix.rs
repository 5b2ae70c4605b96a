//! Drive a modem emulator listening on a Unix socket.
//!
//! `cargo run --bin std-tokio-unix -- /tmp/modem.sock`

use core::time::Duration;
use std::process::exit;

use modem_port::{AtConfig, AtPort, Config, UnixTransport};
use modem_port_demos::common;

#[tokio::main]
async fn main() {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: std-tokio-unix <socket>");
        exit(2);
    };

    let at_config = AtConfig::new().init_sequence(vec![String::from("E0")]);
    let port = match AtPort::new(UnixTransport::new(path.as_str()), Config::new(), at_config) {
        Ok(port) => port,
        Err(e) => {
            log::error!("invalid configuration: {}", e);
            exit(1);
        }
    };
    common::spawn_event_logger(&port);

    if let Err(e) = port.open().await {
        log::error!("could not connect to {}: {}", path, e);
        exit(1);
    }
    // Unix sockets always get CRLF line endings
    log::info!("send_lf: {}", port.send_lf());

    match port
        .command("I", Duration::from_secs(3), false, false, None)
        .await
    {
        Ok(reply) => log::info!("ATI -> {}", reply),
        Err(e) => log::error!("ATI failed: {}", e),
    }

    port.close();
}
