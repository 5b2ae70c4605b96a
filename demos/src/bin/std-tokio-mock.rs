//! Run the engine against a scripted in-memory modem.

use core::time::Duration;
use std::process::exit;

use modem_port::{AtConfig, AtPort, Config, MockDevice, MockTransport};
use modem_port_demos::common;

// Responses: Trigger
const RESPONSES: &[(&[u8], &[u8])] = &[
    (b"ATE0 V1\r", b"ATE0 V1\r\r\nOK\r\n"),
    (b"AT+CMEE=1\r", b"\r\nOK\r\n"),
    (b"AT+CGMI\r", b"\r\nACME Modems\r\n\r\nOK\r\n"),
    (b"AT+CPIN?\r", b"\r\n+CME ERROR: 10\r\n"),
    (
        b"AT+COPS?\r",
        b"\r\n+COPS: 0,0,\"Demo\",7\r\n\r\n+CREG: 1\r\n\r\nOK\r\n",
    ),
];

#[tokio::main]
async fn main() {
    env_logger::init();

    let (transport, device) = MockTransport::pair();
    let port = match AtPort::new(transport, Config::new(), AtConfig::new()) {
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

    tokio::spawn(device_task(device));

    if let Err(e) = port.open().await {
        log::error!("could not open mock port: {}", e);
        exit(1);
    }

    for command in ["+CGMI", "+CPIN?", "+COPS?", "+CSQ"] {
        match port
            .command(command, Duration::from_secs(1), false, false, None)
            .await
        {
            Ok(reply) => log::info!("{} -> {:?}", command, reply),
            Err(e) => log::error!("{} failed: {}", command, e),
        }
    }

    port.close();
}

/// Answer every known command, ignore the rest.
async fn device_task(mut device: MockDevice) {
    while let Some(command) = device.read_until(b"\r").await {
        log::debug!("device got {:?}", String::from_utf8_lossy(&command));
        match RESPONSES.iter().find(|(trigger, _)| *trigger == command.as_slice()) {
            Some((_, response)) => device.send(response),
            None => log::debug!("no scripted response, letting it time out"),
        }
    }
}
