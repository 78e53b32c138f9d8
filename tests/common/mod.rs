#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mulelink::packet::PROTO_EDONKEY;
use mulelink::{Config, ConnectState, Connection, Engine};

/// Opcode used by the test protocol for plain byte payloads.
pub const OP_ECHO: u8 = 0x40;

pub fn start_server(port: u16) -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = Config {
        bind_addr: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
        ..Config::default()
    };
    let server = Engine::start(config).unwrap();

    // There is a split-second moment between engine start and the reactor
    // binding the listener where a fast connect could race it. Tests are
    // the one place that can actually lose that race.
    std::thread::sleep(Duration::from_millis(20));

    server
}

pub fn start_client() -> Engine {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::start(Config::default()).unwrap()
}

/// Registers a handler that forwards every `OP_ECHO` payload into a
/// channel, so tests can assert on what arrived and in what order.
pub fn capture_payloads(engine: &Engine) -> Receiver<Vec<u8>> {
    let (tx, rx): (Sender<Vec<u8>>, Receiver<Vec<u8>>) = crossbeam_channel::unbounded();
    engine.register(
        PROTO_EDONKEY,
        OP_ECHO,
        |payload| Ok(payload.to_vec()),
        move |payload, _connection| {
            let _ = tx.send(payload);
        },
    );
    rx
}

/// Polls `cond` until it holds or the timeout passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Connects and waits for the attempt to resolve.
pub fn connect_ready(client: &Engine, port: u16) -> Connection {
    let connection = client.connect(Ipv4Addr::LOCALHOST, port).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || connection.state()
            != ConnectState::InProgress),
        "connect did not resolve"
    );
    assert_eq!(connection.state(), ConnectState::Connected);
    connection
}
