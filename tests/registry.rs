use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mulelink::{Connection, Endpoint};

mod common;
use common::{connect_ready, start_client, start_server, wait_until};

struct KnownPeer {
    addr: SocketAddrV4,
    attaches: AtomicUsize,
}

impl Endpoint for KnownPeer {
    fn address(&self) -> SocketAddrV4 {
        self.addr
    }

    fn attach(&self, connection: Connection) {
        assert_eq!(connection.remote_addr().ip(), self.addr.ip());
        self.attaches.fetch_add(1, Ordering::Relaxed);
    }

    fn describe(&self) -> String {
        format!("known peer at {}", self.addr)
    }
}

/// An inbound accept from a registered address must be routed to that
/// peer's `attach`, not to the fallback.
#[test]
fn inbound_accept_attaches_to_registered_peer() {
    let server = start_server(9520);
    let client = start_client();

    let peer = Arc::new(KnownPeer {
        addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9520),
        attaches: AtomicUsize::new(0),
    });
    server.registry().insert(peer.clone());

    let fallback_hits = Arc::new(AtomicUsize::new(0));
    let hits = fallback_hits.clone();
    server
        .registry()
        .set_fallback(move |_connection| {
            hits.fetch_add(1, Ordering::Relaxed);
        });

    let _connection = connect_ready(&client, 9520);

    assert!(
        wait_until(Duration::from_secs(5), || {
            peer.attaches.load(Ordering::Relaxed) == 1
        }),
        "registered peer was never attached"
    );
    assert_eq!(fallback_hits.load(Ordering::Relaxed), 0);

    client.shutdown().unwrap();
    server.shutdown().unwrap();
}

/// An accept from an unknown address goes through the fallback, which
/// plays the "new client peer" factory.
#[test]
fn unknown_inbound_goes_to_fallback() {
    let server = start_server(9521);
    let client = start_client();

    let fallback_hits = Arc::new(AtomicUsize::new(0));
    let hits = fallback_hits.clone();
    server
        .registry()
        .set_fallback(move |connection| {
            assert!(connection.is_alive());
            hits.fetch_add(1, Ordering::Relaxed);
        });

    let _connection = connect_ready(&client, 9521);

    assert!(
        wait_until(Duration::from_secs(5), || {
            fallback_hits.load(Ordering::Relaxed) == 1
        }),
        "fallback was never invoked"
    );

    client.shutdown().unwrap();
    server.shutdown().unwrap();
}
