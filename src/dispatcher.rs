//! The dispatch worker: drains framed packets off every live connection and
//! runs the registered (protocol, opcode) handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::codec::CodecError;
use crate::connection::{Connection, Shared};
use crate::packet::{
    Packet, PROTO_EDONKEY, PROTO_EMULE_EXT, PROTO_KADEMLIA, PROTO_KADEMLIA_PACKED,
    PROTO_PACKED,
};

/// The connection table: written only by the reactor, iterated by the
/// dispatcher. Keyed by the reactor's slab index.
pub(crate) type ConnectionTable = Arc<RwLock<FxHashMap<usize, Arc<Shared>>>>;

type Entry = Arc<dyn Fn(&[u8], &Connection) -> Result<(), CodecError> + Send + Sync>;

enum Dispatch {
    Done,
    Missing,
    DecodeFailed(CodecError),
    Panicked,
}

/// Registered decoders and handlers, keyed by (protocol, opcode).
///
/// Registration composes the caller's decoder and handler into one closure,
/// so the structured value each decoder produces stays statically typed per
/// registration.
#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: RwLock<FxHashMap<(u8, u8), Entry>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register<T, D, H>(&self, protocol: u8, opcode: u8, decoder: D, handler: H)
    where
        D: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
        H: Fn(T, &Connection) + Send + Sync + 'static,
    {
        let entry: Entry = Arc::new(move |payload, connection| {
            let value = decoder(payload)?;
            handler(value, connection);
            Ok(())
        });
        self.entries
            .write()
            .expect("handler table lock poisoned")
            .insert((protocol, opcode), entry);
    }

    fn dispatch(
        &self,
        protocol: u8,
        opcode: u8,
        payload: &[u8],
        connection: &Connection,
    ) -> Dispatch {
        // Clone the entry out so handlers can register handlers without
        // deadlocking on the table lock.
        let entry = {
            let entries = self.entries.read().expect("handler table lock poisoned");
            match entries.get(&(protocol, opcode)) {
                Some(entry) => entry.clone(),
                None => return Dispatch::Missing,
            }
        };

        match catch_unwind(AssertUnwindSafe(|| entry(payload, connection))) {
            Ok(Ok(())) => Dispatch::Done,
            Ok(Err(err)) => Dispatch::DecodeFailed(err),
            Err(_) => Dispatch::Panicked,
        }
    }
}

/// Validates and routes one framed packet. Returns whether the packet was
/// handled (or deliberately ignored). A frame whose length no longer
/// matches its header closes the connection for reading; every other
/// failure affects only the packet, never the worker.
pub(crate) fn process_packet(
    frame: &[u8],
    connection: &Connection,
    handlers: &HandlerTable,
) -> bool {
    let addr = connection.remote_addr();

    let Some(packet) = Packet::from_frame(frame) else {
        // Malformed on redelivery gets the same treatment as an oversized
        // frame at the framer: drop it and stop reading from that peer.
        log::warn!("{addr}: frame length mismatch, closing read half");
        connection.close_read(false);
        return false;
    };

    match packet.protocol {
        PROTO_EDONKEY | PROTO_EMULE_EXT => {
            match handlers.dispatch(packet.protocol, packet.opcode, &packet.payload, connection)
            {
                Dispatch::Done => true,
                Dispatch::Missing => {
                    log::debug!(
                        "{addr}: no handler for 0x{:02x}/0x{:02x}",
                        packet.protocol,
                        packet.opcode
                    );
                    true
                }
                Dispatch::DecodeFailed(err) => {
                    log::debug!(
                        "{addr}: dropping 0x{:02x}/0x{:02x}: {err}",
                        packet.protocol,
                        packet.opcode
                    );
                    false
                }
                Dispatch::Panicked => {
                    log::error!(
                        "{addr}: handler for 0x{:02x}/0x{:02x} panicked",
                        packet.protocol,
                        packet.opcode
                    );
                    false
                }
            }
        }
        PROTO_PACKED | PROTO_KADEMLIA | PROTO_KADEMLIA_PACKED => {
            log::debug!(
                "{addr}: unsupported protocol 0x{:02x}, ignoring",
                packet.protocol
            );
            true
        }
        other => {
            log::warn!("{addr}: unknown protocol 0x{other:02x}");
            false
        }
    }
}

/// The dispatch worker loop. Runs on its own thread until the stop flag is
/// raised, throttled to the shared tick so an idle engine stays cheap.
pub(crate) struct Dispatcher {
    pub(crate) connections: ConnectionTable,
    pub(crate) handlers: Arc<HandlerTable>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) tick: Duration,
}

impl Dispatcher {
    pub(crate) fn run(self) {
        log::debug!("dispatcher: running");

        while !self.stop.load(Ordering::Relaxed) {
            let started = Instant::now();

            let snapshot: Vec<Arc<Shared>> = {
                let table = self.connections.read().expect("connection table poisoned");
                table.values().cloned().collect()
            };

            for shared in snapshot {
                let connection = Connection::new(shared.clone());
                while let Ok(frame) = shared.incoming_rx.try_recv() {
                    process_packet(&frame, &connection, &self.handlers);
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.tick {
                std::thread::sleep(self.tick - elapsed);
            }
        }

        log::debug!("dispatcher: stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codec::{read_tag_list, Reader, Tag, TagValue};
    use crate::connection::ConnectState;

    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex;

    fn connection() -> (mio::Poll, Connection) {
        let poll = mio::Poll::new().unwrap();
        let waker =
            Arc::new(mio::Waker::new(poll.registry(), mio::Token(0)).unwrap());
        let shared = Shared::new(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4662),
            ConnectState::Connected,
            64,
            waker,
        );
        (poll, Connection::new(shared))
    }

    #[test]
    fn registered_handler_receives_decoded_value() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        let seen: Arc<Mutex<Vec<Vec<Tag>>>> = Arc::default();

        let sink = seen.clone();
        handlers.register(
            PROTO_EDONKEY,
            0x40,
            |payload| Ok(read_tag_list(&mut Reader::new(payload))),
            move |tags, _conn| sink.lock().unwrap().push(tags),
        );

        let tags = vec![Tag::new(0x01, TagValue::String("shared.mp3".into()))];
        let mut payload = Vec::new();
        crate::codec::write_tag_list(&mut payload, &tags, true).unwrap();
        let frame = Packet::new(PROTO_EDONKEY, 0x40, payload).to_bytes();

        assert!(process_packet(&frame, &conn, &handlers));
        assert_eq!(seen.lock().unwrap().as_slice(), &[tags]);
    }

    #[test]
    fn missing_handler_is_not_fatal() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        let frame = Packet::new(PROTO_EMULE_EXT, 0x99, vec![1, 2]).to_bytes();
        assert!(process_packet(&frame, &conn, &handlers));
    }

    #[test]
    fn unsupported_protocols_are_ignored_not_failed() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        for protocol in [PROTO_PACKED, PROTO_KADEMLIA, PROTO_KADEMLIA_PACKED] {
            let frame = Packet::new(protocol, 0x01, Vec::new()).to_bytes();
            assert!(process_packet(&frame, &conn, &handlers));
        }
    }

    #[test]
    fn unknown_protocol_fails() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        let frame = Packet::new(0x42, 0x01, Vec::new()).to_bytes();
        assert!(!process_packet(&frame, &conn, &handlers));
    }

    #[test]
    fn length_mismatch_drops_and_closes_read() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        let mut frame = Packet::new(PROTO_EDONKEY, 0x01, vec![5; 8]).to_bytes();
        frame.pop();

        assert!(!process_packet(&frame, &conn, &handlers));
        assert!(!conn.wants_read(), "read half must close on a bad length");
        // The write half is untouched; only reading from the peer stops.
        assert!(conn.is_alive());
    }

    #[test]
    fn decode_error_drops_only_the_packet() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        handlers.register(
            PROTO_EDONKEY,
            0x40,
            |payload| {
                Reader::new(payload).read_u32()?;
                Ok(())
            },
            |_: (), _conn| {},
        );

        let bad = Packet::new(PROTO_EDONKEY, 0x40, vec![1]).to_bytes();
        assert!(!process_packet(&bad, &conn, &handlers));

        let good = Packet::new(PROTO_EDONKEY, 0x40, vec![1, 0, 0, 0]).to_bytes();
        assert!(process_packet(&good, &conn, &handlers));
    }

    #[test]
    fn handler_panic_is_contained() {
        let (_poll, conn) = connection();
        let handlers = HandlerTable::new();
        handlers.register(
            PROTO_EDONKEY,
            0x13,
            |_payload| Ok(()),
            |_: (), _conn| panic!("boom"),
        );

        let frame = Packet::new(PROTO_EDONKEY, 0x13, Vec::new()).to_bytes();
        assert!(!process_packet(&frame, &conn, &handlers));
    }
}
