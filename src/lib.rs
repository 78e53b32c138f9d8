//! # ed2k networking engine
//!
//! Mulelink is the transport and wire-protocol core of an eDonkey2000/eMule
//! client. It owns the TCP plumbing for many concurrent peers — a
//! nonblocking reactor, per-connection packet framing, prioritized outbound
//! queues — plus the codec for the network's extensible tag format and the
//! ed2k file-hash primitive. It deliberately knows nothing about sessions:
//! parsed packets are handed to caller-registered handlers keyed on
//! (protocol, opcode), and what they mean is the caller's business.
//!
//! Two worker threads cooperate: the reactor multiplexes socket readiness
//! and moves bytes, and the dispatcher drains framed packets into handlers.
//! Every handle the engine gives out is safe to use from any thread.
//!
//! ```no_run
//! use mulelink::{Config, Engine};
//! use mulelink::codec::{read_tag_list, Reader};
//! use mulelink::packet::PROTO_EDONKEY;
//!
//! # fn main() -> std::io::Result<()> {
//! let engine = Engine::start(Config::listen_default())?;
//!
//! engine.register(
//!     PROTO_EDONKEY,
//!     0x40,
//!     |payload| Ok(read_tag_list(&mut Reader::new(payload))),
//!     |tags, connection| {
//!         println!("{} sent {} tags", connection.remote_addr(), tags.len());
//!     },
//! );
//!
//! let peer = engine.connect("176.103.48.36".parse().unwrap(), 4661)?;
//! peer.enqueue(PROTO_EDONKEY, 0x01, vec![], true).ok();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod hash;
pub mod packet;

mod connection;
mod dispatcher;
mod engine;
mod packet_stream;
mod reactor;
mod registry;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

pub use connection::{ConnectState, Connection, EnqueueError};
pub use engine::Engine;
pub use registry::{Endpoint, EndpointRegistry};

use packet::DEFAULT_TCP_PORT;

/// Configuration parameters for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the reactor listens for inbound connections, if anywhere.
    pub bind_addr: Option<SocketAddrV4>,

    /// Capacity of each connection's bulk-data queue. Enqueues beyond it
    /// are refused so a slow peer cannot grow memory without bound. The
    /// control queue is never capped.
    pub data_queue_limit: usize,

    /// Largest accepted payload. A peer announcing more is treated as
    /// malformed and stops being read.
    pub max_packet_size: usize,

    /// Per-connection read budget for one reactor pass.
    pub read_chunk_size: usize,

    /// Per-connection write budget for one reactor pass.
    pub write_chunk_size: usize,

    /// Worker loop period. Both workers block or sleep so one tick never
    /// spins faster than this while idle.
    pub tick: Duration,

    /// How long [`Engine::shutdown`] waits for each worker thread.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: None,
            data_queue_limit: 256,
            max_packet_size: 10 * 1024 * 1024,
            read_chunk_size: 16 * 1024,
            write_chunk_size: 16 * 1024,
            tick: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// A default configuration that also listens on the network's
    /// conventional TCP port, 4662, on all interfaces.
    pub fn listen_default() -> Self {
        Self::listen_on(DEFAULT_TCP_PORT)
    }

    /// A default configuration listening on `port` on all interfaces.
    pub fn listen_on(port: u16) -> Self {
        Self {
            bind_addr: Some(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            ..Self::default()
        }
    }
}
