//! Maps IPv4 addresses to known peer endpoints so inbound accepts can be
//! attached to the objects that expect them.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::connection::Connection;

/// The capability a peer object (server or client, living outside this
/// crate) exposes to the engine.
pub trait Endpoint: Send + Sync {
    /// The peer's known address.
    fn address(&self) -> SocketAddrV4;

    /// Hands the peer a fresh connection handle. Called on every accept
    /// that resolves to this peer, so it must be idempotent.
    fn attach(&self, connection: Connection);

    /// Short human-readable identity for logs.
    fn describe(&self) -> String {
        self.address().to_string()
    }
}

type Fallback = Box<dyn Fn(Connection) + Send + Sync>;

/// Registry of known peers keyed by IPv4 address.
///
/// Lookups happen on the reactor thread at accept time; inserts and removes
/// can come from anywhere.
#[derive(Default)]
pub struct EndpointRegistry {
    peers: RwLock<FxHashMap<u32, Arc<dyn Endpoint>>>,
    fallback: RwLock<Option<Fallback>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer under its address, replacing any previous entry.
    pub fn insert(&self, endpoint: Arc<dyn Endpoint>) {
        let ip = u32::from(*endpoint.address().ip());
        self.peers
            .write()
            .expect("registry lock poisoned")
            .insert(ip, endpoint);
    }

    pub fn remove(&self, ip: Ipv4Addr) -> Option<Arc<dyn Endpoint>> {
        self.peers
            .write()
            .expect("registry lock poisoned")
            .remove(&u32::from(ip))
    }

    pub fn resolve(&self, ip: Ipv4Addr) -> Option<Arc<dyn Endpoint>> {
        self.peers
            .read()
            .expect("registry lock poisoned")
            .get(&u32::from(ip))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets the handler for inbound connections from unknown addresses —
    /// typically a factory that builds a fresh client peer around the
    /// handle.
    pub fn set_fallback(&self, fallback: impl Fn(Connection) + Send + Sync + 'static) {
        *self.fallback.write().expect("registry lock poisoned") = Some(Box::new(fallback));
    }

    /// Routes an accepted connection: a known peer gets it via
    /// [`Endpoint::attach`], anyone else goes through the fallback.
    pub(crate) fn route_inbound(&self, ip: Ipv4Addr, connection: Connection) {
        if let Some(endpoint) = self.resolve(ip) {
            log::debug!("inbound {ip} attached to known peer {}", endpoint.describe());
            endpoint.attach(connection);
        } else if let Some(fallback) = self
            .fallback
            .read()
            .expect("registry lock poisoned")
            .as_ref()
        {
            log::debug!("inbound {ip} handled as a new peer");
            fallback(connection);
        } else {
            log::debug!("inbound {ip}: no registered peer, no fallback");
        }
    }
}
