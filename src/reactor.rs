//! The I/O worker: one thread multiplexing readiness over every live
//! socket, the inbound listener and the command channel.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::connection::{
    ConnectProgress, ConnectState, Connection, ReadOutcome, Shared, Transport, WriteOutcome,
};
use crate::dispatcher::ConnectionTable;
use crate::registry::EndpointRegistry;
use crate::Config;

/// Reserved token used for waking the reactor event loop.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// Reserved token for the inbound listener.
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// How often idle buffer capacity is clawed back.
const SHRINK_INTERVAL: Duration = Duration::from_secs(30);

/// Commands accepted by the reactor from other threads.
pub(crate) enum Command {
    /// Drive a nonblocking connect for this pre-built connection state.
    Connect(Arc<Shared>),
}

/// One slab slot: a transport plus its scheduling state.
///
/// `carry_read`/`carry_write` keep budget-limited work alive across ticks.
/// Readiness notifications are edge-style, so readiness observed but not
/// fully consumed must be remembered, not rediscovered.
struct Slot {
    transport: Transport<TcpStream>,
    interest: Option<Interest>,
    connecting: bool,
    carry_read: bool,
    carry_write: bool,
}

impl Slot {
    fn shared(&self) -> &Arc<Shared> {
        self.transport.shared()
    }
}

pub(crate) struct Reactor {
    pub(crate) poll: Poll,
    pub(crate) waker: Arc<Waker>,
    pub(crate) config: Config,
    pub(crate) commands: Receiver<Command>,
    pub(crate) connections: ConnectionTable,
    pub(crate) registry: Arc<EndpointRegistry>,
    pub(crate) stop: Arc<AtomicBool>,
}

impl Reactor {
    /// Runs the event loop until the stop flag is raised or the poll itself
    /// fails. Per-connection failures never propagate here.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let mut listener = match self.config.bind_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr.into())?;
                self.poll
                    .registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                log::info!("listening at {addr}");
                Some(listener)
            }
            None => None,
        };

        let mut slots: Slab<Slot> = Slab::with_capacity(16);
        let mut events = Events::with_capacity(1024);
        let mut scratch = vec![0u8; self.config.read_chunk_size];
        let mut last_shrink = Instant::now();

        loop {
            let carryover = slots.iter().any(|(_, s)| s.carry_read || s.carry_write);
            let timeout = if carryover {
                Duration::ZERO
            } else {
                self.config.tick
            };

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            if self.stop.load(Ordering::Relaxed) {
                self.teardown(slots);
                return Ok(());
            }

            for command in self.commands.try_iter() {
                match command {
                    Command::Connect(shared) => self.start_connect(&mut slots, shared),
                }
            }

            for event in &events {
                match event.token() {
                    WAKE_TOKEN => {
                        log::trace!("waker event");
                    }
                    LISTENER_TOKEN => {
                        if let Some(listener) = listener.as_mut() {
                            self.accept_inbound(listener, &mut slots);
                        }
                    }
                    token => {
                        if let Some(slot) = slots.get_mut(token.0) {
                            slot.carry_read |= event.is_readable();
                            slot.carry_write |= event.is_writable();
                        } else {
                            log::trace!("spurious event for stale token {}", token.0);
                        }
                    }
                }
            }

            for (key, slot) in slots.iter_mut() {
                Self::drive(&self.config, key, slot, &mut scratch);
            }

            self.sweep(&mut slots);
            self.sync_interests(&mut slots);

            if last_shrink.elapsed() > SHRINK_INTERVAL {
                for (_, slot) in slots.iter_mut() {
                    slot.transport.shrink_buffers();
                }
                last_shrink = Instant::now();
            }
        }
    }

    /// Issues a nonblocking connect and tracks the pending socket.
    fn start_connect(&self, slots: &mut Slab<Slot>, shared: Arc<Shared>) {
        let addr = shared.addr();
        if !has_slot(slots.vacant_key()) {
            log::warn!("{addr}: too many connections are open, refusing connect");
            shared.set_state(ConnectState::Refused);
            shared.close_read(true);
            shared.close_write();
            return;
        }

        let stream = match TcpStream::connect(addr.into()) {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("{addr}: connect failed: {err}");
                shared.set_state(ConnectState::Refused);
                shared.close_read(true);
                shared.close_write();
                return;
            }
        };

        match self.add_slot(slots, stream, shared, true, Interest::WRITABLE) {
            Ok(token) => log::debug!("{addr}: connect in progress (slot {token})"),
            Err(err) => log::warn!("{addr}: could not register connect: {err}"),
        }
    }

    /// Accepts everything currently queued on the listener.
    fn accept_inbound(&self, listener: &mut TcpListener, slots: &mut Slab<Slot>) {
        loop {
            if !has_slot(slots.vacant_key()) {
                log::warn!("too many connections are open, leaving inbound queued");
                break;
            }

            match listener.accept() {
                Ok((stream, addr)) => {
                    let SocketAddr::V4(addr) = addr else {
                        log::debug!("{addr}: dropping non-IPv4 inbound connection");
                        continue;
                    };

                    let shared = Shared::new(
                        addr,
                        ConnectState::Connected,
                        self.config.data_queue_limit,
                        self.waker.clone(),
                    );

                    match self.add_slot(slots, stream, shared.clone(), false, Interest::READABLE)
                    {
                        Ok(token) => {
                            log::info!("{addr}: accepted inbound connection (slot {token})");
                            self.registry
                                .route_inbound(*addr.ip(), Connection::new(shared));
                        }
                        Err(err) => log::warn!("{addr}: could not register accept: {err}"),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("accept error: {err}");
                    break;
                }
            }
        }
    }

    fn add_slot(
        &self,
        slots: &mut Slab<Slot>,
        mut stream: TcpStream,
        shared: Arc<Shared>,
        connecting: bool,
        interest: Interest,
    ) -> io::Result<usize> {
        let vacancy = slots.vacant_entry();
        let token = Token(vacancy.key());

        self.poll.registry().register(&mut stream, token, interest)?;

        vacancy.insert(Slot {
            transport: Transport::new(stream, shared.clone(), self.config.max_packet_size),
            interest: Some(interest),
            connecting,
            carry_read: false,
            carry_write: false,
        });

        self.connections
            .write()
            .expect("connection table poisoned")
            .insert(token.0, shared);

        Ok(token.0)
    }

    /// Consumes one slot's pending readiness within this tick's budgets.
    fn drive(config: &Config, key: usize, slot: &mut Slot, scratch: &mut [u8]) {
        slot.transport.sync_closes();

        if slot.connecting {
            if !slot.carry_write && !slot.carry_read {
                return;
            }
            slot.carry_write = false;
            slot.carry_read = false;

            match slot.transport.check_connect() {
                Ok(ConnectProgress::Connected) => {
                    log::info!("{}: connected (slot {key})", slot.shared().addr());
                    slot.connecting = false;
                    // Packets enqueued while connecting start flushing now.
                    slot.carry_write = true;
                }
                Ok(ConnectProgress::StillConnecting) => return,
                Ok(ConnectProgress::Refused(err)) | Err(err) => {
                    log::info!("{}: connect refused: {err}", slot.shared().addr());
                    slot.shared().set_state(ConnectState::Refused);
                    slot.shared().close_read(true);
                    slot.shared().close_write();
                    return;
                }
            }
        }

        if slot.carry_read {
            match slot.transport.read(scratch, config.read_chunk_size) {
                ReadOutcome::Progress { budget_exhausted } => {
                    slot.carry_read = budget_exhausted;
                }
                ReadOutcome::WouldBlock | ReadOutcome::Closed => slot.carry_read = false,
            }
        }

        if slot.carry_write {
            match slot.transport.write(config.write_chunk_size) {
                WriteOutcome::Progress { written, more } => {
                    log::trace!(
                        "{}: wrote {written} bytes, more: {more}",
                        slot.shared().addr()
                    );
                    slot.carry_write = more;
                }
                WriteOutcome::Closed => slot.carry_write = false,
            }
        }
    }

    /// Detaches connections that are no longer alive: both halves closed
    /// and the incoming queue drained.
    fn sweep(&self, slots: &mut Slab<Slot>) {
        let mut dead = Vec::new();
        for (key, slot) in slots.iter_mut() {
            slot.transport.sync_closes();
            if !slot.shared().is_alive() {
                dead.push(key);
            }
        }

        if dead.is_empty() {
            return;
        }

        let mut table = self.connections.write().expect("connection table poisoned");
        for key in dead {
            let mut slot = slots.remove(key);
            table.remove(&key);
            if let Err(err) = self.poll.registry().deregister(slot.transport.socket_mut()) {
                log::warn!("{}: deregister failed: {err}", slot.shared().addr());
            }
            log::info!("{}: connection removed (slot {key})", slot.shared().addr());
        }
    }

    /// Brings each socket's registered interest in line with what the
    /// connection currently wants.
    fn sync_interests(&self, slots: &mut Slab<Slot>) {
        for (key, slot) in slots.iter_mut() {
            let desired = if slot.connecting {
                Some(Interest::WRITABLE)
            } else {
                let wants_read = slot.shared().wants_read();
                let wants_write = slot.shared().wants_write() || slot.carry_write;
                match (wants_read, wants_write) {
                    (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
                    (true, false) => Some(Interest::READABLE),
                    (false, true) => Some(Interest::WRITABLE),
                    (false, false) => None,
                }
            };

            if desired == slot.interest {
                continue;
            }

            let registry = self.poll.registry();
            let addr = slot.shared().addr();
            let result = match desired {
                Some(interest) => {
                    registry.reregister(slot.transport.socket_mut(), Token(key), interest)
                }
                None => registry.deregister(slot.transport.socket_mut()),
            };

            match result {
                Ok(()) => slot.interest = desired,
                Err(err) => log::warn!("{addr}: reregister failed: {err}"),
            }
        }
    }

    /// Final pass on shutdown: flush what can be flushed without blocking,
    /// then close every socket.
    fn teardown(&self, mut slots: Slab<Slot>) {
        log::debug!("reactor: stopping with {} live connections", slots.len());
        for (_, slot) in slots.iter_mut() {
            slot.transport.final_flush(self.config.write_chunk_size);
        }
    }
}

/// Checks if another connection can be tracked. Connection tokens come from
/// the slab's next vacant key and must stay below the reserved listener and
/// waker tokens.
#[inline(always)]
fn has_slot(next_key: usize) -> bool {
    next_key < LISTENER_TOKEN.0
}
