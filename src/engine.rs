//! The engine facade: owns the reactor and dispatcher threads and exposes
//! the caller-facing surface (connect, handler registration, shutdown).

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mio::{Poll, Waker};

use crate::codec::CodecError;
use crate::connection::{ConnectState, Connection, Shared};
use crate::dispatcher::{ConnectionTable, Dispatcher, HandlerTable};
use crate::reactor::{Command, Reactor, WAKE_TOKEN};
use crate::registry::EndpointRegistry;
use crate::Config;

/// A running protocol engine: one reactor thread doing socket I/O and one
/// dispatch thread running registered handlers.
///
/// Dropping the engine stops both threads; [`shutdown`](Engine::shutdown)
/// does the same but waits for them and reports how the reactor ended.
pub struct Engine {
    waker: Arc<Waker>,
    commands: Sender<Command>,
    handlers: Arc<HandlerTable>,
    registry: Arc<EndpointRegistry>,
    connections: ConnectionTable,
    stop: Arc<AtomicBool>,
    data_queue_limit: usize,
    shutdown_timeout: Duration,
    reactor_thread: Option<JoinHandle<io::Result<()>>>,
    dispatcher_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Starts the engine. The listener (if configured) is bound by the
    /// reactor thread on its first tick.
    pub fn start(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let handlers = Arc::new(HandlerTable::new());
        let registry = Arc::new(EndpointRegistry::new());
        let connections = ConnectionTable::default();
        let stop = Arc::new(AtomicBool::new(false));

        let reactor = Reactor {
            poll,
            waker: waker.clone(),
            config: config.clone(),
            commands: command_rx,
            connections: connections.clone(),
            registry: registry.clone(),
            stop: stop.clone(),
        };
        let reactor_thread = std::thread::Builder::new()
            .name("mulelink-reactor".into())
            .spawn(move || {
                let result = reactor.run();
                if let Err(err) = &result {
                    log::error!("reactor stopped with an error: {err}");
                }
                result
            })?;

        let dispatcher = Dispatcher {
            connections: connections.clone(),
            handlers: handlers.clone(),
            stop: stop.clone(),
            tick: config.tick,
        };
        let dispatcher_thread = std::thread::Builder::new()
            .name("mulelink-dispatch".into())
            .spawn(move || dispatcher.run())?;

        Ok(Self {
            waker,
            commands: command_tx,
            handlers,
            registry,
            connections,
            stop,
            data_queue_limit: config.data_queue_limit,
            shutdown_timeout: config.shutdown_timeout,
            reactor_thread: Some(reactor_thread),
            dispatcher_thread: Some(dispatcher_thread),
        })
    }

    /// Registers a decoder and handler for one (protocol, opcode) pair.
    /// The decoder turns a raw payload into a structured value; the handler
    /// runs on the dispatch thread with that value and the connection the
    /// packet arrived on. Re-registering replaces the previous pair.
    pub fn register<T, D, H>(&self, protocol: u8, opcode: u8, decoder: D, handler: H)
    where
        D: Fn(&[u8]) -> Result<T, CodecError> + Send + Sync + 'static,
        H: Fn(T, &Connection) + Send + Sync + 'static,
    {
        self.handlers.register(protocol, opcode, decoder, handler);
    }

    /// Starts a nonblocking connect and returns the handle immediately.
    /// The handle reports [`ConnectState::InProgress`] until the reactor
    /// resolves the attempt; packets may be enqueued right away and are
    /// flushed once the socket is up.
    ///
    /// An error here means the engine itself is gone, not that the peer is
    /// unreachable — peer refusal surfaces as [`ConnectState::Refused`].
    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> io::Result<Connection> {
        let addr = SocketAddrV4::new(ip, port);
        let shared = Shared::new(
            addr,
            ConnectState::InProgress,
            self.data_queue_limit,
            self.waker.clone(),
        );

        self.commands
            .send(Command::Connect(shared.clone()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reactor is gone"))?;
        self.waker.wake()?;

        Ok(Connection::new(shared))
    }

    /// The IPv4 peer registry consulted on inbound accepts.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Number of connections the reactor currently tracks.
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connection table poisoned")
            .len()
    }

    /// Stops both workers, waiting up to the configured shutdown timeout
    /// for each. A thread that fails to stop in time is detached rather
    /// than joined; that is logged and otherwise ignored.
    pub fn shutdown(mut self) -> io::Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();

        let deadline = Instant::now() + self.shutdown_timeout;
        let reactor_result = match Self::join_by(self.reactor_thread.take(), deadline) {
            Some(result) => result.unwrap_or(Ok(())),
            None => {
                log::warn!("reactor did not stop in time, detaching");
                Ok(())
            }
        };

        if Self::join_by(self.dispatcher_thread.take(), deadline).is_none() {
            log::warn!("dispatcher did not stop in time, detaching");
        }

        reactor_result
    }

    /// Joins a worker thread, giving up at the deadline.
    fn join_by<T>(handle: Option<JoinHandle<T>>, deadline: Instant) -> Option<Option<T>> {
        let handle = handle?;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Some(handle.join().ok())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}
