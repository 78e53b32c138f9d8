//! Connection state shared between caller threads, the reactor and the
//! dispatcher, plus the reactor-side transport that drives the socket.
//!
//! Ownership: the reactor owns the [`Transport`] (and with it the socket);
//! everyone else holds a [`Connection`] handle backed by the same shared
//! state. The handle can enqueue outbound packets and close halves from any
//! thread; the reactor observes those flags on its next tick.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use mio::Waker;

use crate::packet::Packet;
use crate::packet_stream::PacketStream;

/// Progress of an outbound connect, observable from any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// The nonblocking connect has been issued and not yet resolved.
    InProgress,
    /// The connection is established.
    Connected,
    /// The remote end refused or the connect errored out.
    Refused,
}

impl ConnectState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::InProgress,
            1 => Self::Connected,
            _ => Self::Refused,
        }
    }
}

/// Why an enqueue was refused.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The write half has been closed; nothing further will be sent.
    #[error("connection closed for writing")]
    Closed,
    /// The bounded data queue is full. Control packets are never refused
    /// for capacity.
    #[error("data queue full")]
    Full,
}

/// State shared by the handle, the reactor and the dispatcher.
pub(crate) struct Shared {
    addr: SocketAddrV4,
    read_open: AtomicBool,
    write_open: AtomicBool,
    incoming_open: AtomicBool,
    partial_out: AtomicBool,
    state: AtomicU8,
    pub(crate) incoming_tx: Sender<Vec<u8>>,
    pub(crate) incoming_rx: Receiver<Vec<u8>>,
    control_tx: Sender<Packet>,
    pub(crate) control_rx: Receiver<Packet>,
    data_tx: Sender<Packet>,
    pub(crate) data_rx: Receiver<Packet>,
    waker: Arc<Waker>,
}

impl Shared {
    pub(crate) fn new(
        addr: SocketAddrV4,
        state: ConnectState,
        data_queue_limit: usize,
        waker: Arc<Waker>,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (data_tx, data_rx) = bounded(data_queue_limit);

        Arc::new(Self {
            addr,
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
            incoming_open: AtomicBool::new(true),
            partial_out: AtomicBool::new(false),
            state: AtomicU8::new(state as u8),
            incoming_tx,
            incoming_rx,
            control_tx,
            control_rx,
            data_tx,
            data_rx,
            waker,
        })
    }

    pub(crate) fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub(crate) fn state(&self) -> ConnectState {
        ConnectState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: ConnectState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn read_open(&self) -> bool {
        self.read_open.load(Ordering::Relaxed)
    }

    pub(crate) fn write_open(&self) -> bool {
        self.write_open.load(Ordering::Relaxed)
    }

    pub(crate) fn incoming_open(&self) -> bool {
        self.incoming_open.load(Ordering::Relaxed)
    }

    /// A connection lives while either half is open or undelivered packets
    /// remain queued for the dispatcher.
    pub(crate) fn is_alive(&self) -> bool {
        self.read_open() || self.write_open() || !self.incoming_rx.is_empty()
    }

    pub(crate) fn wants_read(&self) -> bool {
        self.read_open()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.write_open()
            && (self.partial_out.load(Ordering::Relaxed)
                || !self.control_rx.is_empty()
                || !self.data_rx.is_empty())
    }

    pub(crate) fn set_partial_out(&self, partial: bool) {
        self.partial_out.store(partial, Ordering::Relaxed);
    }

    pub(crate) fn close_read(&self, clear_incoming: bool) {
        self.read_open.store(false, Ordering::Relaxed);
        if clear_incoming {
            self.incoming_open.store(false, Ordering::Relaxed);
            while self.incoming_rx.try_recv().is_ok() {}
        }
    }

    pub(crate) fn close_write(&self) {
        self.write_open.store(false, Ordering::Relaxed);
        self.partial_out.store(false, Ordering::Relaxed);
        while self.control_rx.try_recv().is_ok() {}
        while self.data_rx.try_recv().is_ok() {}
    }

    fn wake_reactor(&self) {
        if let Err(err) = self.waker.wake() {
            log::error!("{}: reactor wake failed: {err}", self.addr);
        }
    }
}

/// A cloneable handle to one peer connection.
///
/// Handles are cheap to clone and safe to use from any thread. Enqueued
/// packets are flushed by the reactor in FIFO order per queue, control
/// before data at every packet boundary.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Queues one packet for sending. `control` selects the priority queue,
    /// which preempts bulk data at the next packet boundary.
    pub fn enqueue(
        &self,
        protocol: u8,
        opcode: u8,
        payload: Vec<u8>,
        control: bool,
    ) -> Result<(), EnqueueError> {
        if !self.shared.write_open() {
            return Err(EnqueueError::Closed);
        }

        let packet = Packet::new(protocol, opcode, payload);
        if control {
            self.shared
                .control_tx
                .send(packet)
                .map_err(|_| EnqueueError::Closed)?;
        } else {
            match self.shared.data_tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(EnqueueError::Full),
                Err(TrySendError::Disconnected(_)) => return Err(EnqueueError::Closed),
            }
        }

        self.shared.wake_reactor();
        Ok(())
    }

    /// Shuts down the read half. With `clear_incoming`, packets already
    /// framed but not yet dispatched are discarded as well.
    pub fn close_read(&self, clear_incoming: bool) {
        self.shared.close_read(clear_incoming);
        self.shared.wake_reactor();
    }

    /// Shuts down the write half and discards everything queued for it.
    /// Idempotent.
    pub fn close_write(&self) {
        self.shared.close_write();
        self.shared.wake_reactor();
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn wants_read(&self) -> bool {
        self.shared.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.shared.wants_write()
    }

    pub fn state(&self) -> ConnectState {
        self.shared.state()
    }

    pub fn remote_addr(&self) -> SocketAddrV4 {
        self.shared.addr()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.addr())
            .field("state", &self.shared.state())
            .field("alive", &self.shared.is_alive())
            .finish()
    }
}

/// Socket operations the transport needs beyond `Read + Write`. Lets the
/// transport logic run over in-memory streams in tests.
pub(crate) trait Socket: Read + Write {
    fn shutdown(&self, how: Shutdown) -> io::Result<()>;
    fn take_error(&self) -> io::Result<Option<io::Error>>;
    /// Whether the underlying socket is connected and usable.
    fn is_ready(&self) -> bool;
}

impl Socket for mio::net::TcpStream {
    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        mio::net::TcpStream::shutdown(self, how)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }

    fn is_ready(&self) -> bool {
        self.peer_addr().is_ok()
    }
}

/// Result of one read pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// Bytes arrived; `true` when the full budget was consumed and more may
    /// be waiting in the kernel.
    Progress { budget_exhausted: bool },
    WouldBlock,
    /// The read half is closed (EOF, reset, oversize frame or local close).
    Closed,
}

/// Result of one write pass.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// `more` means the budget ran out with work still queued.
    Progress { written: usize, more: bool },
    /// The write half is closed (broken pipe, reset or local close).
    Closed,
}

/// Progress of a pending outbound connect.
pub(crate) enum ConnectProgress {
    StillConnecting,
    Connected,
    Refused(io::Error),
}

/// Reactor-side owner of one socket: the framing stream plus the shared
/// connection state.
pub(crate) struct Transport<S: Socket> {
    stream: PacketStream<S>,
    shared: Arc<Shared>,
    read_shutdown_done: bool,
    write_shutdown_done: bool,
}

impl<S: Socket> Transport<S> {
    pub(crate) fn new(socket: S, shared: Arc<Shared>, max_payload: usize) -> Self {
        Self {
            stream: PacketStream::new(socket, max_payload),
            shared,
            read_shutdown_done: false,
            write_shutdown_done: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn socket(&self) -> &S {
        self.stream.inner()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut S {
        self.stream.inner_mut()
    }

    /// Checks a pending outbound connect for completion or failure.
    pub(crate) fn check_connect(&mut self) -> io::Result<ConnectProgress> {
        if let Some(err) = self.socket().take_error()? {
            return Ok(ConnectProgress::Refused(err));
        }
        if self.socket().is_ready() {
            self.shared.set_state(ConnectState::Connected);
            Ok(ConnectProgress::Connected)
        } else {
            Ok(ConnectProgress::StillConnecting)
        }
    }

    /// One read pass: a single nonblocking read of at most `budget` bytes,
    /// then frame extraction into the incoming queue.
    pub(crate) fn read(&mut self, scratch: &mut [u8], budget: usize) -> ReadOutcome {
        if !self.shared.read_open() {
            self.shutdown_read();
            return ReadOutcome::Closed;
        }

        let max = budget.min(scratch.len());
        match self.stream.read_into(&mut scratch[..max]) {
            Ok(0) => {
                log::debug!("{}: peer closed the stream", self.shared.addr());
                self.peer_gone();
                ReadOutcome::Closed
            }
            Ok(read) => {
                if self.drain_frames() {
                    ReadOutcome::Progress {
                        budget_exhausted: read == max,
                    }
                } else {
                    ReadOutcome::Closed
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
            Err(err) => {
                log::debug!("{}: read error: {err}", self.shared.addr());
                self.peer_gone();
                ReadOutcome::Closed
            }
        }
    }

    /// Slices complete frames out of the reassembly buffer. Returns `false`
    /// when an oversized frame forced the read half shut.
    fn drain_frames(&mut self) -> bool {
        loop {
            match self.stream.take_frame() {
                Ok(Some(frame)) => {
                    if self.shared.incoming_open() {
                        let _ = self.shared.incoming_tx.send(frame);
                    }
                }
                Ok(None) => return true,
                Err(err) => {
                    log::warn!("{}: {err}; closing read half", self.shared.addr());
                    self.shared.close_read(false);
                    self.shutdown_read();
                    return false;
                }
            }
        }
    }

    /// The peer is gone (end of stream or reset): both halves die. Packets
    /// already framed stay queued for the dispatcher; once it drains them
    /// the connection stops being alive and the reactor retires it.
    fn peer_gone(&mut self) {
        self.shared.close_read(false);
        self.shutdown_read();
        self.shared.close_write();
        self.teardown_write();
    }

    /// One write pass: emits queued packets until the budget runs out, the
    /// socket blocks, or the queues drain. Queue selection happens only at
    /// packet boundaries, control before data.
    pub(crate) fn write(&mut self, budget: usize) -> WriteOutcome {
        if !self.shared.write_open() {
            self.teardown_write();
            return WriteOutcome::Closed;
        }

        let mut written = 0;
        while written < budget {
            if !self.stream.has_partial_frame() {
                let next = self
                    .shared
                    .control_rx
                    .try_recv()
                    .or_else(|_| self.shared.data_rx.try_recv());
                match next {
                    Ok(packet) => self.stream.begin_frame(&packet),
                    Err(_) => break,
                }
            }

            match self.stream.write_budget(budget - written) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("{}: write error: {err}", self.shared.addr());
                    self.shared.close_write();
                    self.teardown_write();
                    return WriteOutcome::Closed;
                }
            }
        }

        self.shared.set_partial_out(self.stream.has_partial_frame());
        WriteOutcome::Progress {
            written,
            more: written == budget && self.shared.wants_write(),
        }
    }

    /// Applies locally-requested closes to the socket. Called by the
    /// reactor when it observes handle-side flag changes.
    pub(crate) fn sync_closes(&mut self) {
        if !self.shared.read_open() {
            self.shutdown_read();
        }
        if !self.shared.write_open() {
            self.teardown_write();
        }
    }

    pub(crate) fn shrink_buffers(&mut self) {
        self.stream.shrink_buffers();
    }

    /// Best-effort flush of queued packets during engine teardown.
    pub(crate) fn final_flush(&mut self, budget: usize) {
        if self.shared.write_open() {
            let _ = self.write(budget);
        }
        let _ = self.socket().shutdown(Shutdown::Both);
    }

    fn shutdown_read(&mut self) {
        if !self.read_shutdown_done {
            self.read_shutdown_done = true;
            self.stream.discard_rx();
            let _ = self.socket().shutdown(Shutdown::Read);
        }
    }

    fn teardown_write(&mut self) {
        if !self.write_shutdown_done {
            self.write_shutdown_done = true;
            self.stream.discard_tx();
            self.shared.set_partial_out(false);
            let _ = self.socket().shutdown(Shutdown::Write);
        }
    }
}
