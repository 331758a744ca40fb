//! TCP framing transport for MTProto, in the abridged and obfuscated
//! variants.
//!
//! The transport is an actor: [`TcpTransport::spawn`] returns a cloneable
//! [`TransportHandle`] for commands and a receiver of [`TransportEvent`]s.
//! Framing and read reassembly live in [`PacketAssembler`] and
//! [`encode_abridged`], which are pure and tested independently of any
//! socket.

use std::io;
use std::time::Duration;

use courier_crypto::obfuscation::{self, PROTO_TAG_ABRIDGED};
use courier_crypto::AesCtrContext;
use courier_mtproto::PackageSink;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::errors::{TransportError, TransportErrorKind};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_CHUNK_SIZE: usize = 8192;

/// Socket lifecycle. Advances monotonically apart from the
/// `Disconnecting` → `Unconnected` terminal step, and restarts from
/// `Unconnected` on reconnect.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportState {
    #[default]
    Unconnected,
    HostLookup,
    Connecting,
    Connected,
    Disconnecting,
}

/// Framing variant. Established exactly once per transport activation,
/// before any framed packet is transmitted or accepted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionType {
    #[default]
    Unknown,
    Abridged,
    Obfuscated,
}

/// Which direction the 64-byte crypto source keys as-is; the opposite
/// direction uses the byte-reversed copy. Clients write with the direct
/// material, servers read with it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceRevertion {
    DirectIsReadReversedIsWrite,
    DirectIsWriteReversedIsRead,
}

/// Notifications from the transport actor.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    PacketReceived(Vec<u8>),
    Error(TransportError),
    Timeout,
}

/// Commands accepted by a transport actor.
#[derive(Debug)]
pub enum TransportCommand {
    Connect { address: String, port: u16 },
    SendPacket(Vec<u8>),
    Disconnect,
}

/// Cloneable command side of a transport actor.
#[derive(Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportHandle {
    /// A raw command channel for alternative transport actors (tests, future
    /// proxied transports). [`TcpTransport::spawn`] wires one internally.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { commands }, rx)
    }

    pub fn connect(&self, address: &str, port: u16) {
        let _ = self.commands.send(TransportCommand::Connect {
            address: address.to_string(),
            port,
        });
    }

    pub fn send_packet(&self, payload: Vec<u8>) {
        let _ = self.commands.send(TransportCommand::SendPacket(payload));
    }

    pub fn disconnect(&self) {
        let _ = self.commands.send(TransportCommand::Disconnect);
    }
}

impl PackageSink for TransportHandle {
    fn send_package(&self, payload: Vec<u8>) {
        self.send_packet(payload);
    }
}

/// Creates a transport per connection; the seam the controller uses so
/// tests can substitute scripted transports.
pub trait TransportFactory: Send + Sync {
    fn create_transport(
        &self,
        session_type: SessionType,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>);
}

/// The default factory: plain TCP sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create_transport(
        &self,
        session_type: SessionType,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        TcpTransport::spawn(session_type)
    }
}

// ─── Framing ──────────────────────────────────────────────────────────────────

/// Frame a payload with the abridged length prefix: one byte `len/4` below
/// 0x7F, otherwise `0x7F` followed by `len/4` as a 24-bit little-endian
/// integer.
pub fn encode_abridged(payload: &[u8]) -> Vec<u8> {
    let words = payload.len() / 4;
    let mut package = Vec::with_capacity(payload.len() + 4);
    if words < 0x7f {
        package.push(words as u8);
    } else {
        package.push(0x7f);
        package.push((words & 0xff) as u8);
        package.push(((words >> 8) & 0xff) as u8);
        package.push(((words >> 16) & 0xff) as u8);
    }
    package.extend_from_slice(payload);
    package
}

/// The peer sent a length byte that cannot start a frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FramingError {
    pub length_byte: u8,
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid packet size byte {:#04x}", self.length_byte)
    }
}

impl std::error::Error for FramingError {}

/// Incremental abridged-frame reader.
///
/// Holds at most one partial frame: either no header has been parsed yet
/// and the buffer holds fewer than 4 bytes of it, or `expected_length` is
/// known and the buffer holds less than a full frame.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    buffer:          Vec<u8>,
    expected_length: usize,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append incoming bytes and extract every complete frame. The split of
    /// the byte stream across calls does not affect the emitted frames or
    /// their order.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
        self.buffer.extend_from_slice(bytes);
        let mut packets = Vec::new();
        while self.buffer.len() >= 4 {
            if self.expected_length == 0 {
                let length_byte = self.buffer[0];
                if length_byte < 0x7f {
                    self.expected_length = usize::from(length_byte) * 4;
                    self.buffer.drain(..1);
                } else if length_byte == 0x7f {
                    let words = usize::from(self.buffer[1])
                        | usize::from(self.buffer[2]) << 8
                        | usize::from(self.buffer[3]) << 16;
                    self.expected_length = words * 4;
                    self.buffer.drain(..4);
                } else {
                    return Err(FramingError { length_byte });
                }
            }
            if self.buffer.len() < self.expected_length {
                return Ok(packets);
            }
            let frame: Vec<u8> = self.buffer.drain(..self.expected_length).collect();
            self.expected_length = 0;
            packets.push(frame);
        }
        Ok(packets)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.expected_length = 0;
    }
}

// ─── TcpTransport ─────────────────────────────────────────────────────────────

/// What the read pump observed on the socket, tagged with the socket
/// generation so signals from a torn-down socket are ignored.
enum SocketSignal {
    Data(u64, Vec<u8>),
    Closed(u64),
    Error(u64, io::Error),
}

/// The TCP transport actor. Owns the socket, the per-direction cipher
/// contexts and the read reassembly buffer; driven entirely by commands
/// and read-pump signals, so all handlers run on its single task.
pub struct TcpTransport {
    state:          TransportState,
    session_type:   SessionType,
    preferred_type: SessionType,
    assembler:      PacketAssembler,
    read_ctx:       Option<AesCtrContext>,
    write_ctx:      Option<AesCtrContext>,
    writer:         Option<OwnedWriteHalf>,
    reader_task:    Option<tokio::task::JoinHandle<()>>,
    socket_tx:      mpsc::UnboundedSender<SocketSignal>,
    generation:     u64,
    events:         mpsc::UnboundedSender<TransportEvent>,
}

impl TcpTransport {
    /// Spawn the actor. `preferred_type` selects the framing activated on
    /// every connect; `Unknown` falls back to obfuscated with a warning.
    pub fn spawn(
        preferred_type: SessionType,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let preferred_type = match preferred_type {
            SessionType::Unknown => {
                log::warn!("[transport] session type is not set, falling back to obfuscated");
                SessionType::Obfuscated
            }
            other => other,
        };
        let (handle, commands) = TransportHandle::channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: TransportState::Unconnected,
            session_type: SessionType::Unknown,
            preferred_type,
            assembler: PacketAssembler::new(),
            read_ctx: None,
            write_ctx: None,
            writer: None,
            reader_task: None,
            socket_tx,
            generation: 0,
            events,
        };
        tokio::spawn(transport.run(commands, socket_rx));
        (handle, events_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<TransportCommand>,
        mut socket_rx: mpsc::UnboundedReceiver<SocketSignal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect();
                        return;
                    }
                },
                signal = socket_rx.recv() => match signal {
                    Some(signal) => self.handle_socket_signal(signal),
                    None => return,
                },
            }
        }
    }

    async fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Connect { address, port } => self.handle_connect(address, port).await,
            TransportCommand::SendPacket(payload) => self.handle_send(payload).await,
            TransportCommand::Disconnect => self.disconnect(),
        }
    }

    async fn handle_connect(&mut self, address: String, port: u16) {
        if self.writer.is_some() {
            self.disconnect();
        }
        if address.parse::<std::net::IpAddr>().is_err() {
            self.set_state(TransportState::HostLookup);
        }
        self.set_state(TransportState::Connecting);
        log::debug!("[transport] connecting to {address}:{port}");

        let connect = TcpStream::connect((address.as_str(), port));
        match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Err(_elapsed) => {
                log::warn!("[transport] connect to {address}:{port} timed out");
                self.emit(TransportEvent::Timeout);
                self.set_state(TransportState::Unconnected);
            }
            Ok(Err(error)) => {
                self.emit(TransportEvent::Error(TransportError::new(
                    TransportErrorKind::ConnectionFailed,
                    error.to_string(),
                )));
                self.set_state(TransportState::Unconnected);
            }
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                self.writer = Some(writer);
                self.assembler.clear();
                self.spawn_read_pump(reader);
                if let Err(error) = self.activate_session().await {
                    self.socket_error(error);
                    return;
                }
                self.set_state(TransportState::Connected);
            }
        }
    }

    fn spawn_read_pump(&mut self, mut reader: OwnedReadHalf) {
        self.generation += 1;
        let generation = self.generation;
        let socket_tx = self.socket_tx.clone();
        self.reader_task = Some(tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => {
                        let _ = socket_tx.send(SocketSignal::Closed(generation));
                        return;
                    }
                    Ok(n) => {
                        let data = chunk[..n].to_vec();
                        if socket_tx.send(SocketSignal::Data(generation, data)).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = socket_tx.send(SocketSignal::Error(generation, error));
                        return;
                    }
                }
            }
        }));
    }

    /// Send the framing announcement and bind the session type. For the
    /// obfuscated variant this also installs both cipher directions and
    /// transmits the 64-byte header, its tail already encrypted.
    async fn activate_session(&mut self) -> io::Result<()> {
        match self.preferred_type {
            SessionType::Abridged => {
                self.write_raw(&[0xef]).await?;
                self.session_type = SessionType::Abridged;
            }
            SessionType::Obfuscated | SessionType::Unknown => {
                let nonce = obfuscation::generate_client_nonce(PROTO_TAG_ABRIDGED)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "getrandom failed"))?;
                self.set_crypto_source(&nonce, SourceRevertion::DirectIsWriteReversedIsRead);
                // The peer expects the write keystream to start at the header
                // itself: encrypt all 64 bytes, transmit bytes 56..64 of the
                // ciphertext and the rest in clear.
                let mut header = nonce;
                let mut encrypted = nonce;
                if let Some(ctx) = self.write_ctx.as_mut() {
                    ctx.crypt_in_place(&mut encrypted);
                }
                header[56..].copy_from_slice(&encrypted[56..]);
                self.write_raw(&header).await?;
                self.session_type = SessionType::Obfuscated;
                log::debug!("[transport] obfuscated handshake sent");
            }
        }
        Ok(())
    }

    /// Install the per-direction cipher contexts from a 64-byte packed
    /// source: one direction keyed from the bytes as given, the other from
    /// the byte-reversed copy, selected by `revertion`.
    pub fn set_crypto_source(&mut self, source: &[u8; 64], revertion: SourceRevertion) {
        let direct = obfuscation::extract_source(source);
        let reversed = obfuscation::extract_reversed_source(source);
        let (read_source, write_source, read_label, write_label) = match revertion {
            SourceRevertion::DirectIsReadReversedIsWrite => {
                (direct, reversed, "server read", "server write")
            }
            SourceRevertion::DirectIsWriteReversedIsRead => {
                (reversed, direct, "client read", "client write")
            }
        };
        self.read_ctx = Some(obfuscation::context_from_source(read_source, read_label));
        self.write_ctx = Some(obfuscation::context_from_source(write_source, write_label));
    }

    async fn handle_send(&mut self, payload: Vec<u8>) {
        if self.writer.is_none() {
            log::error!("[transport] send_packet while not connected, dropping packet");
            return;
        }
        if payload.len() % 4 != 0 {
            // Legacy behavior: complain loudly but transmit anyway.
            log::error!(
                "[transport] invalid outgoing packet, payload size {} is not divisible by four",
                payload.len()
            );
        }
        let mut package = encode_abridged(&payload);
        if let Some(ctx) = self.write_ctx.as_mut() {
            if ctx.has_key() {
                ctx.crypt_in_place(&mut package);
            }
        }
        if let Err(error) = self.write_raw(&package).await {
            self.socket_error(error);
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.write_all(bytes).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        }
    }

    fn handle_socket_signal(&mut self, signal: SocketSignal) {
        let current = self.generation;
        match signal {
            SocketSignal::Data(generation, data) if generation == current => {
                self.process_incoming(&data);
            }
            SocketSignal::Closed(generation) if generation == current => {
                log::debug!("[transport] remote closed the connection");
                self.teardown();
                self.set_state(TransportState::Unconnected);
            }
            SocketSignal::Error(generation, error) if generation == current => {
                self.socket_error(error);
            }
            // Signals from a socket that has already been torn down.
            _ => {}
        }
    }

    fn process_incoming(&mut self, bytes: &[u8]) {
        if self.session_type == SessionType::Unknown {
            log::error!("[transport] bytes received with unknown session type");
            return;
        }
        let data = match self.read_ctx.as_mut() {
            Some(ctx) if ctx.has_key() => ctx.crypt(bytes),
            _ => bytes.to_vec(),
        };
        match self.assembler.feed(&data) {
            Ok(packets) => {
                for packet in packets {
                    log::debug!("[transport] received a packet ({} bytes)", packet.len());
                    self.emit(TransportEvent::PacketReceived(packet));
                }
            }
            Err(error) => {
                log::warn!("[transport] {error}");
                self.emit(TransportEvent::Error(TransportError::new(
                    TransportErrorKind::InvalidFrame,
                    error.to_string(),
                )));
                self.disconnect();
            }
        }
    }

    fn socket_error(&mut self, error: io::Error) {
        self.emit(TransportEvent::Error(TransportError::new(
            TransportErrorKind::Io,
            error.to_string(),
        )));
        self.teardown();
        self.set_state(TransportState::Unconnected);
    }

    fn disconnect(&mut self) {
        if self.state != TransportState::Unconnected {
            self.set_state(TransportState::Disconnecting);
        }
        self.teardown();
        self.set_state(TransportState::Unconnected);
    }

    /// Drop the socket halves, the read buffer and the cipher contexts;
    /// the session type returns to `Unknown`.
    fn teardown(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        // Invalidate any signal still queued from the old socket.
        self.generation += 1;
        self.writer = None;
        self.assembler.clear();
        self.session_type = SessionType::Unknown;
        self.read_ctx = None;
        self.write_ctx = None;
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state == state {
            return;
        }
        log::debug!("[transport] state {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(TransportEvent::StateChanged(state));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}
