//! # courier-client
//!
//! Client-side transport and connection state machine for MTProto.
//!
//! The crate covers the lowest two layers of an MTProto client plus the
//! controller that orchestrates them:
//! - TCP framing transport in the abridged and obfuscated variants, with
//!   per-direction AES-CTR stream encryption
//! - the per-DC [`Connection`] lifecycle, from disconnected through the key
//!   exchange to an authorized, ping-kept-alive session
//! - the multi-DC [`ConnectionController`] with candidate-server iteration,
//!   reconnection and keep-alive
//! - [`PendingOperation`], the one-shot async primitive gluing it together
//!
//! The DH arithmetic, the encrypted RPC envelope and the authentication
//! RPC flows are external collaborators, consumed through the traits in
//! [`courier_mtproto`] and the [`Backend`] seam.

#![deny(unsafe_code)]

mod auth;
mod connection;
mod controller;
mod dc;
mod errors;
mod operation;
mod ping;
mod settings;
mod storage;
mod transport;

pub use auth::{AuthOperation, AuthRunMethod, Backend};
pub use connection::{Connection, ConnectionStatus, LayerFactory, StatusReason};
pub use controller::{ConnectionController, ControllerBuilder, ControllerStatus};
pub use dc::{ConnectionSpec, DcOption, DcOptionFlags, RequestFlags, ServerConfiguration};
pub use errors::{TransportError, TransportErrorKind};
pub use operation::{ErrorDetails, PendingOperation};
pub use ping::PingOperation;
pub use settings::{PreferredSessionType, Proxy, Settings};
pub use storage::{
    AccountStorage, DataStorage, InMemoryAccountStorage, InMemoryDataStorage,
};
pub use transport::{
    encode_abridged, FramingError, PacketAssembler, SessionType, SourceRevertion, TcpTransport,
    TcpTransportFactory, TransportCommand, TransportEvent, TransportFactory, TransportHandle,
    TransportState,
};
