//! MTProto message identifiers, the outgoing send helper, and the contracts
//! the connection core consumes from the DH and RPC layers.
//!
//! The DH arithmetic and the encrypted RPC envelope live behind the
//! [`DhLayer`] and [`RpcLayer`] traits; this crate defines what the
//! connection needs from them and nothing more.

#![deny(unsafe_code)]

mod dh;
mod message;
mod rpc;
mod sender;

pub use dh::{DhLayer, DhState, RsaKey};
pub use message::{peek_auth_key_id, MessageId, PlainMessage};
pub use rpc::{AppInformation, PendingRpcOperation, RpcLayer, UpdatesHandler};
pub use sender::{PackageSink, SendHelper, SendMode};
