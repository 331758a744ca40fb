//! A single-DC session: one transport, one send helper, and the DH and RPC
//! layers bound together behind a status machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use courier_crypto::AuthKey;
use courier_mtproto::{
    peek_auth_key_id, DhLayer, DhState, PendingRpcOperation, RpcLayer, RsaKey, SendHelper,
};
use tokio::sync::{mpsc, watch};

use crate::dc::DcOption;
use crate::transport::{TransportEvent, TransportHandle, TransportState};

/// A server-sent frame of exactly this size carries a transport-level
/// error code instead of an MTProto message.
const CONNECTION_ERROR_SIZE: usize = 4;

/// Per-DC connection state, driven by transport and DH events.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Disconnecting,
    /// Set on `connect_to_dc()`, never bypassed.
    Connecting,
    /// Set on transport connected, never bypassed.
    Connected,
    /// Set when the key is available: right away when one was installed,
    /// otherwise when the DH exchange completes.
    HasDhKey,
    /// Set by the auth operation once the session is authorized.
    Signed,
    /// Terminal until the owner destroys the connection.
    Failed,
}

/// Why a status transition happened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StatusReason {
    #[default]
    None,
    Local,
    Remote,
    Timeout,
}

/// Creates the DH and RPC layers for a new connection, sharing its send
/// helper. Implemented by the embedder; the layers themselves are outside
/// the connection core.
pub trait LayerFactory: Send + Sync {
    fn create_dh_layer(&self, send_helper: &Arc<SendHelper>) -> Arc<dyn DhLayer>;
    fn create_rpc_layer(&self, send_helper: &Arc<SendHelper>) -> Arc<dyn RpcLayer>;
}

struct ConnectionInner {
    dc_option:         Mutex<DcOption>,
    transport:         TransportHandle,
    send_helper:       Arc<SendHelper>,
    dh_layer:          Arc<dyn DhLayer>,
    rpc_layer:         Arc<dyn RpcLayer>,
    rsa_key:           Mutex<RsaKey>,
    status:            Mutex<(ConnectionStatus, StatusReason)>,
    subscribers:       Mutex<Vec<mpsc::UnboundedSender<(ConnectionStatus, StatusReason)>>>,
    queued_operations: Mutex<Vec<Arc<PendingRpcOperation>>>,
    timed_out:         AtomicBool,
}

/// Cheap-to-clone handle to one DC session. The controller owns the
/// lifetime; dropping the last handle tears the transport down.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Connection {
    /// Bind a transport and the two protocol layers into a session and
    /// start its event driver.
    pub fn new(
        transport: TransportHandle,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        send_helper: Arc<SendHelper>,
        dh_layer: Arc<dyn DhLayer>,
        rpc_layer: Arc<dyn RpcLayer>,
    ) -> Self {
        send_helper.bind_sink(Arc::new(transport.clone()));
        let inner = Arc::new(ConnectionInner {
            dc_option: Mutex::new(DcOption::default()),
            transport,
            send_helper,
            dh_layer,
            rpc_layer,
            rsa_key: Mutex::new(RsaKey::default()),
            status: Mutex::new((ConnectionStatus::Disconnected, StatusReason::None)),
            subscribers: Mutex::new(Vec::new()),
            queued_operations: Mutex::new(Vec::new()),
            timed_out: AtomicBool::new(false),
        });
        let dh_states = inner.dh_layer.state_watch();
        tokio::spawn(run_driver(
            Arc::downgrade(&inner),
            transport_events,
            dh_states,
        ));
        Self { inner }
    }

    pub fn dc_option(&self) -> DcOption {
        self.inner.dc_option.lock().unwrap().clone()
    }

    pub fn set_dc_option(&self, option: DcOption) {
        *self.inner.dc_option.lock().unwrap() = option;
    }

    pub fn set_server_rsa_key(&self, key: RsaKey) {
        *self.inner.rsa_key.lock().unwrap() = key;
    }

    pub fn set_auth_key(&self, key: AuthKey) {
        self.inner.send_helper.set_auth_key(key);
    }

    pub fn auth_key(&self) -> Option<AuthKey> {
        self.inner.send_helper.auth_key()
    }

    pub fn auth_id(&self) -> u64 {
        self.inner.send_helper.auth_id()
    }

    pub fn set_delta_time(&self, seconds: i32) {
        self.inner.send_helper.set_delta_time(seconds);
    }

    pub fn delta_time(&self) -> i32 {
        self.inner.send_helper.delta_time()
    }

    pub fn send_helper(&self) -> &Arc<SendHelper> {
        &self.inner.send_helper
    }

    pub fn dh_layer(&self) -> Arc<dyn DhLayer> {
        Arc::clone(&self.inner.dh_layer)
    }

    pub fn rpc_layer(&self) -> Arc<dyn RpcLayer> {
        Arc::clone(&self.inner.rpc_layer)
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.inner.transport
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.lock().unwrap().0
    }

    /// Status transitions, in emission order, without loss.
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<(ConnectionStatus, StatusReason)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Drive the status machine. Public so the auth operation can mark the
    /// session `Signed`.
    pub fn set_status(&self, status: ConnectionStatus, reason: StatusReason) {
        self.inner.set_status(status, reason);
    }

    /// Start connecting to the configured DC endpoint. Completion is
    /// signalled through the status subscription.
    pub fn connect_to_dc(&self) {
        let option = self.dc_option();
        log::debug!("[connection] connecting to {option}");
        self.inner
            .set_status(ConnectionStatus::Connecting, StatusReason::Local);
        self.inner.transport.connect(&option.address, option.port);
    }

    pub fn disconnect(&self) {
        if self.status() != ConnectionStatus::Disconnected {
            self.inner
                .set_status(ConnectionStatus::Disconnecting, StatusReason::Local);
        }
        self.inner.transport.disconnect();
    }

    /// Re-drive the connection for a server redirect: reconnect when
    /// disconnected, then either queue the operation until the key exchange
    /// completes or resubmit it right away.
    pub fn process_see_others(&self, operation: Arc<PendingRpcOperation>) {
        if operation.is_finished() {
            log::debug!("[connection] see_others for a completed operation, ignoring");
            return;
        }
        if self.status() == ConnectionStatus::Disconnected {
            self.connect_to_dc();
        }
        if self.inner.dh_layer.state() != DhState::HasKey {
            log::debug!("[connection] see_others: queueing operation until the key is ready");
            self.inner.queued_operations.lock().unwrap().push(operation);
            return;
        }
        let message_id = self.inner.rpc_layer.send_rpc(operation);
        log::debug!("[connection] see_others: operation resent with id {message_id}");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection({}, {:?})",
            self.inner.dc_option.lock().unwrap(),
            self.status()
        )
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

impl ConnectionInner {
    fn status(&self) -> ConnectionStatus {
        self.status.lock().unwrap().0
    }

    fn set_status(&self, status: ConnectionStatus, reason: StatusReason) {
        {
            let mut current = self.status.lock().unwrap();
            if current.0 == status {
                return;
            }
            log::debug!(
                "[connection] status {:?} -> {status:?} ({reason:?})",
                current.0
            );
            *current = (status, reason);
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send((status, reason)).is_ok());
        match status {
            ConnectionStatus::Failed => self.rpc_layer.on_connection_failed(),
            ConnectionStatus::HasDhKey => self.on_has_dh_key(),
            _ => {}
        }
    }

    /// Entry actions for `HasDhKey`: make sure a session exists, propagate
    /// the freshly learned salt, and flush operations queued by
    /// `process_see_others`.
    fn on_has_dh_key(&self) {
        if self.rpc_layer.session_id() == 0 {
            self.rpc_layer.start_new_session();
        }
        if self.dh_layer.state() == DhState::HasKey {
            self.rpc_layer.set_server_salt(self.dh_layer.server_salt());
        }
        let queued: Vec<_> = std::mem::take(&mut *self.queued_operations.lock().unwrap());
        for operation in queued {
            let message_id = self.rpc_layer.send_rpc(operation);
            log::debug!("[connection] dequeued operation sent with id {message_id}");
        }
    }

    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.handle_transport_state(state),
            TransportEvent::PacketReceived(payload) => self.process_packet(&payload),
            TransportEvent::Error(error) => {
                log::warn!("[connection] transport error: {error}");
            }
            TransportEvent::Timeout => {
                log::warn!("[connection] transport timed out");
                self.timed_out.store(true, Ordering::Relaxed);
            }
        }
    }

    fn handle_transport_state(&self, state: TransportState) {
        match state {
            TransportState::Connected => {
                self.set_status(ConnectionStatus::Connected, StatusReason::Remote);
                if self.send_helper.auth_id() == 0 {
                    self.dh_layer
                        .set_server_rsa_key(self.rsa_key.lock().unwrap().clone());
                    self.dh_layer.init();
                } else {
                    self.set_status(ConnectionStatus::HasDhKey, StatusReason::Local);
                }
            }
            TransportState::Unconnected => {
                let reason = if self.status() == ConnectionStatus::Disconnecting {
                    StatusReason::Local
                } else if self.timed_out.swap(false, Ordering::Relaxed) {
                    StatusReason::Timeout
                } else {
                    StatusReason::Remote
                };
                self.set_status(ConnectionStatus::Disconnected, reason);
            }
            _ => {}
        }
    }

    fn process_packet(&self, payload: &[u8]) {
        if payload.len() == CONNECTION_ERROR_SIZE {
            let code = i32::from_le_bytes(payload.try_into().unwrap());
            if self.status() == ConnectionStatus::Failed {
                // Replies to messages sent before the failure still arrive;
                // no point shouting about them.
                log::debug!("[connection] error code {code} on an already failed connection");
                return;
            }
            log::warn!("[connection] connection error from server: {code}");
            self.set_status(ConnectionStatus::Failed, StatusReason::Remote);
            return;
        }
        let Some(auth_key_id) = peek_auth_key_id(payload) else {
            log::warn!(
                "[connection] received packet is too small to process ({} bytes)",
                payload.len()
            );
            return;
        };
        if auth_key_id != 0 {
            if auth_key_id != self.send_helper.auth_id() {
                log::debug!("[connection] received incorrect auth id");
                return;
            }
            if !self.rpc_layer.process_packet(payload) {
                log::debug!("[connection] unable to process an RPC packet");
            }
        } else if !self.dh_layer.process_plain_packet(payload) {
            log::debug!("[connection] unable to process a plain packet");
        }
    }

    fn handle_dh_state(&self, state: DhState) {
        log::debug!("[connection] DH state changed: {state:?}");
        match state {
            DhState::HasKey => self.set_status(ConnectionStatus::HasDhKey, StatusReason::Remote),
            DhState::Failed => self.set_status(ConnectionStatus::Failed, StatusReason::Remote),
            _ => {}
        }
    }
}

async fn run_driver(
    inner: Weak<ConnectionInner>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut dh_states: watch::Receiver<DhState>,
) {
    let mut dh_open = true;
    loop {
        tokio::select! {
            event = transport_events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_transport_event(event);
            }
            result = dh_states.changed(), if dh_open => {
                match result {
                    Ok(()) => {
                        let state = *dh_states.borrow_and_update();
                        let Some(inner) = inner.upgrade() else { break };
                        inner.handle_dh_state(state);
                    }
                    Err(_) => dh_open = false,
                }
            }
        }
    }
}
