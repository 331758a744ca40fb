//! Shared test doubles: scripted transports, DH/RPC layer mocks and a
//! backend that signs everything it is asked to.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_client::{
    AuthOperation, Connection, ConnectionController, ConnectionStatus, DcOption, LayerFactory,
    PendingOperation, SessionType, Settings, StatusReason, TransportEvent, TransportFactory,
    TransportHandle,
};
use courier_crypto::AuthKey;
use courier_mtproto::{
    AppInformation, DhLayer, DhState, MessageId, PendingRpcOperation, RpcLayer, RsaKey,
    SendHelper, UpdatesHandler,
};
use tokio::sync::{mpsc, watch};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5 seconds");
}

pub fn test_rsa_key() -> RsaKey {
    RsaKey {
        modulus:     vec![0xC0, 0xDE],
        exponent:    vec![1, 0, 1],
        fingerprint: 0xFEED,
    }
}

pub fn test_settings(servers: Vec<DcOption>) -> Settings {
    let mut settings = Settings::new(servers, test_rsa_key());
    settings.set_ping_interval(Duration::from_millis(50));
    settings
}

pub fn test_auth_key() -> AuthKey {
    AuthKey::from_bytes([0x5A; 256])
}

// ─── Transport double ─────────────────────────────────────────────────────────

/// Observation point for one scripted transport.
pub struct TransportProbe {
    /// Inject events as if the socket produced them.
    pub events:       mpsc::UnboundedSender<TransportEvent>,
    pub connected_to: Mutex<Option<(String, u16)>>,
    pub packets:      Mutex<Vec<Vec<u8>>>,
}

/// Creates scripted transports: `script(attempt_index)` decides whether a
/// connect attempt reaches `Connected` or drops straight back.
pub struct MockTransportFactory {
    script:   Arc<dyn Fn(usize) -> bool + Send + Sync>,
    attempts: Arc<AtomicUsize>,
    probes:   Mutex<Vec<Arc<TransportProbe>>>,
}

impl MockTransportFactory {
    pub fn new(script: impl Fn(usize) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script:   Arc::new(script),
            attempts: Arc::new(AtomicUsize::new(0)),
            probes:   Mutex::new(Vec::new()),
        })
    }

    pub fn always_up() -> Arc<Self> {
        Self::new(|_| true)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn probe(&self, index: usize) -> Option<Arc<TransportProbe>> {
        self.probes.lock().unwrap().get(index).cloned()
    }

    pub fn latest_probe(&self) -> Option<Arc<TransportProbe>> {
        self.probes.lock().unwrap().last().cloned()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.lock().unwrap().len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.probes
            .lock()
            .unwrap()
            .iter()
            .filter_map(|probe| {
                probe
                    .connected_to
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|(address, _)| address.clone())
            })
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create_transport(
        &self,
        _session_type: SessionType,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let (handle, mut commands) = TransportHandle::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let probe = Arc::new(TransportProbe {
            events:       events_tx.clone(),
            connected_to: Mutex::new(None),
            packets:      Mutex::new(Vec::new()),
        });
        self.probes.lock().unwrap().push(Arc::clone(&probe));
        let script = Arc::clone(&self.script);
        let attempts = Arc::clone(&self.attempts);
        tokio::spawn(async move {
            use courier_client::TransportCommand;
            use courier_client::TransportState;
            while let Some(command) = commands.recv().await {
                match command {
                    TransportCommand::Connect { address, port } => {
                        *probe.connected_to.lock().unwrap() = Some((address, port));
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                        let _ = events_tx.send(TransportEvent::StateChanged(
                            TransportState::Connecting,
                        ));
                        let state = if script(attempt) {
                            TransportState::Connected
                        } else {
                            TransportState::Unconnected
                        };
                        let _ = events_tx.send(TransportEvent::StateChanged(state));
                    }
                    TransportCommand::SendPacket(payload) => {
                        probe.packets.lock().unwrap().push(payload);
                    }
                    TransportCommand::Disconnect => {
                        let _ = events_tx.send(TransportEvent::StateChanged(
                            TransportState::Disconnecting,
                        ));
                        let _ = events_tx.send(TransportEvent::StateChanged(
                            TransportState::Unconnected,
                        ));
                    }
                }
            }
        });
        (handle, events_rx)
    }
}

// ─── Layer doubles ────────────────────────────────────────────────────────────

pub struct MockDhLayer {
    state_tx:    watch::Sender<DhState>,
    send_helper: Arc<SendHelper>,
    init_called: AtomicBool,
    salt:        AtomicU64,
}

impl MockDhLayer {
    pub fn new(send_helper: Arc<SendHelper>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DhState::Idle);
        Arc::new(Self {
            state_tx,
            send_helper,
            init_called: AtomicBool::new(false),
            salt: AtomicU64::new(0),
        })
    }

    pub fn init_called(&self) -> bool {
        self.init_called.load(Ordering::SeqCst)
    }

    /// Pretend the exchange finished: install a key on the send helper and
    /// flip the state.
    pub fn complete_key_exchange(&self, salt: u64) {
        self.send_helper.set_auth_key(test_auth_key());
        self.salt.store(salt, Ordering::SeqCst);
        let _ = self.state_tx.send(DhState::HasKey);
    }

    pub fn fail(&self) {
        let _ = self.state_tx.send(DhState::Failed);
    }
}

impl DhLayer for MockDhLayer {
    fn state(&self) -> DhState {
        *self.state_tx.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<DhState> {
        self.state_tx.subscribe()
    }

    fn set_server_rsa_key(&self, _key: RsaKey) {}

    fn init(&self) {
        self.init_called.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(DhState::PqRequested);
    }

    fn process_plain_packet(&self, _payload: &[u8]) -> bool {
        true
    }

    fn server_salt(&self) -> u64 {
        self.salt.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockRpcLayer {
    session_id:       AtomicU64,
    server_salt:      AtomicU64,
    pub sent:         Mutex<Vec<Arc<PendingRpcOperation>>>,
    pub processed:    Mutex<Vec<Vec<u8>>>,
    pub session_data: Mutex<Option<(u64, u32)>>,
    failed:           AtomicBool,
    next_id:          AtomicU64,
}

impl MockRpcLayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }

    pub fn connection_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl RpcLayer for MockRpcLayer {
    fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::SeqCst)
    }

    fn start_new_session(&self) {
        self.session_id.store(0x5E55_1014, Ordering::SeqCst);
    }

    fn set_server_salt(&self, salt: u64) {
        self.server_salt.store(salt, Ordering::SeqCst);
    }

    fn set_session_data(&self, session_id: u64, content_related_messages_number: u32) {
        self.session_id.store(session_id, Ordering::SeqCst);
        *self.session_data.lock().unwrap() =
            Some((session_id, content_related_messages_number));
    }

    fn send_rpc(&self, operation: Arc<PendingRpcOperation>) -> MessageId {
        let id = MessageId((self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1) << 2);
        operation.set_message_id(id);
        self.sent.lock().unwrap().push(operation);
        id
    }

    fn process_packet(&self, payload: &[u8]) -> bool {
        self.processed.lock().unwrap().push(payload.to_vec());
        true
    }

    fn set_app_information(&self, _app_information: AppInformation) {}

    fn install_updates_handler(&self, _handler: Arc<dyn UpdatesHandler>) {}

    fn on_connection_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockLayerFactory {
    dh_layers:  Mutex<Vec<Arc<MockDhLayer>>>,
    rpc_layers: Mutex<Vec<Arc<MockRpcLayer>>>,
}

impl MockLayerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dh(&self, index: usize) -> Option<Arc<MockDhLayer>> {
        self.dh_layers.lock().unwrap().get(index).cloned()
    }

    pub fn latest_dh(&self) -> Option<Arc<MockDhLayer>> {
        self.dh_layers.lock().unwrap().last().cloned()
    }

    pub fn latest_rpc(&self) -> Option<Arc<MockRpcLayer>> {
        self.rpc_layers.lock().unwrap().last().cloned()
    }
}

impl LayerFactory for MockLayerFactory {
    fn create_dh_layer(&self, send_helper: &Arc<SendHelper>) -> Arc<dyn DhLayer> {
        let layer = MockDhLayer::new(Arc::clone(send_helper));
        self.dh_layers.lock().unwrap().push(Arc::clone(&layer));
        layer
    }

    fn create_rpc_layer(&self, _send_helper: &Arc<SendHelper>) -> Arc<dyn RpcLayer> {
        let layer = MockRpcLayer::new();
        self.rpc_layers.lock().unwrap().push(Arc::clone(&layer));
        layer
    }
}

// ─── Backend double ───────────────────────────────────────────────────────────

/// A backend that signs whatever connection the controller is driving.
#[derive(Default)]
pub struct MockBackend {
    pub controller:  Mutex<Option<ConnectionController>>,
    config_fetched:  AtomicUsize,
    checked_in:      AtomicUsize,
    codes_requested: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, controller: &ConnectionController) {
        *self.controller.lock().unwrap() = Some(controller.clone());
    }

    pub fn config_fetches(&self) -> usize {
        self.config_fetched.load(Ordering::SeqCst)
    }

    pub fn check_ins(&self) -> usize {
        self.checked_in.load(Ordering::SeqCst)
    }

    pub fn codes_requested(&self) -> usize {
        self.codes_requested.load(Ordering::SeqCst)
    }

    fn sign(&self, operation: &AuthOperation) {
        let connection: Option<Connection> = self
            .controller
            .lock()
            .unwrap()
            .as_ref()
            .and_then(ConnectionController::default_connection);
        match connection {
            Some(connection) => {
                operation.set_authenticated_connection(connection.clone());
                connection.set_status(ConnectionStatus::Signed, StatusReason::Remote);
                operation.operation().set_finished();
            }
            None => operation
                .operation()
                .set_finished_with_error(courier_client::ErrorDetails::from_text(
                    "no connection to sign",
                )),
        }
    }
}

impl courier_client::Backend for MockBackend {
    fn fetch_dc_config(&self) -> Arc<PendingOperation> {
        self.config_fetched.fetch_add(1, Ordering::SeqCst);
        PendingOperation::with_runner("dc-config", |operation| operation.set_finished())
    }

    fn sync(&self) -> Arc<PendingOperation> {
        PendingOperation::with_runner("sync", |operation| operation.set_finished())
    }

    fn request_auth_code(&self, operation: AuthOperation) {
        self.codes_requested.fetch_add(1, Ordering::SeqCst);
        operation.notify_auth_code_required();
        self.sign(&operation);
    }

    fn check_authorization(&self, operation: AuthOperation) {
        self.checked_in.fetch_add(1, Ordering::SeqCst);
        self.sign(&operation);
    }
}
