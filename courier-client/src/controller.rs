//! The top-level connection controller: candidate-server iteration,
//! reconnection, auth coordination, keep-alive and the per-spec connection
//! cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use courier_mtproto::{AppInformation, SendHelper, UpdatesHandler};
use tokio::sync::mpsc;

use crate::auth::{AuthOperation, AuthRunMethod, Backend};
use crate::connection::{Connection, ConnectionStatus, LayerFactory, StatusReason};
use crate::dc::{ConnectionSpec, DcOption, RequestFlags};
use crate::operation::PendingOperation;
use crate::ping::PingOperation;
use crate::settings::{PreferredSessionType, Settings};
use crate::storage::{AccountStorage, DataStorage};
use crate::transport::{SessionType, TcpTransportFactory, TransportFactory};

/// Consecutive unanswered pings before `ping_failed` is raised.
const PING_FAILURE_THRESHOLD: u32 = 3;

/// User-visible controller state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ControllerStatus {
    #[default]
    Disconnected,
    Connecting,
    /// A candidate server dropped us before the key exchange finished; the
    /// next candidate is being tried.
    WaitForReconnection,
    /// The key exchange finished; sign-in (or check-in) is required.
    WaitForAuthentication,
    /// Signed in; application data not synchronized yet.
    Connected,
    Ready,
    Disconnecting,
}

enum ControllerEvent {
    ConnectionStatus {
        id:     u64,
        status: ConnectionStatus,
        reason: StatusReason,
    },
    AuthFinished,
    AuthCodeRequired,
    SyncFinished { succeeded: bool },
    ReconnectFinished { succeeded: bool },
    PingFailed,
}

struct TrackedConnection {
    id:             u64,
    connection:     Connection,
    reached_dh_key: bool,
}

#[derive(Default)]
struct ControllerState {
    connections:        HashMap<ConnectionSpec, Connection>,
    candidates:         Vec<DcOption>,
    next_server_index:  usize,
    initial_connection: Option<TrackedConnection>,
    main_connection:    Option<TrackedConnection>,
    connect_operation:  Option<Arc<PendingOperation>>,
    auth_operation:     Option<AuthOperation>,
    ping_operation:     Option<PingOperation>,
    /// The attempt in flight redials a lost main connection; on success the
    /// controller checks in instead of waiting for user authentication.
    reconnecting:       bool,
}

struct ControllerInner {
    settings:          Settings,
    account_storage:   Option<Arc<dyn AccountStorage>>,
    data_storage:      Option<Arc<dyn DataStorage>>,
    backend:           Arc<dyn Backend>,
    transport_factory: Arc<dyn TransportFactory>,
    layer_factory:     Arc<dyn LayerFactory>,
    app_information:   Option<AppInformation>,
    updates_handler:   Option<Arc<dyn UpdatesHandler>>,
    status:            Mutex<(ControllerStatus, StatusReason)>,
    subscribers:       Mutex<Vec<mpsc::UnboundedSender<(ControllerStatus, StatusReason)>>>,
    events_tx:         mpsc::UnboundedSender<ControllerEvent>,
    state:             Mutex<ControllerState>,
    connection_seq:    AtomicU64,
}

/// Builds a [`ConnectionController`]; settings, the layer factory and the
/// backend are mandatory, everything else has defaults.
pub struct ControllerBuilder {
    settings:          Settings,
    layer_factory:     Arc<dyn LayerFactory>,
    backend:           Arc<dyn Backend>,
    account_storage:   Option<Arc<dyn AccountStorage>>,
    data_storage:      Option<Arc<dyn DataStorage>>,
    transport_factory: Arc<dyn TransportFactory>,
    app_information:   Option<AppInformation>,
    updates_handler:   Option<Arc<dyn UpdatesHandler>>,
}

impl ControllerBuilder {
    pub fn account_storage(mut self, storage: Arc<dyn AccountStorage>) -> Self {
        self.account_storage = Some(storage);
        self
    }

    pub fn data_storage(mut self, storage: Arc<dyn DataStorage>) -> Self {
        self.data_storage = Some(storage);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn app_information(mut self, app_information: AppInformation) -> Self {
        self.app_information = Some(app_information);
        self
    }

    pub fn updates_handler(mut self, handler: Arc<dyn UpdatesHandler>) -> Self {
        self.updates_handler = Some(handler);
        self
    }

    pub fn build(self) -> ConnectionController {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ControllerInner {
            settings:          self.settings,
            account_storage:   self.account_storage,
            data_storage:      self.data_storage,
            backend:           self.backend,
            transport_factory: self.transport_factory,
            layer_factory:     self.layer_factory,
            app_information:   self.app_information,
            updates_handler:   self.updates_handler,
            status:            Mutex::new((ControllerStatus::Disconnected, StatusReason::None)),
            subscribers:       Mutex::new(Vec::new()),
            events_tx,
            state:             Mutex::new(ControllerState::default()),
            connection_seq:    AtomicU64::new(0),
        });
        tokio::spawn(run_event_loop(Arc::downgrade(&inner), events_rx));
        ConnectionController { inner }
    }
}

/// Cheap-to-clone handle to the controller. All connections the controller
/// creates are owned by it; dropping the last handle tears everything down.
#[derive(Clone)]
pub struct ConnectionController {
    inner: Arc<ControllerInner>,
}

impl ConnectionController {
    pub fn builder(
        settings: Settings,
        layer_factory: Arc<dyn LayerFactory>,
        backend: Arc<dyn Backend>,
    ) -> ControllerBuilder {
        ControllerBuilder {
            settings,
            layer_factory,
            backend,
            account_storage: None,
            data_storage: None,
            transport_factory: Arc::new(TcpTransportFactory),
            app_information: None,
            updates_handler: None,
        }
    }

    pub fn status(&self) -> ControllerStatus {
        self.inner.status.lock().unwrap().0
    }

    /// Status transitions, in emission order, without loss.
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<(ControllerStatus, StatusReason)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn is_signed_in(&self) -> bool {
        matches!(
            self.status(),
            ControllerStatus::Connected | ControllerStatus::Ready
        )
    }

    pub fn main_connection(&self) -> Option<Connection> {
        self.inner
            .state
            .lock()
            .unwrap()
            .main_connection
            .as_ref()
            .map(|tracked| tracked.connection.clone())
    }

    /// The main connection when one exists, otherwise the connection of the
    /// attempt in flight.
    pub fn default_connection(&self) -> Option<Connection> {
        let state = self.inner.state.lock().unwrap();
        state
            .main_connection
            .as_ref()
            .or(state.initial_connection.as_ref())
            .map(|tracked| tracked.connection.clone())
    }

    /// Whether the keep-alive probe is currently running.
    pub fn ping_active(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .ping_operation
            .as_ref()
            .is_some_and(PingOperation::is_active)
    }

    /// Validate prerequisites and start an attempt on the first candidate
    /// server. Setup failures are returned as an already-failed operation
    /// without mutating any state.
    pub fn connect_to_server(&self) -> Arc<PendingOperation> {
        let inner = &self.inner;
        if inner.account_storage.is_none() {
            return PendingOperation::failed("connect", "Account storage is missing");
        }
        if inner.data_storage.is_none() {
            return PendingOperation::failed("connect", "Data storage is missing");
        }
        if !inner.settings.is_valid() {
            log::warn!("[controller] invalid settings");
            return PendingOperation::failed("connect", "Invalid settings");
        }

        let mut state = inner.state.lock().unwrap();
        // An attempt already under way on one of our candidates is reused.
        if let (Some(operation), Some(tracked)) =
            (&state.connect_operation, &state.initial_connection)
        {
            if inner
                .settings
                .server_configuration()
                .contains(&tracked.connection.dc_option())
            {
                match tracked.connection.status() {
                    ConnectionStatus::Connecting
                    | ConnectionStatus::Connected
                    | ConnectionStatus::HasDhKey
                    | ConnectionStatus::Signed => return Arc::clone(operation),
                    _ => tracked.connection.disconnect(),
                }
            }
        }
        if let Some(main) = &state.main_connection {
            if main.connection.status() != ConnectionStatus::Disconnected {
                return PendingOperation::failed("connect", "Connection is already in progress");
            }
        }
        ControllerInner::start_attempt(
            inner,
            &mut state,
            inner.settings.server_configuration().to_vec(),
            false,
        )
    }

    /// Begin the code-based sign-in flow. Requires
    /// [`ControllerStatus::WaitForAuthentication`].
    pub fn start_authentication(&self) -> AuthOperation {
        if self.status() != ControllerStatus::WaitForAuthentication {
            return AuthOperation::already_failed("Not waiting for authentication");
        }
        let mut state = self.inner.state.lock().unwrap();
        if state
            .auth_operation
            .as_ref()
            .is_some_and(|auth| !auth.is_finished())
        {
            return AuthOperation::already_failed("Auth operation is already in progress");
        }
        let auth = AuthOperation::new(Arc::clone(&self.inner.backend), AuthRunMethod::RequestAuthCode);
        ControllerInner::wire_auth(&self.inner, &auth);
        state.auth_operation = Some(auth.clone());
        auth.start_later();
        auth
    }

    /// Resume a stored session without re-authenticating.
    pub fn check_in(&self) -> AuthOperation {
        let mut state = self.inner.state.lock().unwrap();
        ControllerInner::check_in(&self.inner, &mut state)
    }

    /// Tear down every transport. The status settles on `Disconnected`
    /// once the main connection confirms, or immediately when there is
    /// none.
    pub fn disconnect_from_server(&self) {
        self.inner
            .set_status(ControllerStatus::Disconnecting, StatusReason::Local);
        let had_main;
        {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(ping) = state.ping_operation.take() {
                ping.ensure_inactive();
            }
            if let Some(tracked) = state.initial_connection.take() {
                tracked.connection.disconnect();
            }
            for connection in state.connections.values() {
                connection.disconnect();
            }
            had_main = state.main_connection.is_some();
            if let Some(main) = &state.main_connection {
                main.connection.disconnect();
            }
        }
        if !had_main {
            self.inner
                .set_status(ControllerStatus::Disconnected, StatusReason::Local);
        }
    }

    /// The cached connection for `spec`, or a new one built from a matching
    /// DC option in the data storage. IPv4 is forced for now.
    pub fn ensure_connection(&self, spec: ConnectionSpec) -> Option<Connection> {
        let mut forced = spec;
        forced.flags = forced.flags.with(RequestFlags::IPV4_ONLY);

        let mut state = self.inner.state.lock().unwrap();
        if let Some(connection) = state.connections.get(&spec) {
            return Some(connection.clone());
        }
        let data_storage = self.inner.data_storage.as_ref()?;
        let option = data_storage.server_configuration().get_option(forced);
        if !option.is_valid() {
            log::warn!("[controller] unable to find a suitable DC for {spec:?}");
            return None;
        }
        let connection = ControllerInner::create_connection(&self.inner, option);
        state.connections.insert(spec, connection.clone());
        Some(connection)
    }
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionController({:?})", self.status())
    }
}

impl ControllerInner {
    fn status(&self) -> ControllerStatus {
        self.status.lock().unwrap().0
    }

    fn set_status(&self, status: ControllerStatus, reason: StatusReason) {
        {
            let mut current = self.status.lock().unwrap();
            if current.0 == status {
                return;
            }
            log::debug!("[controller] status {:?} -> {status:?} ({reason:?})", current.0);
            *current = (status, reason);
        }
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send((status, reason)).is_ok());
    }

    fn create_connection(inner: &Arc<ControllerInner>, option: DcOption) -> Connection {
        let session_type = match inner.settings.preferred_session_type() {
            PreferredSessionType::None => {
                log::warn!("[controller] session type is not set, using obfuscated");
                SessionType::Obfuscated
            }
            PreferredSessionType::Abridged => SessionType::Abridged,
            PreferredSessionType::Obfuscated => SessionType::Obfuscated,
        };
        let (transport, transport_events) = inner.transport_factory.create_transport(session_type);
        let send_helper = Arc::new(SendHelper::new());
        let dh_layer = inner.layer_factory.create_dh_layer(&send_helper);
        let rpc_layer = inner.layer_factory.create_rpc_layer(&send_helper);
        if let Some(app_information) = &inner.app_information {
            rpc_layer.set_app_information(app_information.clone());
        }
        if let Some(handler) = &inner.updates_handler {
            rpc_layer.install_updates_handler(Arc::clone(handler));
        }
        let connection =
            Connection::new(transport, transport_events, send_helper, dh_layer, rpc_layer);
        connection.set_dc_option(option);
        connection.set_server_rsa_key(inner.settings.server_rsa_key());
        if let Some(account) = &inner.account_storage {
            connection.set_delta_time(account.delta_time());
        }
        connection
    }

    /// Forward a connection's status stream into the controller event loop,
    /// tagged with a tracking id.
    fn watch_connection(inner: &Arc<ControllerInner>, connection: &Connection) -> u64 {
        let id = inner.connection_seq.fetch_add(1, Ordering::Relaxed);
        let mut status_rx = connection.subscribe_status();
        let events = inner.events_tx.clone();
        tokio::spawn(async move {
            while let Some((status, reason)) = status_rx.recv().await {
                if events
                    .send(ControllerEvent::ConnectionStatus { id, status, reason })
                    .is_err()
                {
                    break;
                }
            }
        });
        id
    }

    fn start_attempt(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        candidates: Vec<DcOption>,
        reconnecting: bool,
    ) -> Arc<PendingOperation> {
        let operation = PendingOperation::new(if reconnecting { "reconnect" } else { "connect" });
        if reconnecting {
            let events = inner.events_tx.clone();
            let weak = Arc::downgrade(&operation);
            operation.on_finished(move || {
                let succeeded = weak
                    .upgrade()
                    .map(|operation| operation.is_succeeded())
                    .unwrap_or(false);
                let _ = events.send(ControllerEvent::ReconnectFinished { succeeded });
            });
        }
        state.candidates = candidates;
        state.next_server_index = 0;
        state.connect_operation = Some(Arc::clone(&operation));
        state.reconnecting = reconnecting;
        Self::connect_to_next_server(inner, state);
        operation
    }

    /// Drop the current handshaking connection and dial the next candidate,
    /// advancing the round-robin cursor.
    fn connect_to_next_server(inner: &Arc<ControllerInner>, state: &mut ControllerState) {
        if let Some(previous) = state.initial_connection.take() {
            previous.connection.disconnect();
        }
        if state.candidates.is_empty() {
            log::error!("[controller] no candidate servers to connect to");
            return;
        }
        let option = state.candidates[state.next_server_index].clone();
        log::info!("[controller] connecting to candidate {option}");
        let connection = Self::create_connection(inner, option);
        let id = Self::watch_connection(inner, &connection);
        connection.connect_to_dc();
        state.initial_connection = Some(TrackedConnection {
            id,
            connection,
            reached_dh_key: false,
        });
        state.next_server_index = (state.next_server_index + 1) % state.candidates.len();
    }

    fn check_in(inner: &Arc<ControllerInner>, state: &mut ControllerState) -> AuthOperation {
        if state
            .auth_operation
            .as_ref()
            .is_some_and(|auth| !auth.is_finished())
        {
            return AuthOperation::already_failed("Auth operation is already in progress");
        }
        let Some(account) = inner.account_storage.clone() else {
            return AuthOperation::already_failed("No minimal account data set");
        };
        if !account.has_minimal_data_set() {
            return AuthOperation::already_failed("No minimal account data set");
        }
        let auth = AuthOperation::new(Arc::clone(&inner.backend), AuthRunMethod::CheckAuthorization);
        Self::wire_auth(inner, &auth);
        if state.main_connection.is_some() {
            auth.start_later();
        } else {
            let connect_operation = Self::ensure_attempt_for(inner, state, account.dc_info());
            if let Some(tracked) = &state.initial_connection {
                if let Some(key) = account.auth_key() {
                    tracked.connection.set_auth_key(key);
                }
                tracked.connection.rpc_layer().set_session_data(
                    account.session_id(),
                    account.content_related_messages_number(),
                );
                tracked.connection.set_delta_time(account.delta_time());
            }
            auth.operation().run_after(&connect_operation);
        }
        state.auth_operation = Some(auth.clone());
        auth
    }

    /// Reuse the in-flight attempt when it targets `option` and is still
    /// making progress; otherwise start a fresh one.
    fn ensure_attempt_for(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        option: DcOption,
    ) -> Arc<PendingOperation> {
        if let (Some(operation), Some(tracked)) =
            (&state.connect_operation, &state.initial_connection)
        {
            if tracked.connection.dc_option() == option {
                match tracked.connection.status() {
                    ConnectionStatus::Connecting
                    | ConnectionStatus::Connected
                    | ConnectionStatus::HasDhKey
                    | ConnectionStatus::Signed => return Arc::clone(operation),
                    _ => tracked.connection.disconnect(),
                }
            }
        }
        Self::start_attempt(inner, state, vec![option], false)
    }

    fn wire_auth(inner: &Arc<ControllerInner>, auth: &AuthOperation) {
        let events = inner.events_tx.clone();
        auth.operation().on_finished(move || {
            let _ = events.send(ControllerEvent::AuthFinished);
        });
        let events = inner.events_tx.clone();
        auth.on_auth_code_required(move || {
            let _ = events.send(ControllerEvent::AuthCodeRequired);
        });
    }

    fn handle_event(inner: &Arc<ControllerInner>, event: ControllerEvent) {
        match event {
            ControllerEvent::ConnectionStatus { id, status, reason } => {
                let mut state = inner.state.lock().unwrap();
                if state
                    .main_connection
                    .as_ref()
                    .is_some_and(|tracked| tracked.id == id)
                {
                    Self::handle_main_connection_status(inner, &mut state, status, reason);
                } else if state
                    .initial_connection
                    .as_ref()
                    .is_some_and(|tracked| tracked.id == id)
                {
                    Self::handle_initial_connection_status(inner, &mut state, status, reason);
                } else {
                    log::debug!("[controller] status {status:?} from a stale connection");
                }
            }
            ControllerEvent::AuthFinished => Self::handle_auth_finished(inner),
            ControllerEvent::AuthCodeRequired => {
                inner.set_status(ControllerStatus::WaitForAuthentication, StatusReason::Remote);
            }
            ControllerEvent::SyncFinished { succeeded } => {
                if succeeded {
                    inner.set_status(ControllerStatus::Ready, StatusReason::Local);
                } else {
                    log::error!("[controller] data sync failed");
                }
            }
            ControllerEvent::ReconnectFinished { succeeded } => {
                if succeeded {
                    log::info!("[controller] reconnected, checking in");
                    let mut state = inner.state.lock().unwrap();
                    let _ = Self::check_in(inner, &mut state);
                } else {
                    log::warn!("[controller] reconnect attempt failed");
                }
            }
            ControllerEvent::PingFailed => {
                // Policy: log only; reconnection on ping loss is left to the
                // server-side disconnect this ping requests.
                log::warn!("[controller] keep-alive ping failed");
            }
        }
    }

    fn handle_initial_connection_status(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        status: ConnectionStatus,
        reason: StatusReason,
    ) {
        match status {
            ConnectionStatus::Connecting => {
                inner.set_status(ControllerStatus::Connecting, StatusReason::None);
            }
            ConnectionStatus::Connected => {}
            ConnectionStatus::HasDhKey => {
                let reconnecting = state.reconnecting;
                if let Some(tracked) = state.initial_connection.as_mut() {
                    tracked.reached_dh_key = true;
                }
                // Learn the full server list for future attempts.
                let config_operation = inner.backend.fetch_dc_config();
                config_operation.start_later();
                if let Some(operation) = &state.connect_operation {
                    operation.set_finished();
                }
                if !reconnecting {
                    inner.set_status(ControllerStatus::WaitForAuthentication, StatusReason::Remote);
                }
            }
            ConnectionStatus::Signed => {
                if let Some(tracked) = state.initial_connection.take() {
                    Self::promote_to_main(inner, state, tracked);
                }
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting => {
                let reached_dh_key = state
                    .initial_connection
                    .as_ref()
                    .is_some_and(|tracked| tracked.reached_dh_key);
                if reached_dh_key {
                    // Dropped while waiting for authentication. Timeouts are
                    // remote from the user's point of view.
                    state.initial_connection = None;
                    let reason = if reason == StatusReason::Local {
                        StatusReason::Local
                    } else {
                        StatusReason::Remote
                    };
                    inner.set_status(ControllerStatus::Disconnected, reason);
                } else {
                    inner.set_status(ControllerStatus::WaitForReconnection, StatusReason::Remote);
                    Self::connect_to_next_server(inner, state);
                }
            }
            ConnectionStatus::Failed => {
                log::warn!("[controller] initial connection failed");
            }
        }
    }

    fn promote_to_main(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        tracked: TrackedConnection,
    ) {
        log::info!(
            "[controller] connection to {} signed",
            tracked.connection.dc_option()
        );
        Self::sync_account_to_storage(inner, &tracked.connection);
        state.main_connection = Some(tracked);
        Self::update_keep_alive(inner, state, ConnectionStatus::Signed);
        inner.set_status(ControllerStatus::Connected, StatusReason::None);

        let sync_operation = inner.backend.sync();
        let events = inner.events_tx.clone();
        let weak = Arc::downgrade(&sync_operation);
        sync_operation.on_finished(move || {
            let succeeded = weak
                .upgrade()
                .map(|operation| operation.is_succeeded())
                .unwrap_or(false);
            let _ = events.send(ControllerEvent::SyncFinished { succeeded });
        });
        sync_operation.start_later();
    }

    fn handle_main_connection_status(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        status: ConnectionStatus,
        _reason: StatusReason,
    ) {
        Self::update_keep_alive(inner, state, status);
        match status {
            ConnectionStatus::Disconnected => match inner.status() {
                ControllerStatus::Disconnecting => {
                    state.main_connection = None;
                    state.ping_operation = None;
                    inner.set_status(ControllerStatus::Disconnected, StatusReason::Local);
                }
                ControllerStatus::Connected | ControllerStatus::Ready => {
                    inner.set_status(ControllerStatus::Connecting, StatusReason::Remote);
                    state.ping_operation = None;
                    if let Some(main) = state.main_connection.take() {
                        let wanted_option = main.connection.dc_option();
                        log::warn!("[controller] main connection lost, redialing {wanted_option}");
                        let _ = Self::start_attempt(inner, state, vec![wanted_option], true);
                    }
                }
                _ => {}
            },
            ConnectionStatus::HasDhKey | ConnectionStatus::Signed => {}
            other => {
                log::debug!("[controller] main connection status: {other:?}");
            }
        }
    }

    fn update_keep_alive(
        inner: &Arc<ControllerInner>,
        state: &mut ControllerState,
        status: ConnectionStatus,
    ) {
        let wanted = matches!(
            status,
            ConnectionStatus::HasDhKey | ConnectionStatus::Signed
        );
        if wanted {
            if state.ping_operation.is_none() {
                if let Some(main) = &state.main_connection {
                    let ping = PingOperation::new(
                        main.connection.rpc_layer(),
                        inner.settings.ping_interval(),
                        PING_FAILURE_THRESHOLD,
                    );
                    let events = inner.events_tx.clone();
                    ping.on_ping_failed(move || {
                        let _ = events.send(ControllerEvent::PingFailed);
                    });
                    state.ping_operation = Some(ping);
                }
            }
            if let Some(ping) = &state.ping_operation {
                ping.ensure_active();
            }
        } else if let Some(ping) = &state.ping_operation {
            ping.ensure_inactive();
        }
    }

    fn handle_auth_finished(inner: &Arc<ControllerInner>) {
        let auth = inner.state.lock().unwrap().auth_operation.clone();
        let Some(auth) = auth else { return };
        if !auth.is_succeeded() {
            log::warn!(
                "[controller] authentication failed: {}",
                auth.operation().error_details()
            );
            inner.set_status(ControllerStatus::WaitForAuthentication, StatusReason::None);
            return;
        }
        let Some(connection) = auth.authenticated_connection() else {
            log::error!("[controller] auth operation succeeded without a connection");
            return;
        };
        if connection.status() != ConnectionStatus::Signed {
            log::error!(
                "[controller] unexpected authenticated connection status {:?}",
                connection.status()
            );
            return;
        }
        let mut state = inner.state.lock().unwrap();
        let already_main = state
            .main_connection
            .as_ref()
            .is_some_and(|tracked| tracked.connection == connection);
        if already_main {
            return;
        }
        if state
            .initial_connection
            .as_ref()
            .is_some_and(|tracked| tracked.connection == connection)
        {
            // The Signed status event may still be in flight; promote now.
            if let Some(tracked) = state.initial_connection.take() {
                Self::promote_to_main(inner, &mut state, tracked);
            }
        } else {
            log::warn!("[controller] authenticated connection is not tracked");
        }
    }

    fn sync_account_to_storage(inner: &Arc<ControllerInner>, connection: &Connection) {
        let Some(account) = &inner.account_storage else {
            return;
        };
        if let Some(key) = connection.auth_key() {
            account.set_auth_key(key);
        }
        account.set_dc_info(connection.dc_option());
        account.set_session_id(connection.rpc_layer().session_id());
        account.set_delta_time(connection.delta_time());
    }
}

async fn run_event_loop(
    inner: Weak<ControllerInner>,
    mut events: mpsc::UnboundedReceiver<ControllerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        ControllerInner::handle_event(&inner, event);
    }
}
