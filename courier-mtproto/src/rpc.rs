//! Contract consumed from the encrypted RPC layer.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::message::MessageId;

/// Client identification sent with `initConnection`.
#[derive(Clone, Debug, Default)]
pub struct AppInformation {
    pub app_id:        u32,
    pub app_hash:      String,
    pub app_version:   String,
    pub device_info:   String,
    pub os_info:       String,
    pub language_code: String,
}

/// Receiver for server-pushed updates decoded by the RPC layer.
pub trait UpdatesHandler: Send + Sync {
    fn process_updates(&self, payload: &[u8]) -> bool;
}

/// A single RPC request in flight: the serialized call plus its completion.
///
/// The RPC layer stamps the outgoing message id on submission; a server
/// redirect (`see_others`) may re-submit the same operation on another
/// connection, which assigns a fresh id. Completion fires once; late
/// replies to a completed operation are dropped by the layer.
pub struct PendingRpcOperation {
    request:  Vec<u8>,
    state:    Mutex<RpcOperationState>,
    done_tx:  watch::Sender<bool>,
    done_rx:  watch::Receiver<bool>,
}

#[derive(Default)]
struct RpcOperationState {
    message_id: Option<MessageId>,
    reply:      Option<Vec<u8>>,
    finished:   bool,
}

impl PendingRpcOperation {
    pub fn new(request: Vec<u8>) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            request,
            state: Mutex::new(RpcOperationState::default()),
            done_tx,
            done_rx,
        })
    }

    pub fn request_data(&self) -> &[u8] {
        &self.request
    }

    /// The id assigned on the most recent submission, if any.
    pub fn message_id(&self) -> Option<MessageId> {
        self.state.lock().unwrap().message_id
    }

    /// Called by the RPC layer when the operation is (re)submitted.
    pub fn set_message_id(&self, id: MessageId) {
        self.state.lock().unwrap().message_id = Some(id);
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    /// Deliver the reply. A second delivery is a logged no-op.
    pub fn set_reply(&self, reply: Vec<u8>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                log::warn!("[rpc-op] reply delivered to an already finished operation");
                return;
            }
            state.reply = Some(reply);
            state.finished = true;
        }
        let _ = self.done_tx.send(true);
    }

    pub fn reply(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().reply.clone()
    }

    /// Wait until the reply arrives.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for PendingRpcOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PendingRpcOperation({} bytes, finished: {})",
            self.request.len(),
            self.is_finished()
        )
    }
}

/// What the connection needs from the encrypted RPC layer.
pub trait RpcLayer: Send + Sync {
    /// The current session id; zero before a session is started.
    fn session_id(&self) -> u64;

    /// Open a fresh session (new session id, message counters reset).
    fn start_new_session(&self);

    fn set_server_salt(&self, salt: u64);

    /// Resume a stored session instead of starting a new one.
    fn set_session_data(&self, session_id: u64, content_related_messages_number: u32);

    /// Wrap and transmit the operation; returns the assigned message id.
    fn send_rpc(&self, operation: Arc<PendingRpcOperation>) -> MessageId;

    /// Handle an encrypted frame (`auth_key_id != 0`). Returns `false` when
    /// the frame could not be processed.
    fn process_packet(&self, payload: &[u8]) -> bool;

    fn set_app_information(&self, app_information: AppInformation);

    fn install_updates_handler(&self, handler: Arc<dyn UpdatesHandler>);

    /// Invoked when the owning connection enters its failed state.
    fn on_connection_failed(&self);
}
