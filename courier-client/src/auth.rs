//! The authentication operation shell and the backend seam.
//!
//! Authentication itself is RPC traffic outside the connection core; the
//! controller only creates an [`AuthOperation`], dispatches it to the
//! [`Backend`], and reacts to its completion and `auth_code_required`
//! signal.

use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::operation::PendingOperation;

/// What the auth operation asks the backend to do when started.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthRunMethod {
    /// Fresh sign-in: request an auth code for the user to enter.
    RequestAuthCode,
    /// Resume a stored session without user interaction.
    CheckAuthorization,
}

/// External collaborators of the controller: DC-config fetching, data sync
/// and the actual authentication RPC flows.
pub trait Backend: Send + Sync {
    /// Fetch the server configuration and store it in the data storage.
    fn fetch_dc_config(&self) -> Arc<PendingOperation>;

    /// Synchronize application data after sign-in.
    fn sync(&self) -> Arc<PendingOperation>;

    /// Drive the code-based sign-in flow for `operation`. The backend calls
    /// [`AuthOperation::notify_auth_code_required`] when the user must act,
    /// marks the connection `Signed` and finishes the operation.
    fn request_auth_code(&self, operation: AuthOperation);

    /// Validate a resumed session for `operation`; same completion duties
    /// as [`request_auth_code`](Self::request_auth_code).
    fn check_authorization(&self, operation: AuthOperation);
}

type CodeRequiredCallback = Box<dyn FnOnce() + Send>;

struct AuthInner {
    operation:                Arc<PendingOperation>,
    authenticated_connection: Mutex<Option<Connection>>,
    code_required_callbacks:  Mutex<Vec<CodeRequiredCallback>>,
}

/// An asynchronous authentication attempt.
#[derive(Clone)]
pub struct AuthOperation {
    inner: Arc<AuthInner>,
}

impl AuthOperation {
    pub fn new(backend: Arc<dyn Backend>, run_method: AuthRunMethod) -> Self {
        let auth = Self {
            inner: Arc::new(AuthInner {
                operation:                PendingOperation::new("auth"),
                authenticated_connection: Mutex::new(None),
                code_required_callbacks:  Mutex::new(Vec::new()),
            }),
        };
        let weak = Arc::downgrade(&auth.inner);
        auth.inner.operation.set_runner(move |_operation| {
            let Some(inner) = weak.upgrade() else { return };
            let auth = AuthOperation { inner };
            match run_method {
                AuthRunMethod::RequestAuthCode => backend.request_auth_code(auth),
                AuthRunMethod::CheckAuthorization => backend.check_authorization(auth),
            }
        });
        auth
    }

    /// An attempt that fails on the next event-loop turn; used for
    /// prerequisite violations.
    pub fn already_failed(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(AuthInner {
                operation:                PendingOperation::failed("auth", text),
                authenticated_connection: Mutex::new(None),
                code_required_callbacks:  Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn operation(&self) -> &Arc<PendingOperation> {
        &self.inner.operation
    }

    pub fn start_later(&self) {
        self.inner.operation.start_later();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.operation.is_finished()
    }

    pub fn is_succeeded(&self) -> bool {
        self.inner.operation.is_succeeded()
    }

    /// The connection the backend authenticated, available once the
    /// operation succeeds.
    pub fn authenticated_connection(&self) -> Option<Connection> {
        self.inner.authenticated_connection.lock().unwrap().clone()
    }

    pub fn set_authenticated_connection(&self, connection: Connection) {
        *self.inner.authenticated_connection.lock().unwrap() = Some(connection);
    }

    pub fn on_auth_code_required(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner
            .code_required_callbacks
            .lock()
            .unwrap()
            .push(Box::new(callback));
    }

    /// Called by the backend when user credentials are needed.
    pub fn notify_auth_code_required(&self) {
        let callbacks: Vec<_> =
            std::mem::take(&mut *self.inner.code_required_callbacks.lock().unwrap());
        for callback in callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for AuthOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthOperation({:?})", self.inner.operation)
    }
}
