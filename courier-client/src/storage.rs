//! Account and server-configuration storage contracts.
//!
//! The controller consumes these through trait objects so embedders can
//! plug their own persistence; the in-memory implementations below are the
//! default and what the tests use.

use std::sync::{Arc, Mutex};

use courier_crypto::AuthKey;

use crate::dc::{DcOption, ServerConfiguration};

/// Per-account session data: the auth key and enough session context to
/// resume without re-authenticating.
pub trait AccountStorage: Send + Sync {
    /// Whether enough data is stored to attempt [`check_in`]
    /// (auth key + home DC).
    ///
    /// [`check_in`]: crate::ConnectionController::check_in
    fn has_minimal_data_set(&self) -> bool;

    fn auth_key(&self) -> Option<AuthKey>;
    fn session_id(&self) -> u64;
    fn content_related_messages_number(&self) -> u32;
    fn dc_info(&self) -> DcOption;
    fn delta_time(&self) -> i32;

    // Persistence hooks, invoked by the controller after successful auth.
    fn set_auth_key(&self, key: AuthKey);
    fn set_session_id(&self, session_id: u64);
    fn set_dc_info(&self, option: DcOption);
    fn set_delta_time(&self, seconds: i32);
}

#[derive(Default)]
struct AccountData {
    auth_key:    Option<AuthKey>,
    session_id:  u64,
    content_related_messages_number: u32,
    dc_info:     DcOption,
    delta_time:  i32,
}

/// Volatile account storage; everything is lost on drop.
#[derive(Default)]
pub struct InMemoryAccountStorage {
    data: Mutex<AccountData>,
}

impl InMemoryAccountStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed the storage with a resumable session, as a previous run's
    /// persistence would have.
    pub fn with_session(key: AuthKey, dc_info: DcOption, session_id: u64) -> Arc<Self> {
        let storage = Self::default();
        {
            let mut data = storage.data.lock().unwrap();
            data.auth_key = Some(key);
            data.dc_info = dc_info;
            data.session_id = session_id;
        }
        Arc::new(storage)
    }
}

impl AccountStorage for InMemoryAccountStorage {
    fn has_minimal_data_set(&self) -> bool {
        let data = self.data.lock().unwrap();
        data.auth_key.is_some() && data.dc_info.is_valid()
    }

    fn auth_key(&self) -> Option<AuthKey> {
        self.data.lock().unwrap().auth_key.clone()
    }

    fn session_id(&self) -> u64 {
        self.data.lock().unwrap().session_id
    }

    fn content_related_messages_number(&self) -> u32 {
        self.data.lock().unwrap().content_related_messages_number
    }

    fn dc_info(&self) -> DcOption {
        self.data.lock().unwrap().dc_info.clone()
    }

    fn delta_time(&self) -> i32 {
        self.data.lock().unwrap().delta_time
    }

    fn set_auth_key(&self, key: AuthKey) {
        self.data.lock().unwrap().auth_key = Some(key);
    }

    fn set_session_id(&self, session_id: u64) {
        self.data.lock().unwrap().session_id = session_id;
    }

    fn set_dc_info(&self, option: DcOption) {
        self.data.lock().unwrap().dc_info = option;
    }

    fn set_delta_time(&self, seconds: i32) {
        self.data.lock().unwrap().delta_time = seconds;
    }
}

/// Server-reported data shared across accounts, chiefly the DC table.
pub trait DataStorage: Send + Sync {
    fn server_configuration(&self) -> ServerConfiguration;
    fn set_server_configuration(&self, configuration: ServerConfiguration);
}

#[derive(Default)]
pub struct InMemoryDataStorage {
    configuration: Mutex<ServerConfiguration>,
}

impl InMemoryDataStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_configuration(configuration: ServerConfiguration) -> Arc<Self> {
        let storage = Self::default();
        *storage.configuration.lock().unwrap() = configuration;
        Arc::new(storage)
    }
}

impl DataStorage for InMemoryDataStorage {
    fn server_configuration(&self) -> ServerConfiguration {
        self.configuration.lock().unwrap().clone()
    }

    fn set_server_configuration(&self, configuration: ServerConfiguration) {
        *self.configuration.lock().unwrap() = configuration;
    }
}
