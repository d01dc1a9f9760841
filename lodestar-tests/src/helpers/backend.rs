//! Backend that records every call made to it.

use std::sync::atomic::{AtomicBool, Ordering};

use lodestar_daemon::backend::{Backend, BackendState, BackendStatus, StartOptions};
use lodestar_daemon::identity::ConnIdentity;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    SetActiveUser(String),
    Reset,
    Start,
    Shutdown,
    /// `status()` was called, i.e. request logic ran.
    Status,
}

pub struct RecordingBackend {
    persistent: AtomicBool,
    config_valid: AtomicBool,
    denied: Mutex<Vec<(String, String)>>,
    operator: Mutex<Option<String>>,
    events: Mutex<Vec<BackendEvent>>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            persistent: AtomicBool::new(false),
            config_valid: AtomicBool::new(true),
            denied: Mutex::new(Vec::new()),
            operator: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::SeqCst);
    }

    pub fn set_config_valid(&self, valid: bool) {
        self.config_valid.store(valid, Ordering::SeqCst);
    }

    pub fn set_operator(&self, uid: Option<&str>) {
        *self.operator.lock() = uid.map(str::to_string);
    }

    /// Refuse connections from `user_id` with `reason`.
    pub fn deny_user(&self, user_id: &str, reason: &str) {
        self.denied
            .lock()
            .push((user_id.to_string(), reason.to_string()));
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn count(&self, event: &BackendEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn resets(&self) -> usize {
        self.count(&BackendEvent::Reset)
    }

    pub fn starts(&self) -> usize {
        self.count(&BackendEvent::Start)
    }

    pub fn shutdowns(&self) -> usize {
        self.count(&BackendEvent::Shutdown)
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }
}

impl Backend for RecordingBackend {
    fn check_connection_allowed(&self, identity: &ConnIdentity) -> Result<(), String> {
        match self
            .denied
            .lock()
            .iter()
            .find(|(user_id, _)| *user_id == identity.user_id)
        {
            Some((_, reason)) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    fn set_active_user(&self, user_id: &str) {
        self.record(BackendEvent::SetActiveUser(user_id.to_string()));
    }

    fn reset_for_disconnect(&self) {
        self.record(BackendEvent::Reset);
    }

    fn is_persistent_server_mode(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    fn config_valid(&self) -> bool {
        self.config_valid.load(Ordering::SeqCst)
    }

    fn start(&self, _options: StartOptions) {
        self.record(BackendEvent::Start);
    }

    fn shutdown(&self) {
        self.record(BackendEvent::Shutdown);
    }

    fn status(&self) -> BackendStatus {
        self.record(BackendEvent::Status);
        BackendStatus {
            state: BackendState::Running,
            persistent_server_mode: self.is_persistent_server_mode(),
            ..BackendStatus::default()
        }
    }

    fn operator_user_id(&self) -> Option<String> {
        self.operator.lock().clone()
    }
}
