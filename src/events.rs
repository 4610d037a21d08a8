//! Policy events and listeners.

use std::sync::Mutex;

use crate::license_keys::KeyStatusMap;
use crate::session::SessionId;

/// Receiver of policy engine notifications.
pub trait EventListener: Send + Sync {
    /// The license should be renewed.
    fn on_session_renewal_needed(&self, session_id: &SessionId);

    /// Some keys changed status. `keys` holds only the changed keys.
    fn on_session_keys_change(
        &self,
        session_id: &SessionId,
        keys: &KeyStatusMap,
        has_new_usable_key: bool,
    );

    /// The next expiration moved. `None` means the license never expires.
    fn on_expiration_update(&self, session_id: &SessionId, expiry_time: Option<i64>);
}

/// A recorded notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    RenewalNeeded,
    KeysChange {
        keys: KeyStatusMap,
        has_new_usable_key: bool,
    },
    ExpirationUpdate(Option<i64>),
}

/// Listener that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(SessionId, PolicyEvent)>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, session_id: &SessionId, event: PolicyEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((session_id.clone(), event));
        }
    }

    /// All events so far, oldest first.
    pub fn events(&self) -> Vec<PolicyEvent> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// Remove and return all events so far.
    pub fn take(&self) -> Vec<PolicyEvent> {
        self.events
            .lock()
            .map(|mut events| events.drain(..).map(|(_, e)| e).collect())
            .unwrap_or_default()
    }

    pub fn renewal_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, PolicyEvent::RenewalNeeded))
            .count()
    }

    /// Most recent expiration update, if any was sent.
    pub fn last_expiry(&self) -> Option<Option<i64>> {
        self.events().into_iter().rev().find_map(|e| match e {
            PolicyEvent::ExpirationUpdate(expiry) => Some(expiry),
            _ => None,
        })
    }
}

impl EventListener for RecordingListener {
    fn on_session_renewal_needed(&self, session_id: &SessionId) {
        self.push(session_id, PolicyEvent::RenewalNeeded);
    }

    fn on_session_keys_change(
        &self,
        session_id: &SessionId,
        keys: &KeyStatusMap,
        has_new_usable_key: bool,
    ) {
        self.push(
            session_id,
            PolicyEvent::KeysChange {
                keys: keys.clone(),
                has_new_usable_key,
            },
        );
    }

    fn on_expiration_update(&self, session_id: &SessionId, expiry_time: Option<i64>) {
        self.push(session_id, PolicyEvent::ExpirationUpdate(expiry_time));
    }
}

/// Listener that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_session_renewal_needed(&self, session_id: &SessionId) {
        info!("[{}] renewal needed", session_id);
    }

    fn on_session_keys_change(
        &self,
        session_id: &SessionId,
        keys: &KeyStatusMap,
        has_new_usable_key: bool,
    ) {
        for (key_id, status) in keys {
            info!("[{}] key {} -> {:?}", session_id, key_id, status);
        }
        if has_new_usable_key {
            info!("[{}] new usable key", session_id);
        }
    }

    fn on_expiration_update(&self, session_id: &SessionId, expiry_time: Option<i64>) {
        match expiry_time {
            Some(expiry) => info!("[{}] expires at {}", session_id, expiry),
            None => info!("[{}] never expires", session_id),
        }
    }
}
