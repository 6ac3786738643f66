//! Interface to the privileged broker.
//!
//! The broker is an out-of-process service holding elevated privilege. This
//! module only describes the surface the client consumes: a liveness check,
//! the permission handshake, and process spawning. How the broker is reached
//! is up to the implementation.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::SpawnRequest;
use crate::error::{BrokerError, Result};

/// Whether the broker connection is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerConnectionState {
    Unreachable,
    Reachable,
}

impl BrokerConnectionState {
    /// Pings the broker. Re-evaluated on every invocation attempt, never cached.
    pub fn of(broker: &dyn Broker) -> Self {
        if broker.ping() {
            BrokerConnectionState::Reachable
        } else {
            BrokerConnectionState::Unreachable
        }
    }
}

/// Authorization state as reported by the broker's permission subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Unknown,
    Denied,
    Granted,
}

/// Result of an asynchronous permission request, delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionResult {
    pub request_code: i32,
    pub granted: bool,
}

/// Callback invoked with every permission result the broker produces.
pub type PermissionListener = Arc<dyn Fn(PermissionResult) + Send + Sync>;

/// Token identifying a registered permission listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerToken(u64);

impl ListenerToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A process running in the broker's privilege context.
///
/// The broker executes the process; the client owns the handle and reads its
/// output and exit status.
pub trait RemoteProcess: Send {
    /// Takes the standard output stream. Returns `None` once taken.
    fn take_stdout(&mut self) -> Option<Box<dyn BufRead + Send>>;

    /// Blocks until the process terminates and returns its exit code.
    fn wait_for_exit(&mut self) -> Result<i32>;

    /// Returns the process identifier, if the broker exposes one.
    fn id(&self) -> Option<u32>;
}

/// Handle to the privileged broker.
pub trait Broker: Send + Sync {
    /// Non-blocking liveness check.
    fn ping(&self) -> bool;

    /// Returns false for brokers that predate the permission model.
    fn supports_permission_model(&self) -> bool {
        true
    }

    /// Synchronous read of the current permission state.
    fn check_permission(&self) -> PermissionState;

    /// Starts an authorization prompt. Returns immediately; the result is
    /// delivered to registered listeners.
    fn request_permission(&self, request_code: i32);

    fn add_permission_listener(&self, listener: PermissionListener) -> ListenerToken;

    /// Returns false if the token was not registered.
    fn remove_permission_listener(&self, token: ListenerToken) -> bool;

    /// Spawns a process through the broker's public entry point.
    ///
    /// Fails with [`BrokerError::BrokerUnavailable`] if the connection dropped
    /// after the liveness check, or [`BrokerError::SpawnRejected`] if the
    /// broker refused the request.
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>>;

    /// Spawns a process through an entry point that relies on unstable broker
    /// internals. Best effort: every failure on this path is reported as
    /// [`BrokerError::InternalEntryPointFailed`].
    fn spawn_internal(&self, _request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>> {
        Err(BrokerError::InternalEntryPointFailed(
            "this broker exposes no internal entry point".to_string(),
        ))
    }
}

/// Listener bookkeeping shared by broker implementations.
#[derive(Default)]
pub struct PermissionListeners {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<ListenerToken, PermissionListener>>,
}

impl PermissionListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: PermissionListener) -> ListenerToken {
        let token = ListenerToken(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.insert(token, listener);
        }
        token
    }

    pub fn remove(&self, token: ListenerToken) -> bool {
        self.listeners
            .lock()
            .map(|mut listeners| listeners.remove(&token).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `result` to every listener registered at the time of the call.
    pub fn notify(&self, result: PermissionResult) {
        // Snapshot so listeners may (de)register without deadlocking.
        let snapshot: Vec<PermissionListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.values().cloned().collect(),
            Err(_) => return,
        };
        for listener in snapshot {
            listener(result);
        }
    }
}

/// A permission listener registration that is removed when dropped.
pub struct ListenerRegistration {
    broker: Arc<dyn Broker>,
    token: Option<ListenerToken>,
}

impl ListenerRegistration {
    pub fn register(broker: Arc<dyn Broker>, listener: PermissionListener) -> Self {
        let token = broker.add_permission_listener(listener);
        tracing::debug!(token = token.id(), "Registered permission listener");
        Self { broker, token: Some(token) }
    }

    pub fn token(&self) -> Option<ListenerToken> {
        self.token
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if !self.broker.remove_permission_listener(token) {
                tracing::warn!(token = token.id(), "Permission listener was already removed");
            } else {
                tracing::debug!(token = token.id(), "Removed permission listener");
            }
        }
    }
}
