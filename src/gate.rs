//! Permission gate: decides whether the broker may be asked to spawn.
//!
//! ```text
//! NotChecked --ping fails--------------------> Unavailable
//! NotChecked --permission granted------------> Ready
//! NotChecked --permission missing, request---> AwaitingGrant
//! AwaitingGrant --result(granted)------------> Ready
//! AwaitingGrant --result(denied)-------------> Denied
//! ```

use std::sync::Arc;

use crate::broker::{
    Broker, BrokerConnectionState, ListenerRegistration, PermissionResult, PermissionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NotChecked,
    /// The broker did not answer the liveness check. Terminal for the attempt.
    Unavailable,
    Ready,
    /// A permission request is outstanding; the attempt resumes on its result.
    AwaitingGrant,
    /// The permission request was declined. Terminal for the attempt.
    Denied,
}

impl GateState {
    /// Applies a permission result to this state.
    ///
    /// Only `AwaitingGrant` reacts; every other state is returned unchanged.
    pub fn resolve(self, result: PermissionResult) -> GateState {
        match self {
            GateState::AwaitingGrant if result.granted => GateState::Ready,
            GateState::AwaitingGrant => GateState::Denied,
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GateState::Unavailable | GateState::Denied)
    }
}

/// Guards access to the broker behind the liveness check and permission check.
///
/// The gate registers its permission listener when created and deregisters it
/// when dropped, so the callback never outlives its owner.
pub struct PermissionGate {
    broker: Arc<dyn Broker>,
    request_code: i32,
    _registration: ListenerRegistration,
}

impl PermissionGate {
    /// Creates a gate and registers `on_result` for permission results carrying
    /// `request_code`. Results for other request codes are ignored.
    pub fn new<F>(broker: Arc<dyn Broker>, request_code: i32, on_result: F) -> Self
    where
        F: Fn(PermissionResult) + Send + Sync + 'static,
    {
        let registration = ListenerRegistration::register(
            broker.clone(),
            Arc::new(move |result: PermissionResult| {
                if result.request_code != request_code {
                    tracing::debug!(
                        request_code = result.request_code,
                        "Ignoring permission result for another request"
                    );
                    return;
                }
                tracing::info!(granted = result.granted, "Permission result received");
                on_result(result);
            }),
        );
        Self { broker, request_code, _registration: registration }
    }

    pub fn request_code(&self) -> i32 {
        self.request_code
    }

    pub fn is_broker_alive(&self) -> bool {
        BrokerConnectionState::of(self.broker.as_ref()) == BrokerConnectionState::Reachable
    }

    /// Returns true if the broker reports permission as granted.
    ///
    /// Always false for brokers that predate the permission model.
    pub fn has_permission(&self) -> bool {
        if !self.broker.supports_permission_model() {
            return false;
        }
        self.broker.check_permission() == PermissionState::Granted
    }

    /// Starts the broker's authorization prompt. Does not block.
    pub fn request_permission(&self) {
        tracing::debug!(request_code = self.request_code, "Requesting broker permission");
        self.broker.request_permission(self.request_code);
    }

    /// Runs one attempt from `NotChecked`.
    ///
    /// The permission check is skipped when the broker is unreachable, and a
    /// permission request is issued exactly once when permission is missing.
    pub fn evaluate(&self) -> GateState {
        if !self.is_broker_alive() {
            tracing::debug!("Broker is not running");
            return GateState::Unavailable;
        }
        if self.has_permission() {
            tracing::debug!("Broker permission already granted");
            return GateState::Ready;
        }
        self.request_permission();
        GateState::AwaitingGrant
    }
}
