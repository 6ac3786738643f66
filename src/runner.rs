//! Runs commands through the broker off the foreground thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crate::broker::{Broker, PermissionResult};
use crate::collector::{OutputLimit, collect};
use crate::config::{BrokerConfig, SpawnPath};
use crate::error::{BrokerError, Result};
use crate::gate::{GateState, PermissionGate};
use crate::{ExecutionResult, SpawnRequest};

/// What a single invocation produces.
pub type Outcome = Result<ExecutionResult>;

/// Renders an outcome as the text shown to the user.
pub fn render_outcome(outcome: &Outcome) -> String {
    match outcome {
        Ok(result) => result.to_string(),
        Err(BrokerError::BrokerUnreachable) => {
            "Broker service is not running. Start the broker first.".to_string()
        }
        Err(BrokerError::PermissionDenied) => "Permission denied".to_string(),
        Err(BrokerError::BrokerUnavailable) => {
            "Lost connection to the broker service. Try again.".to_string()
        }
        Err(BrokerError::Busy) => "A command is already running".to_string(),
        Err(BrokerError::InvalidRequest(reason)) => format!("Invalid command: {reason}"),
        Err(err) => format!("Execution error: {err}"),
    }
}

/// Hands outcomes over to the foreground context.
///
/// Called exactly once per invocation, from whichever thread finished it.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, outcome: Outcome);
}

/// Dispatcher backed by a channel drained by the foreground thread.
pub struct ChannelDispatcher {
    sender: Sender<Outcome>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, Receiver<Outcome>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn dispatch(&self, outcome: Outcome) {
        if self.sender.send(outcome).is_err() {
            tracing::warn!("Foreground receiver is gone, dropping outcome");
        }
    }
}

struct RunnerState {
    broker: Arc<dyn Broker>,
    config: BrokerConfig,
    dispatcher: Arc<dyn Dispatcher>,
    in_flight: AtomicBool,
    pending: Mutex<Option<SpawnRequest>>,
}

impl RunnerState {
    fn finish(&self, outcome: Outcome) {
        if let Err(err) = &outcome {
            tracing::warn!(error = %err, "Invocation failed");
        }
        self.in_flight.store(false, Ordering::Release);
        self.dispatcher.dispatch(outcome);
    }

    fn take_pending(&self) -> Option<SpawnRequest> {
        self.pending.lock().ok().and_then(|mut pending| pending.take())
    }

    /// Swaps in `request` for the one still waiting on permission. Hands the
    /// request back if nothing is parked, i.e. the invocation is running.
    fn replace_parked(&self, request: SpawnRequest) -> std::result::Result<(), SpawnRequest> {
        let Ok(mut pending) = self.pending.lock() else {
            return Err(request);
        };
        match pending.as_mut() {
            Some(parked) => {
                *parked = request;
                Ok(())
            }
            None => Err(request),
        }
    }

    fn on_permission_result(self: &Arc<Self>, result: PermissionResult) {
        let Some(request) = self.take_pending() else {
            tracing::debug!("No invocation is waiting on this permission result");
            return;
        };
        match GateState::AwaitingGrant.resolve(result) {
            GateState::Ready => self.launch(request),
            _ => self.finish(Err(BrokerError::PermissionDenied)),
        }
    }

    /// Spawns the background thread that executes `request`.
    fn launch(self: &Arc<Self>, request: SpawnRequest) {
        let state = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("privesc-broker-run".to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.execute(&request)))
                    .unwrap_or_else(|_| {
                        Err(BrokerError::ExecutionFailed(
                            "invocation panicked".to_string(),
                        ))
                    });
                state.finish(outcome);
            });

        if let Err(err) = spawned {
            self.finish(Err(BrokerError::ExecutionFailed(format!(
                "failed to start background task: {err}"
            ))));
        }
    }

    fn execute(&self, request: &SpawnRequest) -> Outcome {
        tracing::debug!(argv = ?request.argv(), path = ?self.config.spawn_path, "Spawning through broker");
        let process = match self.config.spawn_path {
            SpawnPath::Public => self.broker.spawn(request)?,
            SpawnPath::Internal => self.broker.spawn_internal(request)?,
        };
        collect(process, OutputLimit::new(self.config.max_output_bytes))
    }
}

/// Drives invocations: permission gate, spawn, output collection, delivery.
///
/// One invocation may be in flight at a time; further calls to
/// [`run`](Self::run) are rejected with [`BrokerError::Busy`] until the
/// current one has been dispatched. While the invocation is still waiting on
/// permission, a new `run` replaces its request and asks for permission again.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use privesc_broker::{BrokerConfig, ChannelDispatcher, LocalBroker, ShellRunner, SpawnRequest};
///
/// let config = BrokerConfig::default();
/// let broker = Arc::new(LocalBroker::new(&config));
/// let (dispatcher, outcomes) = ChannelDispatcher::new();
/// let runner = ShellRunner::start(broker, config, Arc::new(dispatcher));
///
/// runner.run(SpawnRequest::shell("ls -l /system"));
/// let outcome = outcomes.recv().unwrap();
/// # let _ = outcome;
/// ```
pub struct ShellRunner {
    gate: PermissionGate,
    state: Arc<RunnerState>,
}

impl ShellRunner {
    /// Creates the runner and registers its permission listener.
    ///
    /// The listener is removed when the runner is dropped. A request still
    /// waiting for permission at that point is discarded without an outcome.
    pub fn start(
        broker: Arc<dyn Broker>,
        config: BrokerConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let request_code = config.request_code;
        let state = Arc::new(RunnerState {
            broker: broker.clone(),
            config,
            dispatcher,
            in_flight: AtomicBool::new(false),
            pending: Mutex::new(None),
        });

        let weak: Weak<RunnerState> = Arc::downgrade(&state);
        let gate = PermissionGate::new(broker, request_code, move |result| {
            if let Some(state) = weak.upgrade() {
                state.on_permission_result(result);
            }
        });

        Self { gate, state }
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.state.config
    }

    pub fn is_in_flight(&self) -> bool {
        self.state.in_flight.load(Ordering::Acquire)
    }

    /// Starts one invocation. Its outcome is always delivered through the
    /// dispatcher, possibly before this call returns.
    pub fn run(&self, request: SpawnRequest) {
        if let Err(err) = request.validate() {
            self.state.dispatcher.dispatch(Err(err));
            return;
        }
        if self
            .state
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // A permission result may never arrive, so a parked invocation
            // takes the new request and retries the gate instead.
            if self.state.replace_parked(request).is_ok() {
                tracing::debug!("Replacing request still waiting on permission");
                self.evaluate_parked();
            } else {
                tracing::debug!("Rejecting run while another invocation is in flight");
                self.state.dispatcher.dispatch(Err(BrokerError::Busy));
            }
            return;
        }

        // Park the request before evaluating: the permission result may
        // arrive on another thread before `evaluate` returns.
        if let Ok(mut pending) = self.state.pending.lock() {
            *pending = Some(request);
        }
        self.evaluate_parked();
    }

    /// Runs the gate for the parked request and acts on the result.
    fn evaluate_parked(&self) {
        match self.gate.evaluate() {
            GateState::Ready => {
                if let Some(request) = self.state.take_pending() {
                    self.state.launch(request);
                }
            }
            GateState::AwaitingGrant => {
                tracing::debug!("Waiting for permission result");
            }
            GateState::Unavailable => {
                if self.state.take_pending().is_some() {
                    self.state.finish(Err(BrokerError::BrokerUnreachable));
                }
            }
            GateState::NotChecked | GateState::Denied => {
                if self.state.take_pending().is_some() {
                    self.state.finish(Err(BrokerError::PermissionDenied));
                }
            }
        }
    }
}
