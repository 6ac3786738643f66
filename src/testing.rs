//! Scripted in-memory broker for unit tests.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::SpawnRequest;
use crate::broker::{
    Broker, ListenerToken, PermissionListener, PermissionListeners, PermissionResult,
    PermissionState, RemoteProcess,
};
use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    CheckPermission,
    RequestPermission(i32),
    Spawn(Vec<String>),
    SpawnInternal(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Eof,
    Wait,
}

pub enum SpawnBehavior {
    Output { lines: Vec<String>, exit_code: i32 },
    FailAfter { lines: Vec<String> },
    Held { lines: Vec<String>, exit_code: i32, release: Receiver<()> },
    Reject(BrokerError),
}

impl SpawnBehavior {
    /// Output that only becomes readable once the returned sender fires.
    pub fn held(lines: Vec<&str>, exit_code: i32) -> (Self, Sender<()>) {
        let (release_tx, release) = mpsc::channel();
        let lines = lines.into_iter().map(String::from).collect();
        (SpawnBehavior::Held { lines, exit_code, release }, release_tx)
    }
}

pub struct FakeBroker {
    alive: bool,
    legacy: bool,
    internal_entry_point: bool,
    permission: Mutex<PermissionState>,
    spawns: Mutex<VecDeque<SpawnBehavior>>,
    calls: Mutex<Vec<Call>>,
    listeners: PermissionListeners,
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self {
            alive: true,
            legacy: false,
            internal_entry_point: true,
            permission: Mutex::new(PermissionState::Granted),
            spawns: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            listeners: PermissionListeners::new(),
            added: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.alive = false;
        self
    }

    pub fn legacy(mut self) -> Self {
        self.legacy = true;
        self
    }

    pub fn without_internal_entry_point(mut self) -> Self {
        self.internal_entry_point = false;
        self
    }

    pub fn with_permission(self, state: PermissionState) -> Self {
        *self.permission.lock().unwrap() = state;
        self
    }

    /// Queues the behavior of the next spawn. Unscripted spawns exit 0 silently.
    pub fn with_spawn(self, behavior: SpawnBehavior) -> Self {
        self.spawns.lock().unwrap().push_back(behavior);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// (registrations, deregistrations) seen so far.
    pub fn registration_counts(&self) -> (usize, usize) {
        (self.added.load(Ordering::SeqCst), self.removed.load(Ordering::SeqCst))
    }

    /// Delivers a permission result to listeners without changing state.
    pub fn deliver(&self, result: PermissionResult) {
        self.listeners.notify(result);
    }

    /// Resolves an outstanding permission request.
    pub fn respond(&self, request_code: i32, granted: bool) {
        *self.permission.lock().unwrap() =
            if granted { PermissionState::Granted } else { PermissionState::Denied };
        self.deliver(PermissionResult { request_code, granted });
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_process(&self) -> Result<Box<dyn RemoteProcess>> {
        let behavior = self.spawns.lock().unwrap().pop_front();
        let process = match behavior {
            None => FakeProcess::new(Vec::<&str>::new(), 0),
            Some(SpawnBehavior::Output { lines, exit_code }) => FakeProcess::new(lines, exit_code),
            Some(SpawnBehavior::FailAfter { lines }) => FakeProcess::new(lines, 0).fail_after_lines(),
            Some(SpawnBehavior::Held { lines, exit_code, release }) => {
                FakeProcess::new(lines, exit_code).held(release)
            }
            Some(SpawnBehavior::Reject(err)) => return Err(err),
        };
        Ok(Box::new(process))
    }
}

impl Broker for FakeBroker {
    fn ping(&self) -> bool {
        self.record(Call::Ping);
        self.alive
    }

    fn supports_permission_model(&self) -> bool {
        !self.legacy
    }

    fn check_permission(&self) -> PermissionState {
        self.record(Call::CheckPermission);
        *self.permission.lock().unwrap()
    }

    fn request_permission(&self, request_code: i32) {
        self.record(Call::RequestPermission(request_code));
    }

    fn add_permission_listener(&self, listener: PermissionListener) -> ListenerToken {
        self.added.fetch_add(1, Ordering::SeqCst);
        self.listeners.add(listener)
    }

    fn remove_permission_listener(&self, token: ListenerToken) -> bool {
        self.removed.fetch_add(1, Ordering::SeqCst);
        self.listeners.remove(token)
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>> {
        self.record(Call::Spawn(request.argv().to_vec()));
        if !self.alive {
            return Err(BrokerError::BrokerUnavailable);
        }
        self.next_process()
    }

    fn spawn_internal(&self, request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>> {
        self.record(Call::SpawnInternal(request.argv().to_vec()));
        if !self.internal_entry_point {
            return Err(BrokerError::InternalEntryPointFailed(
                "internal spawn entry point is not accessible".to_string(),
            ));
        }
        self.next_process()
    }
}

/// Stdout of a [`FakeProcess`]: serves bytes, optionally fails or waits first.
struct FakeStdout {
    data: Cursor<Vec<u8>>,
    fail_at_end: bool,
    release: Option<Receiver<()>>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Read for FakeStdout {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(release) = self.release.take() {
            let _ = release.recv();
        }
        let read = self.data.read(buf)?;
        if read == 0 && !buf.is_empty() {
            if self.fail_at_end {
                return Err(io::Error::other("pipe broken"));
            }
            self.events.lock().unwrap().push(Event::Eof);
        }
        Ok(read)
    }
}

pub struct FakeProcess {
    stdout: Option<FakeStdout>,
    exit_code: i32,
    events: Arc<Mutex<Vec<Event>>>,
}

impl FakeProcess {
    pub fn new<S: Into<String>>(lines: Vec<S>, exit_code: i32) -> Self {
        let mut bytes = Vec::new();
        for line in lines {
            let line: String = line.into();
            bytes.extend_from_slice(line.as_bytes());
            bytes.push(b'\n');
        }
        Self::from_bytes(bytes, exit_code)
    }

    pub fn from_bytes(bytes: Vec<u8>, exit_code: i32) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        Self {
            stdout: Some(FakeStdout {
                data: Cursor::new(bytes),
                fail_at_end: false,
                release: None,
                events: events.clone(),
            }),
            exit_code,
            events,
        }
    }

    /// Makes the stream fail instead of reporting end-of-data.
    pub fn fail_after_lines(mut self) -> Self {
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.fail_at_end = true;
        }
        self
    }

    fn held(mut self, release: Receiver<()>) -> Self {
        if let Some(stdout) = self.stdout.as_mut() {
            stdout.release = Some(release);
        }
        self
    }

    pub fn events(&self) -> Arc<Mutex<Vec<Event>>> {
        self.events.clone()
    }
}

impl RemoteProcess for FakeProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn BufRead + Send>> {
        self.stdout
            .take()
            .map(|stdout| Box::new(BufReader::new(stdout)) as Box<dyn BufRead + Send>)
    }

    fn wait_for_exit(&mut self) -> Result<i32> {
        self.events.lock().unwrap().push(Event::Wait);
        Ok(self.exit_code)
    }

    fn id(&self) -> Option<u32> {
        None
    }
}
