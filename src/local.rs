//! Broker backed by the host's privilege escalation tool.
//!
//! The "broker" here is `sudo` (or the platform's graphical equivalent):
//! reachable when the tool is installed, authorized once the user has
//! authenticated, and spawning processes in the superuser context.

use std::io::{self, BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

#[cfg(target_os = "macos")]
use crate::local_darwin as platform;
#[cfg(target_os = "linux")]
use crate::local_linux as platform;

use crate::SpawnRequest;
use crate::broker::{
    Broker, ListenerToken, PermissionListener, PermissionListeners, PermissionResult,
    PermissionState, RemoteProcess,
};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

/// Handle to a process spawned through [`LocalBroker`].
pub struct LocalProcess {
    child: Child,
}

impl LocalProcess {
    pub(crate) fn new(child: Child) -> Self {
        Self { child }
    }
}

impl RemoteProcess for LocalProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn BufRead + Send>> {
        self.child
            .stdout
            .take()
            .map(|stdout| Box::new(BufReader::new(stdout)) as Box<dyn BufRead + Send>)
    }

    fn wait_for_exit(&mut self) -> Result<i32> {
        let status = self.child.wait()?;
        Ok(exit_code(status))
    }

    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }
}

/// Maps a termination status to an integer code, using the shell's
/// `128 + signal` convention for processes killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Permission state shared with authentication threads.
struct Shared {
    listeners: PermissionListeners,
    last_result: Mutex<PermissionState>,
}

impl Shared {
    fn last_result(&self) -> PermissionState {
        self.last_result
            .lock()
            .map(|state| *state)
            .unwrap_or(PermissionState::Unknown)
    }

    fn resolve(&self, request_code: i32, granted: bool) {
        if let Ok(mut state) = self.last_result.lock() {
            *state = if granted {
                PermissionState::Granted
            } else {
                PermissionState::Denied
            };
        }
        self.listeners.notify(PermissionResult { request_code, granted });
    }
}

/// Broker that escalates through `sudo`, `pkexec` (Linux GUI) or `osascript`
/// (macOS GUI).
pub struct LocalBroker {
    gui: bool,
    prompt: Option<String>,
    shared: Arc<Shared>,
}

impl LocalBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            gui: config.gui,
            prompt: config.prompt.clone(),
            shared: Arc::new(Shared {
                listeners: PermissionListeners::new(),
                last_result: Mutex::new(PermissionState::Unknown),
            }),
        }
    }

    /// Name of the escalation tool this broker depends on.
    pub fn escalation_tool(&self) -> &'static str {
        platform::escalation_tool(self.gui)
    }
}

impl Broker for LocalBroker {
    fn ping(&self) -> bool {
        which::which(self.escalation_tool()).is_ok()
    }

    fn check_permission(&self) -> PermissionState {
        // Graphical tools prompt on every use, so only a previous
        // successful request counts there.
        if !self.gui && has_cached_credential() {
            return PermissionState::Granted;
        }
        match self.shared.last_result() {
            PermissionState::Granted if !self.gui => PermissionState::Unknown,
            state => state,
        }
    }

    fn request_permission(&self, request_code: i32) {
        let shared = self.shared.clone();
        let gui = self.gui;
        let prompt = self.prompt.clone();
        let spawned = thread::Builder::new()
            .name("privesc-broker-auth".to_string())
            .spawn(move || {
                let granted = platform::authenticate(gui, prompt.as_deref());
                shared.resolve(request_code, granted);
            });

        if let Err(err) = spawned {
            tracing::warn!(error = %err, "Failed to start authentication");
            self.shared.resolve(request_code, false);
        }
    }

    fn add_permission_listener(&self, listener: PermissionListener) -> ListenerToken {
        self.shared.listeners.add(listener)
    }

    fn remove_permission_listener(&self, token: ListenerToken) -> bool {
        self.shared.listeners.remove(token)
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>> {
        request.validate()?;
        if !self.ping() {
            return Err(BrokerError::BrokerUnavailable);
        }
        let child = platform::spawn(request, self.gui, self.prompt.as_deref(), false)?;
        tracing::debug!(pid = child.id(), tool = self.escalation_tool(), "Spawned privileged process");
        Ok(Box::new(LocalProcess::new(child)))
    }

    /// Spawns through `sudo -n`, relying on a credential cached by an earlier
    /// authentication. Never prompts.
    fn spawn_internal(&self, request: &SpawnRequest) -> Result<Box<dyn RemoteProcess>> {
        if self.gui {
            return Err(BrokerError::InternalEntryPointFailed(
                "non-interactive spawn is only available through sudo".to_string(),
            ));
        }
        request
            .validate()
            .and_then(|()| platform::spawn(request, false, None, true))
            .map(|child| Box::new(LocalProcess::new(child)) as Box<dyn RemoteProcess>)
            .map_err(|err| BrokerError::InternalEntryPointFailed(err.to_string()))
    }
}

/// Returns true if `sudo` can run without prompting.
fn has_cached_credential() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Changes into the directory passed as `$1`, then runs the remaining args.
const CHDIR_SCRIPT: &str = r#"cd "$1" && shift && exec "$@""#;

fn tool_path(name: &str) -> Result<String> {
    which::which(name)
        .map(|path| path.to_string_lossy().into_owned())
        .map_err(|_| BrokerError::EscalationToolNotFound(name.to_string()))
}

/// Wraps the request's argv so it runs with its environment variables
/// (through `env`) and, with `chdir`, in its working directory (through a
/// `cd` in `sh`). `env -C` is not used: BusyBox and coreutils before 8.28
/// lack it.
pub(crate) fn command_line(request: &SpawnRequest, chdir: bool) -> Result<Vec<String>> {
    let env = request.environment().filter(|env| !env.is_empty());
    let dir = if chdir { request.working_dir() } else { None };
    if env.is_none() && dir.is_none() {
        return Ok(request.argv().to_vec());
    }

    let mut argv = Vec::new();
    if let Some(dir) = dir {
        argv.push(tool_path("sh")?);
        argv.extend(["-c", CHDIR_SCRIPT, "sh"].map(String::from));
        argv.push(dir.to_string_lossy().into_owned());
    }
    if let Some(env) = env {
        argv.push(tool_path("env")?);
        argv.extend(env.iter().map(|(key, value)| format!("{key}={value}")));
    }
    argv.extend(request.argv().iter().cloned());
    Ok(argv)
}

/// Maps a failure to start the escalation tool.
pub(crate) fn spawn_error(err: io::Error) -> BrokerError {
    if err.kind() == io::ErrorKind::NotFound {
        BrokerError::BrokerUnavailable
    } else {
        BrokerError::SpawnRejected(err.to_string())
    }
}
