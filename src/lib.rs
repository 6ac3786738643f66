mod broker;
mod collector;
mod config;
mod error;
mod gate;
mod runner;

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod local;
#[cfg(target_os = "macos")]
mod local_darwin;
#[cfg(target_os = "linux")]
mod local_linux;

#[cfg(test)]
mod testing;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub use crate::broker::{
    Broker, BrokerConnectionState, ListenerRegistration, ListenerToken, PermissionListener,
    PermissionListeners, PermissionResult, PermissionState, RemoteProcess,
};
pub use crate::collector::{OutputLimit, collect};
pub use crate::config::{BrokerConfig, SpawnPath};
pub use crate::error::{BrokerError, Result};
pub use crate::gate::{GateState, PermissionGate};
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub use crate::local::{LocalBroker, LocalProcess};
pub use crate::runner::{ChannelDispatcher, Dispatcher, Outcome, ShellRunner, render_outcome};

/// Result of one invocation: the exit code and the captured standard output.
///
/// A nonzero exit code is an ordinary result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Exit code reported by the remote process.
    pub exit_code: i32,
    /// Captured stdout, one `\n`-terminated entry per line read.
    pub output: String,
    /// True when output beyond the configured limit was dropped.
    pub truncated: bool,
}

impl ExecutionResult {
    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exit Code: {}\n\n{}", self.exit_code, self.output)?;
        if self.truncated {
            write!(f, "[output truncated]")?;
        }
        Ok(())
    }
}

/// A request for the broker to spawn a process.
///
/// # Example
///
/// ```no_run
/// use privesc_broker::SpawnRequest;
///
/// let request = SpawnRequest::new("ls")
///     .arg("-l")
///     .arg("/system")
///     .env("LC_ALL", "C")
///     .current_dir("/");
/// # let _ = request;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    argv: Vec<String>,
    env: Option<BTreeMap<String, String>>,
    current_dir: Option<PathBuf>,
}

impl SpawnRequest {
    /// Creates a new request running `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            env: None,
            current_dir: None,
        }
    }

    /// Creates a request running `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Adds a single argument to pass to the program.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Adds multiple arguments to pass to the program.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the spawned process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Sets multiple environment variables for the spawned process.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let env = self.env.get_or_insert_with(BTreeMap::new);
        env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the working directory of the spawned process.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn environment(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Checks that the request names a program to run.
    pub fn validate(&self) -> Result<()> {
        if self.program().trim().is_empty() {
            return Err(BrokerError::InvalidRequest(
                "program must not be empty".to_string(),
            ));
        }
        if let Some(env) = &self.env
            && let Some(key) = env.keys().find(|k| k.is_empty() || k.contains('='))
        {
            return Err(BrokerError::InvalidRequest(format!(
                "invalid environment variable name: {key:?}"
            )));
        }
        Ok(())
    }
}
