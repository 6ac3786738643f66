use std::process::{Child, Command, Stdio};

use crate::SpawnRequest;
use crate::error::{BrokerError, Result};
use crate::local::{command_line, spawn_error};

/// Returns the escalation tool used for the given mode.
pub fn escalation_tool(gui: bool) -> &'static str {
    if gui { "pkexec" } else { "sudo" }
}

/// Authenticate the user with `pkexec` or `sudo -v`.
///
/// # Args:
/// - `gui` - Whether to prompt the user for a password using GUI or sudo.
/// - `prompt` - The prompt to display to the user. Only used if `gui` is false due to `pkexec` limitations.
///
/// # Returns:
/// - `bool` - Whether authentication succeeded.
pub fn authenticate(gui: bool, prompt: Option<&str>) -> bool {
    let mut command = if gui {
        let mut command = Command::new("pkexec");
        command.arg("true");
        command
    } else {
        let mut command = Command::new("sudo");
        if let Some(prompt) = prompt {
            command.arg("-p").arg(prompt);
        }
        command.arg("-v");
        command
    };

    match command.stdin(Stdio::inherit()).stdout(Stdio::null()).status() {
        Ok(status) => status.success(),
        Err(err) => {
            tracing::warn!(error = %err, tool = escalation_tool(gui), "Authentication could not run");
            false
        }
    }
}

/// Spawn a command line with elevated privileges using `pkexec`.
///
/// # Args:
/// - `argv` - The program followed by its arguments.
///
/// # Returns:
/// - `Result<Child>` - A handle to the spawned process.
fn spawn_gui(argv: &[String]) -> Result<Child> {
    if which::which("pkexec").is_err() {
        return Err(BrokerError::EscalationToolNotFound("pkexec".to_string()));
    }

    // pkexec does not search PATH for the target program.
    let program = which::which(&argv[0])
        .map_err(|_| BrokerError::SpawnRejected(format!("program not found: {}", argv[0])))?;

    Command::new("pkexec")
        .arg(program)
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(spawn_error)
}

/// Spawn a command line with elevated privileges using `sudo`.
///
/// # Args:
/// - `argv` - The program followed by its arguments.
/// - `prompt` - The prompt to display to the user.
/// - `non_interactive` - Fail instead of prompting when no credential is cached.
///
/// # Returns:
/// - `Result<Child>` - A handle to the spawned process.
fn spawn_cli(argv: &[String], prompt: Option<&str>, non_interactive: bool) -> Result<Child> {
    let mut command = Command::new("sudo");

    if non_interactive {
        command.arg("-n");
    } else if let Some(prompt) = prompt {
        command.arg("-p").arg(prompt);
    }

    command
        .arg("--")
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(spawn_error)
}

/// Spawn a request with elevated privileges using either `pkexec` or `sudo`.
///
/// Environment and working directory are applied by wrapping the argv in
/// `env` and `sh`, since both tools reset them for the target program.
pub fn spawn(
    request: &SpawnRequest,
    gui: bool,
    prompt: Option<&str>,
    non_interactive: bool,
) -> Result<Child> {
    let argv = command_line(request, true)?;
    if gui {
        spawn_gui(&argv)
    } else {
        spawn_cli(&argv, prompt, non_interactive)
    }
}
