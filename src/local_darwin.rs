use std::io::Write;
use std::process::{Child, Command, Stdio};

use crate::SpawnRequest;
use crate::error::Result;
use crate::local::{command_line, spawn_error};

const ESCALATION_SCRIPT: &str = r#"
on run argv
    set prompt to item 1 of argv
    set workDir to item 2 of argv
    set cmd to ""
    repeat with i from 3 to (count of argv)
        set cmd to cmd & " " & (quoted form of (item i of argv))
    end repeat
    if workDir is not "" then
        set cmd to "cd " & (quoted form of workDir) & " &&" & cmd
    end if
    return do shell script cmd with administrator privileges with prompt prompt without altering line endings
end run
"#;

const AUTHENTICATION_SCRIPT: &str = r#"
on run argv
    do shell script "true" with administrator privileges with prompt (item 1 of argv)
end run
"#;

/// Returns the escalation tool used for the given mode.
pub fn escalation_tool(gui: bool) -> &'static str {
    if gui { "osascript" } else { "sudo" }
}

/// Start `osascript` reading `script` from stdin, with `args` as its argv.
fn run_script(script: &str, args: &[&str]) -> std::io::Result<Child> {
    let mut process = Command::new("osascript")
        .arg("-")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    // Closing stdin lets osascript start executing.
    if let Some(mut stdin) = process.stdin.take() {
        stdin.write_all(script.as_bytes())?;
    }

    Ok(process)
}

/// Authenticate the user with an AppleScript administrator prompt or `sudo -v`.
///
/// # Args:
/// - `gui` - Whether to prompt the user for a password using GUI or sudo.
/// - `prompt` - The prompt to display to the user.
///
/// # Returns:
/// - `bool` - Whether authentication succeeded.
pub fn authenticate(gui: bool, prompt: Option<&str>) -> bool {
    let status = if gui {
        let prompt = prompt.unwrap_or("Administrator privileges required");
        run_script(AUTHENTICATION_SCRIPT, &[prompt]).and_then(|mut child| child.wait())
    } else {
        let mut command = Command::new("sudo");
        if let Some(prompt) = prompt {
            command.arg("-p").arg(prompt);
        }
        command.arg("-v").stdout(Stdio::null()).status()
    };

    match status {
        Ok(status) => status.success(),
        Err(err) => {
            tracing::warn!(error = %err, tool = escalation_tool(gui), "Authentication could not run");
            false
        }
    }
}

/// Spawn a request with elevated privileges using `osascript`.
///
/// # Args:
/// - `request` - The request to spawn.
/// - `prompt` - The prompt to display to the user.
///
/// # Returns:
/// - `Result<Child>` - A handle to the spawned process.
fn spawn_gui(request: &SpawnRequest, prompt: Option<&str>) -> Result<Child> {
    let argv = command_line(request, false)?;
    let default_prompt = format!(
        "Administrator privileges required to launch {}",
        request.program()
    );
    let work_dir = request
        .working_dir()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut args = vec![prompt.unwrap_or(&default_prompt), work_dir.as_str()];
    args.extend(argv.iter().map(String::as_str));

    run_script(ESCALATION_SCRIPT, &args).map_err(spawn_error)
}

/// Spawn a request with elevated privileges using `sudo`.
///
/// # Args:
/// - `request` - The request to spawn.
/// - `prompt` - The prompt to display to the user.
/// - `non_interactive` - Fail instead of prompting when no credential is cached.
///
/// # Returns:
/// - `Result<Child>` - A handle to the spawned process.
fn spawn_cli(request: &SpawnRequest, prompt: Option<&str>, non_interactive: bool) -> Result<Child> {
    let argv = command_line(request, false)?;
    let mut command = Command::new("sudo");

    if non_interactive {
        command.arg("-n");
    } else if let Some(prompt) = prompt {
        command.arg("-p").arg(prompt);
    }

    // sudo keeps the working directory of its caller.
    if let Some(dir) = request.working_dir() {
        command.current_dir(dir);
    }

    command
        .arg("--")
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(spawn_error)
}

/// Spawn a request with elevated privileges using either `osascript` or `sudo`.
pub fn spawn(
    request: &SpawnRequest,
    gui: bool,
    prompt: Option<&str>,
    non_interactive: bool,
) -> Result<Child> {
    if gui {
        spawn_gui(request, prompt)
    } else {
        spawn_cli(request, prompt, non_interactive)
    }
}
