//! Child process supervision: command resolution, spawn, termination.
//!
//! Desktop launchers inherit a minimal environment, so bare command tokens
//! (`npx`, `uvx`, ...) are resolved against a fixed directory list rather
//! than the inherited `PATH`, and that same list is prepended to the child's
//! `PATH` so the child can find its own helpers.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::ChildConfig;
use crate::error::BridgeError;

/// Directories searched for bare command tokens, in order, and prepended to
/// the child's `PATH`.
pub const FALLBACK_PATH_DIRS: [&str; 4] =
    ["/usr/local/bin", "/usr/bin", "/bin", "/opt/homebrew/bin"];

/// Grace given to a child between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How a command token was resolved to something spawnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCommand {
    /// A concrete executable path.
    Path(PathBuf),
    /// Bare name not found in the fixed directories; launched through
    /// `/usr/bin/env` so the child's own `PATH` gets a chance.
    Env(String),
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Resolve a command token to an executable.
///
/// Tokens starting with `/` or `.` are used literally after tilde expansion
/// and must point at an executable file. Bare names are searched in
/// [`FALLBACK_PATH_DIRS`]; names found nowhere fall back to the `env`
/// launcher (a missing binary then surfaces as a non-zero child exit).
pub fn resolve_command(token: &str) -> Result<ResolvedCommand, BridgeError> {
    let token = token.trim();
    let expanded = shellexpand::tilde(token);

    if expanded.starts_with('/') || expanded.starts_with('.') {
        let path = PathBuf::from(expanded.as_ref());
        if is_executable(&path) {
            return Ok(ResolvedCommand::Path(path));
        }
        return Err(BridgeError::CommandNotFound {
            command: token.to_string(),
        });
    }

    for dir in FALLBACK_PATH_DIRS {
        let candidate = Path::new(dir).join(expanded.as_ref());
        if is_executable(&candidate) {
            return Ok(ResolvedCommand::Path(candidate));
        }
    }

    Ok(ResolvedCommand::Env(expanded.into_owned()))
}

/// Compose the child's `PATH`: the fixed directory list first, then whatever
/// this process inherited.
fn child_path() -> String {
    let mut path = FALLBACK_PATH_DIRS.join(":");
    if let Ok(inherited) = std::env::var("PATH") {
        if !inherited.is_empty() {
            path.push(':');
            path.push_str(&inherited);
        }
    }
    path
}

/// Spawn the configured child with stdin/stdout/stderr piped.
///
/// The environment is inherited, `PATH` is rewritten via [`child_path`], and
/// the config's env map is overlaid last (so it may override `PATH` too).
/// On unix the child gets its own process group so termination signals reach
/// grandchildren.
pub fn spawn(config: &ChildConfig) -> Result<ChildHandle, BridgeError> {
    let resolved = resolve_command(&config.command)?;

    let mut cmd = match &resolved {
        ResolvedCommand::Path(path) => Command::new(path),
        ResolvedCommand::Env(name) => {
            let mut cmd = Command::new("/usr/bin/env");
            cmd.arg(name);
            cmd
        }
    };
    cmd.args(&config.args);
    cmd.env("PATH", child_path());
    for (key, value) in &config.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(shellexpand::tilde(dir).as_ref());
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn().map_err(|e| BridgeError::SpawnFailed {
        command: config.command.clone(),
        source: e,
    })?;

    tracing::info!(
        bridge_id = %config.id,
        command = %config.command,
        resolved = ?resolved,
        pid = child.id(),
        "child process spawned"
    );

    Ok(ChildHandle { child })
}

/// Handle to a spawned child. Pipes are taken exactly once; exit status is
/// delivered exactly once via [`ChildHandle::wait`].
#[derive(Debug)]
pub struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Send polite termination (SIGTERM to the process group on unix).
    ///
    /// The exit itself is observed by whoever holds the [`ChildHandle::wait`]
    /// future; this only requests it.
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Some(pid) = self.child.id() {
                if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(pid, error = ?e, "killpg SIGTERM failed");
                }
                return;
            }
        }
        let _ = self.child.start_kill();
    }

    /// Terminate and reap: SIGTERM, a short grace, then SIGKILL.
    pub async fn terminate_and_wait(&mut self) -> Option<std::process::ExitStatus> {
        self.terminate();
        match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => return Some(status),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wait failed after SIGTERM");
            }
            Err(_) => {
                tracing::debug!("child did not exit within grace, sending SIGKILL");
            }
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "SIGKILL failed");
        }
        self.child.wait().await.ok()
    }
}
