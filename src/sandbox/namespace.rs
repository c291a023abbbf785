use super::Launcher;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Runs the worker inside fresh user and network namespaces
/// (`unshare -rn`), so it has no network interfaces besides a down loopback.
pub struct NamespaceLauncher {
    available: bool,
}

impl NamespaceLauncher {
    /// Check once whether unprivileged namespaces work on this host. When
    /// they don't, the launcher degrades to a plain process.
    pub fn new() -> Self {
        let available = cfg!(target_os = "linux") && unshare_works();
        if available {
            debug!("network namespace isolation available");
        } else {
            warn!("unshare -rn is unavailable; workers will run without network isolation");
        }
        Self { available }
    }
}

impl Default for NamespaceLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl Launcher for NamespaceLauncher {
    fn name(&self) -> &str {
        if self.available {
            "namespace"
        } else {
            "direct"
        }
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        if !self.available {
            return DirectLauncher.command(program, args);
        }
        let mut cmd = Command::new("unshare");
        cmd.args(["-rn", "--", program]);
        cmd.args(args);
        cmd
    }
}

/// Runs the worker as an ordinary child process. rlimits and the process
/// group still apply.
pub struct DirectLauncher;

impl Launcher for DirectLauncher {
    fn name(&self) -> &str {
        "direct"
    }

    fn command(&self, program: &str, args: &[&str]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd
    }
}

fn unshare_works() -> bool {
    Command::new("unshare")
        .args(["-rn", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
