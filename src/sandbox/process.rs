//! One worker process and everything it owns.
//!
//! `WorkerProcess` is the isolated execution context: a child in its own
//! process group, a private temporary working directory, and the threads
//! pumping its pipes. Dropping it kills the group and reaps the child, so
//! teardown happens on every exit path.

use super::{LaunchError, ProcessLimits};
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

const STDERR_LIMIT: u64 = 64 * 1024;

#[derive(Debug)]
pub struct WorkerOutput {
    pub stdout: Vec<u8>,
    /// The worker wrote more than the stdout ceiling; `stdout` is cut short.
    pub stdout_overflow: bool,
    pub stderr: String,
    pub status: ExitStatus,
}

impl WorkerOutput {
    pub fn describe_status(&self) -> String {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return format!("killed by signal {}", signal);
            }
        }
        match self.status.code() {
            Some(code) => format!("exit code {}", code),
            None => "unknown exit status".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum WaitOutcome {
    Exited(WorkerOutput),
    TimedOut,
}

pub struct WorkerProcess {
    child: Child,
    stdout_reader: Option<JoinHandle<(Vec<u8>, bool)>>,
    stderr_reader: Option<JoinHandle<String>>,
    stdin_writer: Option<JoinHandle<()>>,
    reaped: bool,
    // Dropped after the child is gone.
    _workspace: TempDir,
}

impl WorkerProcess {
    /// Spawn `cmd` in a fresh workspace, feed it `input` on stdin and start
    /// draining its output.
    pub fn spawn(
        mut cmd: Command,
        input: Vec<u8>,
        limits: ProcessLimits,
        max_stdout: usize,
    ) -> Result<Self, LaunchError> {
        let workspace = tempfile::Builder::new()
            .prefix("sandpit-")
            .tempdir()
            .map_err(LaunchError::Workspace)?;
        let mpl_dir = workspace.path().join("mpl");
        std::fs::create_dir_all(&mpl_dir).map_err(LaunchError::Workspace)?;

        cmd.current_dir(workspace.path())
            .env_clear()
            .env("HOME", workspace.path())
            .env("TMPDIR", workspace.path())
            .env("LANG", "C.UTF-8")
            .env("PYTHONUTF8", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("MPLBACKEND", "Agg")
            .env("MPLCONFIGDIR", &mpl_dir)
            .env("OPENBLAS_NUM_THREADS", "1")
            .env("OMP_NUM_THREADS", "1")
            .env("MKL_NUM_THREADS", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
            // SAFETY: apply_rlimits only calls setrlimit, which is
            // async-signal-safe, and touches no shared state.
            unsafe {
                cmd.pre_exec(move || apply_rlimits(&limits));
            }
        }
        #[cfg(not(unix))]
        let _ = limits;

        let mut child = cmd.spawn().map_err(LaunchError::Spawn)?;
        debug!(pid = child.id(), "worker spawned");

        let stdin_writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                if let Err(e) = stdin.write_all(&input) {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        warn!("failed to write worker request: {}", e);
                    }
                }
                // stdin closes here, signalling end of request
            })
        });
        let stdout_reader = child.stdout.take().map(|stdout| {
            std::thread::spawn(move || read_bounded(stdout, max_stdout as u64))
        });
        let stderr_reader = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                let (bytes, _) = read_bounded(stderr, STDERR_LIMIT);
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        Ok(Self {
            child,
            stdout_reader,
            stderr_reader,
            stdin_writer,
            reaped: false,
            _workspace: workspace,
        })
    }

    /// Race the worker against `timeout`. On expiry the whole process group
    /// is killed before this returns.
    pub fn wait(mut self, timeout: Duration) -> Result<WaitOutcome, LaunchError> {
        let status = match self.child.wait_timeout(timeout).map_err(LaunchError::Wait)? {
            Some(status) => status,
            None => {
                debug!(pid = self.child.id(), "worker timed out");
                self.terminate();
                return Ok(WaitOutcome::TimedOut);
            }
        };
        self.reaped = true;

        if let Some(writer) = self.stdin_writer.take() {
            let _ = writer.join();
        }
        let (stdout, stdout_overflow) = self
            .stdout_reader
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr_reader
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        Ok(WaitOutcome::Exited(WorkerOutput {
            stdout,
            stdout_overflow,
            stderr,
            status,
        }))
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        #[cfg(unix)]
        {
            // The worker leads its own group; take any descendants with it.
            let pgid = self.child.id() as libc::pid_t;
            // SAFETY: plain syscall on a process group we created.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Read up to `limit` bytes, then keep draining so the writer never blocks.
fn read_bounded<R: Read>(reader: R, limit: u64) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut limited = reader.take(limit);
    let _ = limited.read_to_end(&mut buf);
    let mut rest = limited.into_inner();
    let overflow = io::copy(&mut rest, &mut io::sink()).map(|n| n > 0).unwrap_or(false);
    (buf, overflow)
}

#[cfg(unix)]
fn apply_rlimits(limits: &ProcessLimits) -> io::Result<()> {
    fn set(resource: libc::c_int, value: u64) -> io::Result<()> {
        let limit = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit reads a properly initialised rlimit struct.
        if unsafe { libc::setrlimit(resource as _, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    if limits.memory_limit_mb > 0 {
        set(libc::RLIMIT_AS as libc::c_int, limits.memory_limit_mb * 1024 * 1024)?;
    }
    if limits.cpu_secs > 0 {
        set(libc::RLIMIT_CPU as libc::c_int, limits.cpu_secs)?;
    }
    set(libc::RLIMIT_CORE as libc::c_int, 0)?;
    set(libc::RLIMIT_FSIZE as libc::c_int, limits.max_file_bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn test_worker_output_captured() {
        let worker =
            WorkerProcess::spawn(sh("cat; echo oops >&2"), b"hello".to_vec(), ProcessLimits::default(), 1024)
                .unwrap();
        match worker.wait(Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(out) => {
                assert_eq!(out.stdout, b"hello");
                assert!(!out.stdout_overflow);
                assert_eq!(out.stderr.trim(), "oops");
                assert!(out.status.success());
            }
            WaitOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_worker_timeout_kills_process() {
        let start = Instant::now();
        let worker =
            WorkerProcess::spawn(sh("sleep 30"), Vec::new(), ProcessLimits::default(), 1024).unwrap();
        let outcome = worker.wait(Duration::from_millis(300)).unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stdout_ceiling() {
        let worker =
            WorkerProcess::spawn(sh("seq 1 10000"), Vec::new(), ProcessLimits::default(), 100).unwrap();
        match worker.wait(Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(out) => {
                assert_eq!(out.stdout.len(), 100);
                assert!(out.stdout_overflow);
            }
            WaitOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_worker_runs_in_private_workspace() {
        let worker = WorkerProcess::spawn(sh("pwd; echo $HOME"), Vec::new(), ProcessLimits::default(), 4096)
            .unwrap();
        match worker.wait(Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(out) => {
                let text = String::from_utf8_lossy(&out.stdout);
                let lines: Vec<&str> = text.lines().collect();
                assert_eq!(lines.len(), 2);
                assert!(lines[0].contains("sandpit-"), "unexpected cwd {}", lines[0]);
                assert_eq!(lines[0], lines[1]);
            }
            WaitOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_workspace_removed_after_wait() {
        let worker = WorkerProcess::spawn(sh("pwd"), Vec::new(), ProcessLimits::default(), 4096).unwrap();
        let path = match worker.wait(Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(out) => String::from_utf8_lossy(&out.stdout).trim().to_string(),
            WaitOutcome::TimedOut => panic!("unexpected timeout"),
        };
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn test_signal_status_described() {
        let worker = WorkerProcess::spawn(sh("kill -9 $$"), Vec::new(), ProcessLimits::default(), 1024)
            .unwrap();
        match worker.wait(Duration::from_secs(10)).unwrap() {
            WaitOutcome::Exited(out) => assert_eq!(out.describe_status(), "killed by signal 9"),
            WaitOutcome::TimedOut => panic!("unexpected timeout"),
        }
    }

    #[test]
    fn test_spawn_failure_reported() {
        let result = WorkerProcess::spawn(
            Command::new("/nonexistent/sandpit-interpreter"),
            Vec::new(),
            ProcessLimits::default(),
            1024,
        );
        assert!(matches!(result, Err(LaunchError::Spawn(_))));
    }
}
