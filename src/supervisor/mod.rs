//! Execution supervisor: drives one snippet through
//! Preparing → Running → Harvesting → Committing → Done.
//!
//! The supervisor holds the session's lock for the whole execution, so two
//! requests naming the same session run one after the other while requests
//! for different sessions proceed in parallel.

pub mod result;

pub use result::{
    Artifact, ErrorKind, ExecutionError, ExecutionResult, PersistenceWarning, WarningKind,
};

use crate::codec::Value;
use crate::sandbox::{
    LaunchError, Launcher, ProcessLimits, WaitOutcome, WorkerOutput, WorkerProcess,
    WORKER_BOOTSTRAP,
};
use crate::security::{check_snippet, CapabilityPolicy, RestrictedRuntime};
use crate::session::{
    Namespace, NamespaceDelta, SessionStore, SessionSummary, StoreError, VariableDescriptor,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Infrastructure failures. Anything caused by the snippet itself ends up
/// in [`ExecutionResult::error`] instead.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode worker request: {0}")]
    Request(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Preparing,
    Running,
    Harvesting,
    Committing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutBounds {
    pub default: Duration,
    pub min: Duration,
    pub max: Duration,
}

impl TimeoutBounds {
    pub fn clamp(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default).max(self.min).min(self.max)
    }
}

impl Default for TimeoutBounds {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(30),
            min: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub interpreter: String,
    pub timeouts: TimeoutBounds,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
    /// Ceiling on the worker's whole reply, bound values included.
    pub max_reply_bytes: usize,
    pub capture_artifacts: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            timeouts: TimeoutBounds::default(),
            memory_limit_mb: 1024,
            max_output_bytes: 1024 * 1024,
            max_reply_bytes: 128 * 1024 * 1024,
            capture_artifacts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub code: String,
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
    /// Drop the session's variables before running.
    pub reset_session: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            session_id: None,
            timeout: None,
            reset_session: false,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.with_timeout(Duration::from_secs(secs))
    }

    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset_session = reset;
        self
    }
}

#[derive(Serialize)]
struct WorkerRequest<'a> {
    code: &'a str,
    namespace: &'a Namespace,
    allowed_modules: &'a BTreeSet<String>,
    allowed_builtins: &'a BTreeSet<String>,
    narrowed_modules: &'a BTreeMap<String, BTreeSet<String>>,
    hidden_members: &'a BTreeMap<String, BTreeSet<String>>,
    buffer_only_members: &'a BTreeMap<String, BTreeSet<String>>,
    max_output_bytes: usize,
    capture_artifact: bool,
    collect_state: bool,
    /// Values over this are sent back as `too_large` markers.
    variable_byte_cap: usize,
    session_byte_cap: u64,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum WorkerStatus {
    Ok,
    Error,
    Violation,
}

#[derive(Debug, Deserialize)]
struct WorkerReply {
    status: WorkerStatus,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    artifact: Option<String>,
    #[serde(default)]
    changed: BTreeMap<String, Value>,
    #[serde(default)]
    removed: Vec<String>,
    /// Set when the changed values alone could not fit the session.
    #[serde(default)]
    withheld_bytes: Option<u64>,
}

pub struct Supervisor {
    store: Arc<SessionStore>,
    runtime: RestrictedRuntime,
    launcher: Box<dyn Launcher>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(
        store: Arc<SessionStore>,
        policy: &CapabilityPolicy,
        launcher: Box<dyn Launcher>,
        options: SupervisorOptions,
    ) -> Self {
        debug!(launcher = launcher.name(), "supervisor ready");
        Self {
            store,
            runtime: policy.configure(),
            launcher,
            options,
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn launcher_name(&self) -> &str {
        self.launcher.name()
    }

    /// Run one snippet. Only infrastructure failures return `Err`; every
    /// outcome of the snippet itself is a well-formed result.
    pub fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SupervisorError> {
        let started = Instant::now();
        let timeout = self.options.timeouts.clamp(request.timeout);
        let session_id = request.session_id.as_deref();

        let lock = session_id.map(|id| self.store.session_lock(id));
        let _held = lock
            .as_ref()
            .map(|l| l.lock().unwrap_or_else(PoisonError::into_inner));

        let mut result = ExecutionResult::new(request.session_id.clone());
        let mut run = PhaseLog::new(session_id);

        if let Err(violation) = check_snippet(&request.code, &self.runtime) {
            info!(session = session_id, "snippet rejected: {}", violation);
            result.error = Some(ExecutionError::new(
                ErrorKind::SandboxViolation,
                violation.to_string(),
            ));
            run.enter(Phase::Failed);
            return Ok(finish(result, started));
        }

        // a reset run starts empty; stored state goes only if it commits
        let namespace = match session_id {
            Some(id) if !request.reset_session => self.store.get_namespace(id)?,
            _ => Namespace::new(),
        };
        let input = serde_json::to_vec(&WorkerRequest {
            code: &request.code,
            namespace: &namespace,
            allowed_modules: &self.runtime.allowed_modules,
            allowed_builtins: &self.runtime.allowed_builtins,
            narrowed_modules: &self.runtime.narrowed_modules,
            hidden_members: &self.runtime.hidden_members,
            buffer_only_members: &self.runtime.buffer_only_members,
            max_output_bytes: self.options.max_output_bytes,
            capture_artifact: self.options.capture_artifacts,
            collect_state: session_id.is_some(),
            variable_byte_cap: self.store.guard().variable_byte_cap(),
            session_byte_cap: self.store.session_byte_cap(),
        })?;
        let limits = ProcessLimits {
            memory_limit_mb: self.options.memory_limit_mb,
            cpu_secs: timeout.as_secs() + 1,
            ..ProcessLimits::default()
        };
        let cmd = self
            .launcher
            .command(&self.options.interpreter, &["-B", "-c", WORKER_BOOTSTRAP]);
        let worker = WorkerProcess::spawn(cmd, input, limits, self.options.max_reply_bytes)?;

        run.enter(Phase::Running);
        let output = match worker.wait(timeout)? {
            WaitOutcome::Exited(output) => output,
            WaitOutcome::TimedOut => {
                result.error = Some(ExecutionError::new(
                    ErrorKind::TimeoutExceeded,
                    format!("execution exceeded the {}s timeout", format_secs(timeout)),
                ));
                run.enter(Phase::Failed);
                return Ok(finish(result, started));
            }
        };

        run.enter(Phase::Harvesting);
        let reply = match self.read_reply(&output) {
            Ok(reply) => reply,
            Err(message) => {
                warn!(session = session_id, "{}", message);
                result.error = Some(ExecutionError::new(ErrorKind::WorkerCrashed, message));
                run.enter(Phase::Failed);
                return Ok(finish(result, started));
            }
        };

        result.stdout_text = reply.stdout;
        result.truncated = reply.truncated;
        result.artifact = reply.artifact.and_then(|encoded| {
            match base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) {
                Ok(data) => Some(Artifact::png(data)),
                Err(e) => {
                    warn!("discarding undecodable artifact: {}", e);
                    None
                }
            }
        });

        match reply.status {
            WorkerStatus::Violation => {
                let message = reply
                    .error
                    .unwrap_or_else(|| "disallowed capability".to_string());
                info!(session = session_id, "runtime violation: {}", message);
                result.error = Some(ExecutionError::new(ErrorKind::SandboxViolation, message));
                run.enter(Phase::Failed);
                return Ok(finish(result, started));
            }
            WorkerStatus::Error => {
                let message = reply
                    .error
                    .unwrap_or_else(|| "snippet raised an exception".to_string());
                result.error = Some(ExecutionError::runtime(reply.error_type, message));
            }
            WorkerStatus::Ok => {}
        }

        if let Some(id) = session_id {
            run.enter(Phase::Committing);
            if let Some(attempted) = reply.withheld_bytes {
                let cap = self.store.session_byte_cap();
                warn!(session = id, attempted, cap, "session state not persisted");
                result.warnings.push(state_not_persisted(attempted, cap));
            } else {
                let delta = NamespaceDelta {
                    changed: reply.changed,
                    removed: reply.removed,
                    replace: request.reset_session,
                };
                match self.store.commit(id, &delta) {
                    Ok(report) => result
                        .warnings
                        .extend(report.dropped.into_iter().map(PersistenceWarning::from)),
                    Err(StoreError::SessionOverflow {
                        attempted, cap, ..
                    }) => {
                        warn!(session = id, attempted, cap, "session state not persisted");
                        result.warnings.push(state_not_persisted(attempted, cap));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        run.enter(Phase::Done);
        Ok(finish(result, started))
    }

    fn read_reply(&self, output: &WorkerOutput) -> Result<WorkerReply, String> {
        if output.stdout_overflow {
            return Err(format!(
                "worker reply exceeded {} bytes",
                self.options.max_reply_bytes
            ));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| {
            let mut message = format!("worker exited unexpectedly ({})", output.describe_status());
            match output.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
                Some(last) => {
                    message.push_str(": ");
                    message.push_str(last.trim());
                }
                None if !output.stdout.is_empty() => {
                    message.push_str(&format!(": unreadable reply: {}", e));
                }
                None => {}
            }
            message
        })
    }

    pub fn list_variables(&self, session_id: &str) -> Result<Vec<VariableDescriptor>, StoreError> {
        self.store.list_variables(session_id)
    }

    pub fn list_sessions(&self, include_inactive: bool) -> Result<Vec<SessionSummary>, StoreError> {
        self.store.list_sessions(include_inactive)
    }

    /// Waits for any execution on the session to finish first.
    pub fn clear_session(&self, session_id: &str) -> Result<(), StoreError> {
        let lock = self.store.session_lock(session_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.clear(session_id)
    }

    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let lock = self.store.session_lock(session_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store.delete(session_id)
    }
}

struct PhaseLog<'a> {
    session: Option<&'a str>,
    phase: Phase,
    since: Instant,
}

impl<'a> PhaseLog<'a> {
    fn new(session: Option<&'a str>) -> Self {
        debug!(session, phase = ?Phase::Preparing, "phase");
        Self {
            session,
            phase: Phase::Preparing,
            since: Instant::now(),
        }
    }

    fn enter(&mut self, next: Phase) {
        debug!(
            session = self.session,
            from = ?self.phase,
            phase = ?next,
            elapsed_ms = self.since.elapsed().as_millis() as u64,
            "phase"
        );
        self.phase = next;
        self.since = Instant::now();
    }
}

fn state_not_persisted(attempted: u64, cap: u64) -> PersistenceWarning {
    PersistenceWarning {
        kind: WarningKind::StateNotPersisted,
        variable: None,
        message: format!(
            "session state not persisted: {} bytes would exceed the {} byte session cap",
            attempted, cap
        ),
    }
}

fn finish(mut result: ExecutionResult, started: Instant) -> ExecutionResult {
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}

fn format_secs(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::StoreOptions;
    use std::process::Command;

    /// Ignores the interpreter and runs a shell script in its place.
    struct ScriptLauncher(String);

    impl Launcher for ScriptLauncher {
        fn name(&self) -> &str {
            "script"
        }

        fn command(&self, _program: &str, _args: &[&str]) -> Command {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", self.0.as_str()]);
            cmd
        }
    }

    fn reply_script(reply: &str) -> String {
        format!("cat >/dev/null; printf '%s' '{}'", reply)
    }

    fn supervisor(script: &str) -> Supervisor {
        let store = Arc::new(
            SessionStore::in_memory(StoreOptions {
                sweep_interval: None,
                ..StoreOptions::default()
            })
            .unwrap(),
        );
        Supervisor::new(
            store,
            &CapabilityPolicy::default(),
            Box::new(ScriptLauncher(script.to_string())),
            SupervisorOptions::default(),
        )
    }

    #[test]
    fn test_timeout_clamping() {
        let bounds = TimeoutBounds::default();
        assert_eq!(bounds.clamp(None), Duration::from_secs(30));
        assert_eq!(bounds.clamp(Some(Duration::ZERO)), Duration::from_secs(1));
        assert_eq!(bounds.clamp(Some(Duration::from_secs(10_000))), Duration::from_secs(300));
        assert_eq!(bounds.clamp(Some(Duration::from_secs(5))), Duration::from_secs(5));
    }

    #[test]
    fn test_reply_committed_to_session() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"hi\n","changed":{"x":{"t":"int","v":1}},"removed":[]}"#,
        ));
        let result = sup
            .execute(ExecutionRequest::new("x = 1\nprint('hi')").with_session("s1"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout_text, "hi\n");

        let vars = sup.list_variables("s1").unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "x");
        assert_eq!(vars[0].type_tag, "int");
    }

    #[test]
    fn test_stateless_execution_touches_no_session() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"","changed":{"x":{"t":"int","v":1}}}"#,
        ));
        let result = sup.execute(ExecutionRequest::new("x = 1")).unwrap();
        assert!(result.is_success());
        assert!(result.session_id.is_none());
        assert!(sup.list_sessions(true).unwrap().is_empty());
    }

    #[test]
    fn test_static_violation_spawns_nothing() {
        // the script would hang if it were ever started
        let sup = supervisor("sleep 30");
        let started = Instant::now();
        let result = sup
            .execute(ExecutionRequest::new("import os").with_session("s1"))
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::SandboxViolation));
        assert!(result.error.unwrap().message.contains("not allowed"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            sup.list_variables("s1"),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_runtime_violation_does_not_commit() {
        let sup = supervisor(&reply_script(
            r#"{"status":"violation","stdout":"","error":"import of module \u0027os\u0027 is not allowed","changed":{"x":{"t":"int","v":2}}}"#,
        ));
        let result = sup
            .execute(ExecutionRequest::new("x = 2").with_session("s1"))
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::SandboxViolation));
        assert!(sup.store().session_info("s1").unwrap().is_none());
    }

    #[test]
    fn test_runtime_error_keeps_output_and_commits() {
        let sup = supervisor(&reply_script(
            r#"{"status":"error","stdout":"before\n","error":"ZeroDivisionError: division by zero (line 3)","error_type":"ZeroDivisionError","changed":{"a":{"t":"int","v":5}}}"#,
        ));
        let result = sup
            .execute(ExecutionRequest::new("a = 5\nprint('before')\n1/0").with_session("s1"))
            .unwrap();
        let error = result.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert_eq!(error.exception.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(result.stdout_text, "before\n");
        assert_eq!(sup.list_variables("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_timeout_kills_worker() {
        let sup = supervisor("sleep 30");
        let started = Instant::now();
        let result = sup
            .execute(
                ExecutionRequest::new("while True: pass")
                    .with_session("s1")
                    .with_timeout_secs(1),
            )
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::TimeoutExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sup.store().session_info("s1").unwrap().is_none());
    }

    #[test]
    fn test_crashed_worker_reported() {
        let sup = supervisor("cat >/dev/null; echo 'Fatal Python error: boom' >&2; kill -9 $$");
        let result = sup
            .execute(ExecutionRequest::new("x = 1").with_session("s1"))
            .unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::WorkerCrashed);
        assert!(error.message.contains("signal 9"), "{}", error.message);
        assert!(error.message.contains("boom"));
    }

    #[test]
    fn test_garbage_reply_reported() {
        let sup = supervisor("cat >/dev/null; echo not json");
        let result = sup.execute(ExecutionRequest::new("pass")).unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerCrashed));
    }

    #[test]
    fn test_unpersistable_value_becomes_warning() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"","changed":{"f":{"t":"opaque","v":"function"},"n":{"t":"int","v":3}}}"#,
        ));
        let result = sup
            .execute(ExecutionRequest::new("f = lambda: 1\nn = 3").with_session("s1"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::Unserializable);
        assert_eq!(result.warnings[0].variable.as_deref(), Some("f"));
        let names: Vec<_> = sup
            .list_variables("s1")
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, ["n"]);
    }

    #[test]
    fn test_session_overflow_flags_state_not_persisted() {
        let store = Arc::new(
            SessionStore::in_memory(StoreOptions {
                variable_byte_cap: 1024,
                session_byte_cap: 64,
                sweep_interval: None,
                ..StoreOptions::default()
            })
            .unwrap(),
        );
        let big = "y".repeat(200);
        let sup = Supervisor::new(
            store,
            &CapabilityPolicy::default(),
            Box::new(ScriptLauncher(reply_script(&format!(
                r#"{{"status":"ok","stdout":"done\n","changed":{{"s":{{"t":"str","v":"{}"}}}}}}"#,
                big
            )))),
            SupervisorOptions::default(),
        );
        let result = sup
            .execute(ExecutionRequest::new("s = 'y' * 200").with_session("s1"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout_text, "done\n");
        assert!(!result.state_persisted());
    }

    #[test]
    fn test_reset_session_clears_first() {
        let sup = supervisor(&reply_script(r#"{"status":"ok","stdout":""}"#));
        sup.store()
            .commit(
                "s1",
                &NamespaceDelta {
                    changed: [("old".to_string(), Value::Int(1))].into(),
                    removed: Vec::new(),
                    replace: false,
                },
            )
            .unwrap();
        sup.execute(ExecutionRequest::new("pass").with_session("s1").with_reset(true))
            .unwrap();
        assert!(sup.list_variables("s1").unwrap().is_empty());
    }

    fn seed(sup: &Supervisor, name: &str) {
        sup.store()
            .commit(
                "s1",
                &NamespaceDelta {
                    changed: [(name.to_string(), Value::Int(1))].into(),
                    removed: Vec::new(),
                    replace: false,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_rejected_reset_keeps_state() {
        let sup = supervisor("sleep 30");
        seed(&sup, "x");
        let result = sup
            .execute(
                ExecutionRequest::new("import os")
                    .with_session("s1")
                    .with_reset(true),
            )
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::SandboxViolation));
        let vars = sup.list_variables("s1").unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "x");
    }

    #[test]
    fn test_reset_with_runtime_violation_keeps_state() {
        let sup = supervisor(&reply_script(
            r#"{"status":"violation","stdout":"","error":"use of \u0027attrgetter\u0027 is not allowed"}"#,
        ));
        seed(&sup, "x");
        let result = sup
            .execute(ExecutionRequest::new("pass").with_session("s1").with_reset(true))
            .unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::SandboxViolation));
        assert_eq!(sup.list_variables("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_reset_replaces_state_on_commit() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"","changed":{"y":{"t":"int","v":2}}}"#,
        ));
        seed(&sup, "x");
        sup.execute(ExecutionRequest::new("y = 2").with_session("s1").with_reset(true))
            .unwrap();
        let names: Vec<_> = sup
            .list_variables("s1")
            .unwrap()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, ["y"]);
    }

    #[test]
    fn test_withheld_state_flags_not_persisted() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"done\n","withheld_bytes":99999999}"#,
        ));
        seed(&sup, "x");
        let result = sup
            .execute(ExecutionRequest::new("pass").with_session("s1"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.stdout_text, "done\n");
        assert!(!result.state_persisted());
        assert!(result.warnings[0].message.contains("99999999"));
        let info = sup.store().session_info("s1").unwrap().unwrap();
        assert_eq!(info.execution_count, 1);
    }

    #[test]
    fn test_size_marker_becomes_too_large_warning() {
        let sup = supervisor(&reply_script(
            r#"{"status":"ok","stdout":"","changed":{"big":{"t":"too_large","v":{"type_name":"str","size":140000000}},"small":{"t":"int","v":1}}}"#,
        ));
        let result = sup
            .execute(ExecutionRequest::new("pass").with_session("s1"))
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].kind, WarningKind::TooLarge);
        assert_eq!(result.warnings[0].variable.as_deref(), Some("big"));
        let vars = sup.list_variables("s1").unwrap();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].name, "small");
    }

    #[test]
    fn test_different_sessions_run_in_parallel() {
        let sup = Arc::new(supervisor(&format!(
            "cat >/dev/null; sleep 1; printf '%s' '{}'",
            r#"{"status":"ok","stdout":""}"#
        )));
        let started = Instant::now();
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let sup = sup.clone();
                std::thread::spawn(move || {
                    sup.execute(ExecutionRequest::new("pass").with_session(id))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_success());
        }
        assert!(
            started.elapsed() < Duration::from_millis(2500),
            "took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_same_session_runs_serialized() {
        let sup = Arc::new(supervisor(&format!(
            "cat >/dev/null; sleep 1; printf '%s' '{}'",
            r#"{"status":"ok","stdout":""}"#
        )));
        let started = Instant::now();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let sup = sup.clone();
                std::thread::spawn(move || {
                    sup.execute(ExecutionRequest::new("pass").with_session("shared"))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(started.elapsed() >= Duration::from_secs(2));
        let info = sup.store().session_info("shared").unwrap().unwrap();
        assert_eq!(info.execution_count, 2);
    }
}
