use crate::codec::GuardError;
use crate::session::DroppedVariable;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SandboxViolation,
    TimeoutExceeded,
    /// The snippet itself raised.
    Runtime,
    /// The worker died or answered with something unreadable.
    WorkerCrashed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::SandboxViolation => "sandbox violation",
            ErrorKind::TimeoutExceeded => "timeout exceeded",
            ErrorKind::Runtime => "runtime error",
            ErrorKind::WorkerCrashed => "worker crashed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    /// Exception class name for runtime errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exception: None,
        }
    }

    pub fn runtime(exception: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: message.into(),
            exception,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            // already reads like "NameError: name 'x' is not defined (line 1)"
            ErrorKind::Runtime => f.write_str(&self.message),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Unserializable,
    TooLarge,
    StateNotPersisted,
}

/// Something the execution produced that the session will not remember.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistenceWarning {
    pub kind: WarningKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    pub message: String,
}

impl From<DroppedVariable> for PersistenceWarning {
    fn from(dropped: DroppedVariable) -> Self {
        let kind = match dropped.error {
            GuardError::TooLarge { .. } => WarningKind::TooLarge,
            GuardError::Unserializable { .. } | GuardError::Corrupt(_) => WarningKind::Unserializable,
        };
        Self {
            kind,
            message: format!("variable '{}' was not persisted: {}", dropped.name, dropped.error),
            variable: Some(dropped.name),
        }
    }
}

impl fmt::Display for PersistenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub mime_type: String,
    #[serde(with = "crate::codec::value::base64_bytes")]
    pub data: Vec<u8>,
}

impl Artifact {
    pub fn png(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/png".to_string(),
            data,
        }
    }

    pub fn extension(&self) -> &str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            _ => "bin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub session_id: Option<String>,
    pub stdout_text: String,
    /// Output went past the configured ceiling and was cut.
    pub truncated: bool,
    pub error: Option<ExecutionError>,
    pub artifact: Option<Artifact>,
    pub warnings: Vec<PersistenceWarning>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub(crate) fn new(session_id: Option<String>) -> Self {
        Self {
            session_id,
            stdout_text: String::new(),
            truncated: false,
            error: None,
            artifact: None,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn state_persisted(&self) -> bool {
        !self
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::StateNotPersisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_variable_becomes_warning() {
        let warning = PersistenceWarning::from(DroppedVariable {
            name: "big".to_string(),
            error: GuardError::TooLarge { size: 10, cap: 5 },
        });
        assert_eq!(warning.kind, WarningKind::TooLarge);
        assert_eq!(warning.variable.as_deref(), Some("big"));
        assert!(warning.message.contains("'big'"));
    }

    #[test]
    fn test_error_display() {
        let runtime = ExecutionError::runtime(
            Some("NameError".into()),
            "NameError: name 'x' is not defined (line 1)",
        );
        assert_eq!(runtime.to_string(), "NameError: name 'x' is not defined (line 1)");

        let timeout = ExecutionError::new(ErrorKind::TimeoutExceeded, "execution exceeded 1s");
        assert_eq!(timeout.to_string(), "timeout exceeded: execution exceeded 1s");
    }

    #[test]
    fn test_result_json_shape() {
        let mut result = ExecutionResult::new(Some("s1".into()));
        result.stdout_text = "hi\n".into();
        result.artifact = Some(Artifact::png(vec![0x89, b'P', b'N', b'G']));
        result.warnings.push(PersistenceWarning {
            kind: WarningKind::StateNotPersisted,
            variable: None,
            message: "session full".into(),
        });

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["error"], serde_json::Value::Null);
        assert_eq!(json["artifact"]["mime_type"], "image/png");
        assert_eq!(json["artifact"]["data"], "iVBORw==");
        assert_eq!(json["warnings"][0]["kind"], "state_not_persisted");
        assert!(json["warnings"][0].get("variable").is_none());
        assert!(!result.state_persisted());
    }
}
