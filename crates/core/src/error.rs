use serde::{Deserialize, Serialize};

/// Validation failures on a single function spec. Raised before any network
/// call and scoped to the offending function.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum SpecError {
    #[error("{function}: topic required for trigger event")]
    TopicRequired { function: String },
    #[error("{function}: schedule required for schedule event")]
    ScheduleRequired { function: String },
    #[error("{function}: unsupported event type '{kind}'")]
    UnsupportedEvent { function: String, kind: String },
    #[error("{function}: format of 'environment' is unknown: neither mapping nor list")]
    MalformedEnvironment { function: String },
    #[error("{function}: at most one event is supported per function (found {count})")]
    MultipleEvents { function: String, count: usize },
    #[error("{function}: runtime required")]
    MissingRuntime { function: String },
}

/// Errors surfaced by a [`crate::ResourceClient`] or [`crate::InstanceSource`].
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP-equivalent status code, when the failure carries one.
    pub fn code(&self) -> Option<u16> {
        match self {
            ClientError::NotFound(_) => Some(404),
            ClientError::Conflict(_) => Some(409),
            ClientError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ClientError::NotFound(m)
            | ClientError::Conflict(m)
            | ClientError::Timeout(m)
            | ClientError::Transport(m)
            | ClientError::Decode(m) => m,
            ClientError::Api { message, .. } => message,
        }
    }

    /// Transient request timeout; pollers retry these on the next tick.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Timeout(_) => true,
            ClientError::Transport(m) => m.contains("request timed out"),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClientError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, ClientError::Conflict(_)) }
}

/// Per-function (or per-run) deployment failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeployError {
    #[error(transparent)]
    Invalid(#[from] SpecError),
    #[error("Unable to {verb} the function {name}. Received:\n  Code: {code}\n  Message: {message}")]
    Apply { verb: &'static str, name: String, code: u16, message: String },
    #[error("Failed to deploy the function {name}: container restarted {restarts} times without becoming ready")]
    CrashLoop { name: String, restarts: i32 },
    #[error("Unable to retrieve the status of the {name} deployment")]
    GaveUp { name: String },
    #[error("{context}: {source}")]
    Client { context: String, source: ClientError },
    #[error("Unable to deploy the ingress rule. Received: {0}")]
    Ingress(String),
    #[error("Unable to remove the function {name}. Received:\n  Code: {code}\n  Message: {message}")]
    Remove { name: String, code: u16, message: String },
    #[error("{}", .0.join("\n"))]
    Aggregate(Vec<String>),
}

impl DeployError {
    /// Wrap a failed create/update call with the resource name, response code and message.
    pub fn apply(verb: &'static str, name: &str, err: &ClientError) -> Self {
        DeployError::Apply { verb, name: name.to_string(), code: err.code().unwrap_or(500), message: err.message().to_string() }
    }

    pub fn client(context: impl Into<String>, source: ClientError) -> Self {
        DeployError::Client { context: context.into(), source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_carries_name_code_and_message() {
        let e = DeployError::apply("deploy", "hello", &ClientError::Api { code: 422, message: "bad spec".into() });
        let s = e.to_string();
        assert!(s.starts_with("Unable to deploy the function hello."), "s={}", s);
        assert!(s.contains("Code: 422"));
        assert!(s.contains("Message: bad spec"));
    }

    #[test]
    fn aggregate_joins_with_newlines() {
        let e = DeployError::Aggregate(vec!["a failed".into(), "b failed".into()]);
        assert_eq!(e.to_string(), "a failed\nb failed");
    }

    #[test]
    fn timeout_detection_covers_transport_messages() {
        assert!(ClientError::Timeout("pods".into()).is_timeout());
        assert!(ClientError::Transport("ESOCKET: request timed out".into()).is_timeout());
        assert!(!ClientError::Transport("connection refused".into()).is_timeout());
        assert_eq!(ClientError::Conflict("x".into()).code(), Some(409));
    }
}
