use thiserror::Error;

/// Error taxonomy for the control plane.
///
/// Every kind carries a stable wire code (`code()`) and an HTTP status
/// (`http_status()`) so transport adapters map mechanically and never
/// invent their own classification.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("role escalation: {0}")]
    RoleEscalation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Another mutating operation holds the per-(project, environment) lock.
    #[error("operation already in flight for {project}/{environment}")]
    Busy { project: String, environment: String },

    #[error("target slot {slot} is {state}; cleanup must run first")]
    TargetBusy { slot: String, state: String },

    #[error("slot {slot} is {state}, not deployed")]
    NotDeployed { slot: String, state: String },

    #[error("no previous version in grace; nothing to roll back to")]
    NoPreviousVersion,

    #[error("grace slot {slot} is not responding; forward-roll instead")]
    PreviousUnhealthy { slot: String },

    #[error("slot {slot} on port {port} failed its health probe")]
    Unhealthy { slot: String, port: u16 },

    #[error("no free port pair left in the {environment} range")]
    PortExhausted { environment: String },

    #[error("slot on port {port} did not report healthy within {waited_secs}s")]
    HealthTimeout { port: u16, waited_secs: u64 },

    #[error("failed to write container unit: {detail}")]
    QuadletWrite { detail: String },

    #[error("unit manager reload failed: {detail}")]
    DaemonReload { detail: String },

    #[error("container failed to start: {detail}")]
    StartFailed { detail: String },

    #[error("registry ports are inconsistent: {detail}")]
    PortsMismatch { detail: String },

    /// Connection, authentication, or I/O failure reaching a server.
    #[error("transport failure on {server}: {detail}")]
    Transport { server: String, detail: String },

    #[error("command on {server} exceeded {secs}s")]
    Timeout { server: String, secs: u64 },

    #[error("command exited {exit}: {stderr}")]
    NonzeroExit {
        exit: i32,
        stdout: String,
        stderr: String,
    },

    /// A store-time invariant recheck refused to commit. Always a bug.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("{operation} exceeded its {secs}s deadline")]
    DeadlineExceeded { operation: String, secs: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Stable wire code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Unauthenticated(_) => "unauthenticated",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::RoleEscalation(_) => "role_escalation",
            CoreError::NotFound(_) => "not_found",
            CoreError::Busy { .. } => "busy",
            CoreError::TargetBusy { .. } => "target_busy",
            CoreError::NotDeployed { .. } => "not_deployed",
            CoreError::NoPreviousVersion => "no_previous_version",
            CoreError::PreviousUnhealthy { .. } => "previous_unhealthy",
            CoreError::Unhealthy { .. } => "unhealthy",
            CoreError::PortExhausted { .. } => "port_exhausted",
            CoreError::HealthTimeout { .. } => "health_timeout",
            CoreError::QuadletWrite { .. } => "quadlet_write_failed",
            CoreError::DaemonReload { .. } => "daemon_reload_failed",
            CoreError::StartFailed { .. } => "start_failed",
            CoreError::PortsMismatch { .. } => "ports_mismatch",
            CoreError::Transport { .. } => "transport",
            CoreError::Timeout { .. } => "timeout",
            CoreError::NonzeroExit { .. } => "nonzero_exit",
            CoreError::InvariantViolation(_) => "invariant_violation",
            CoreError::DeadlineExceeded { .. } => "deadline_exceeded",
            CoreError::Validation(_) => "validation",
            CoreError::Io(_) => "io",
            CoreError::Json(_) => "serialization",
        }
    }

    /// HTTP status the transport should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Unauthenticated(_) => 401,
            CoreError::Forbidden(_) | CoreError::RoleEscalation(_) => 403,
            CoreError::NotFound(_) => 404,
            CoreError::Busy { .. }
            | CoreError::TargetBusy { .. }
            | CoreError::NotDeployed { .. }
            | CoreError::NoPreviousVersion
            | CoreError::PreviousUnhealthy { .. }
            | CoreError::Unhealthy { .. }
            | CoreError::PortExhausted { .. }
            | CoreError::HealthTimeout { .. } => 409,
            CoreError::Validation(_) => 400,
            _ => 500,
        }
    }
}

/// Truncate captured process output before embedding it in an error.
pub(crate) fn truncate_output(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… ({} bytes total)", &s[..end], s.len())
}
