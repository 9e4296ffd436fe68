use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::registry::{Environment, SlotName};
use crate::teams::AuthContext;

/* ============================= EVENTS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Deploy,
    Promote,
    Rollback,
    Cleanup,
    AuthzDenied,
    Reconcile,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Deploy => "deploy",
            AuditKind::Promote => "promote",
            AuditKind::Rollback => "rollback",
            AuditKind::Cleanup => "cleanup",
            AuditKind::AuthzDenied => "authz_denied",
            AuditKind::Reconcile => "reconcile",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the append-only change history. Never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event: AuditKind,
    pub project: String,
    pub environment: Environment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_slot: Option<SlotName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_slot: Option<SlotName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub token_id: String,
    pub team_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event: AuditKind,
        project: &str,
        environment: Environment,
        auth: &AuthContext,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            project: project.to_string(),
            environment,
            from_slot: None,
            to_slot: None,
            from_version: None,
            to_version: None,
            reason: None,
            token_id: auth.token_id.clone(),
            team_id: auth.team_id.clone(),
            duration_ms: None,
            success: true,
            error: None,
        }
    }

    pub fn slots(mut self, from: Option<SlotName>, to: Option<SlotName>) -> Self {
        self.from_slot = from;
        self.to_slot = to;
        self
    }

    pub fn versions(mut self, from: Option<String>, to: Option<String>) -> Self {
        self.from_version = from;
        self.to_version = to;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn duration(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn failed(mut self, error: &CoreError) -> Self {
        self.success = false;
        self.error = Some(format!("{}: {error}", error.code()));
        self
    }
}

/* ============================= LOG ============================= */

/// JSON-lines audit stream, one file per (operation, project, environment).
#[derive(Debug, Clone)]
pub struct AuditLog {
    root: PathBuf,
}

impl AuditLog {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, kind: AuditKind, project: &str, environment: Environment) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(format!("{project}-{environment}.jsonl"))
    }

    pub fn append(&self, event: &AuditEvent) -> Result<(), CoreError> {
        let path = self.path_for(event.event, &event.project, event.environment);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(())
    }

    /// Events for one (operation, project, environment), oldest first.
    /// Missing file means no history yet.
    pub fn read(
        &self,
        kind: AuditKind,
        project: &str,
        environment: Environment,
    ) -> Result<Vec<AuditEvent>, CoreError> {
        let path = self.path_for(kind, project, environment);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::Io(e)),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn auth() -> AuthContext {
        AuthContext::system()
    }

    #[test]
    fn test_append_and_read_back() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().to_path_buf());
        let ev = AuditEvent::new(AuditKind::Deploy, "web", Environment::Production, &auth())
            .slots(None, Some(SlotName::Blue))
            .versions(None, Some("sha-aaa".into()))
            .duration(1200);
        log.append(&ev).unwrap();
        log.append(&ev).unwrap();

        let events = log.read(AuditKind::Deploy, "web", Environment::Production).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].to_slot, Some(SlotName::Blue));
        assert_eq!(events[0].to_version.as_deref(), Some("sha-aaa"));
        assert!(events[0].success);
    }

    #[test]
    fn test_kinds_are_separate_streams() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().to_path_buf());
        log.append(&AuditEvent::new(AuditKind::Deploy, "web", Environment::Production, &auth()))
            .unwrap();
        log.append(&AuditEvent::new(AuditKind::Promote, "web", Environment::Production, &auth()))
            .unwrap();

        assert_eq!(log.read(AuditKind::Deploy, "web", Environment::Production).unwrap().len(), 1);
        assert_eq!(log.read(AuditKind::Promote, "web", Environment::Production).unwrap().len(), 1);
        assert_eq!(log.read(AuditKind::Rollback, "web", Environment::Production).unwrap().len(), 0);
    }

    #[test]
    fn test_failed_event_records_code() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().to_path_buf());
        let err = CoreError::HealthTimeout { port: 4000, waited_secs: 60 };
        log.append(
            &AuditEvent::new(AuditKind::Deploy, "web", Environment::Production, &auth())
                .failed(&err),
        )
        .unwrap();
        let events = log.read(AuditKind::Deploy, "web", Environment::Production).unwrap();
        assert!(!events[0].success);
        assert!(events[0].error.as_deref().unwrap().starts_with("health_timeout"));
    }

    #[test]
    fn test_read_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().to_path_buf());
        assert!(log.read(AuditKind::Cleanup, "web", Environment::Staging).unwrap().is_empty());
    }

    #[test]
    fn test_path_layout() {
        let tmp = TempDir::new().unwrap();
        let log = AuditLog::new(tmp.path().to_path_buf());
        log.append(&AuditEvent::new(AuditKind::Deploy, "web", Environment::Production, &auth()))
            .unwrap();
        assert!(tmp.path().join("deploy/web-production.jsonl").is_file());
    }
}
