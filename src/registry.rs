use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/* ============================= ENVIRONMENT ============================= */

/// Deployment environment. Each one owns a disjoint port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Staging,
    Production,
    Preview,
}

impl Environment {
    pub const ALL: [Environment; 3] = [
        Environment::Staging,
        Environment::Production,
        Environment::Preview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Staging => "staging",
            Environment::Production => "production",
            Environment::Preview => "preview",
        }
    }

    /// Inclusive port range reserved for this environment.
    pub fn port_range(&self) -> (u16, u16) {
        match self {
            Environment::Staging => (3000, 3499),
            Environment::Production => (4000, 4499),
            Environment::Preview => (5000, 5999),
        }
    }

    pub fn contains_port(&self, port: u16) -> bool {
        let (lo, hi) = self.port_range();
        (lo..=hi).contains(&port)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(Environment::Staging),
            "production" => Ok(Environment::Production),
            "preview" => Ok(Environment::Preview),
            other => Err(CoreError::Validation(format!(
                "unknown environment '{other}' (staging|production|preview)"
            ))),
        }
    }
}

/* ============================= SLOT ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotName {
    Blue,
    Green,
}

impl SlotName {
    pub fn other(&self) -> SlotName {
        match self {
            SlotName::Blue => SlotName::Green,
            SlotName::Green => SlotName::Blue,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotName::Blue => "blue",
            SlotName::Green => "green",
        }
    }
}

impl fmt::Display for SlotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Empty,
    Deployed,
    Active,
    Grace,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Deployed => "deployed",
            SlotState::Active => "active",
            SlotState::Grace => "grace",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One of the two parallel runtime instances of a (project, environment).
///
/// The port is stable for the lifetime of the pair; everything else is
/// cleared when the slot returns to `empty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub name: SlotName,
    pub state: SlotState,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_back_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_expires_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
}

impl Slot {
    pub fn empty(name: SlotName, port: u16) -> Self {
        Self {
            name,
            state: SlotState::Empty,
            port,
            version: None,
            image: None,
            deployed_at: None,
            deployed_by: None,
            promoted_at: None,
            promoted_by: None,
            rolled_back_at: None,
            rolled_back_by: None,
            grace_expires_at: None,
            health: HealthStatus::Unknown,
        }
    }

    /// Reset to `empty`, keeping name and port (the pair stays stable).
    pub fn reset(&mut self) {
        *self = Slot::empty(self.name, self.port);
    }
}

/* ============================= PROJECT SLOTS ============================= */

/// The per-(project, environment) registry document describing both slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSlots {
    pub project: String,
    pub environment: Environment,
    pub active_slot: SlotName,
    pub blue: Slot,
    pub green: Slot,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrated_from: Option<String>,
}

impl ProjectSlots {
    /// Fresh document for a first deploy: both slots empty, blue active-elect.
    pub fn new(project: &str, environment: Environment, blue_port: u16, green_port: u16) -> Self {
        Self {
            project: project.to_string(),
            environment,
            active_slot: SlotName::Blue,
            blue: Slot::empty(SlotName::Blue, blue_port),
            green: Slot::empty(SlotName::Green, green_port),
            last_updated: Utc::now(),
            migrated_from: None,
        }
    }

    pub fn slot(&self, name: SlotName) -> &Slot {
        match name {
            SlotName::Blue => &self.blue,
            SlotName::Green => &self.green,
        }
    }

    pub fn slot_mut(&mut self, name: SlotName) -> &mut Slot {
        match name {
            SlotName::Blue => &mut self.blue,
            SlotName::Green => &mut self.green,
        }
    }

    /// Structural invariant recheck. Run before every store; a violation
    /// means a bug upstream, never a user error.
    pub fn validate(&self) -> Result<(), CoreError> {
        // Port disjointness, range membership, even/odd pairing.
        if self.blue.port == self.green.port {
            return Err(violation(format!(
                "{}/{}: blue and green share port {}",
                self.project, self.environment, self.blue.port
            )));
        }
        for slot in [&self.blue, &self.green] {
            if !self.environment.contains_port(slot.port) {
                return Err(violation(format!(
                    "{}/{}: {} port {} outside the {} range",
                    self.project, self.environment, slot.name, slot.port, self.environment
                )));
            }
        }
        if self.blue.port % 2 != 0 || self.green.port % 2 != 1 {
            return Err(violation(format!(
                "{}/{}: pair parity broken (blue={}, green={})",
                self.project, self.environment, self.blue.port, self.green.port
            )));
        }

        // State skeleton: at most one active, at most one grace.
        let actives = [&self.blue, &self.green]
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .count();
        let graces = [&self.blue, &self.green]
            .iter()
            .filter(|s| s.state == SlotState::Grace)
            .count();
        if actives > 1 {
            return Err(violation(format!(
                "{}/{}: both slots active",
                self.project, self.environment
            )));
        }
        if graces > 1 {
            return Err(violation(format!(
                "{}/{}: both slots in grace",
                self.project, self.environment
            )));
        }

        // Active consistency.
        for slot in [&self.blue, &self.green] {
            if slot.state == SlotState::Active && slot.name != self.active_slot {
                return Err(violation(format!(
                    "{}/{}: {} is active but active_slot={}",
                    self.project, self.environment, slot.name, self.active_slot
                )));
            }
        }

        // Grace discipline and timestamp monotonicity.
        for slot in [&self.blue, &self.green] {
            match (slot.state, slot.grace_expires_at) {
                (SlotState::Grace, None) => {
                    return Err(violation(format!(
                        "{}/{}: {} in grace without expiry",
                        self.project, self.environment, slot.name
                    )));
                }
                (s, Some(_)) if s != SlotState::Grace => {
                    return Err(violation(format!(
                        "{}/{}: {} carries a grace expiry while {}",
                        self.project, self.environment, slot.name, s
                    )));
                }
                _ => {}
            }
            if let (Some(d), Some(p)) = (slot.deployed_at, slot.promoted_at) {
                if d > p {
                    return Err(violation(format!(
                        "{}/{}: {} promoted before deployed",
                        self.project, self.environment, slot.name
                    )));
                }
            }
            if let (Some(p), Some(r)) = (slot.promoted_at, slot.rolled_back_at) {
                if p > r {
                    return Err(violation(format!(
                        "{}/{}: {} rolled back before promoted",
                        self.project, self.environment, slot.name
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn both_empty(&self) -> bool {
        self.blue.state == SlotState::Empty && self.green.state == SlotState::Empty
    }
}

fn violation(detail: String) -> CoreError {
    CoreError::InvariantViolation(detail)
}

/* ============================= SLUGS ============================= */

/// Lowercase-alnum-hyphen check shared by project names and team slugs.
/// Also the gate that keeps identifiers shell- and path-safe.
pub fn is_valid_slug(s: &str, min: usize, max: usize) -> bool {
    if s.len() < min || s.len() > max {
        return false;
    }
    if s.starts_with('-') || s.ends_with('-') {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

pub fn validate_project_name(name: &str) -> Result<(), CoreError> {
    if is_valid_slug(name, 1, 50) {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid project name '{name}' (lowercase alphanumerics and hyphens, 1-50 chars)"
        )))
    }
}

/* ============================= SLOT STORE ============================= */

/// Listing row for ops queries; cheap to serialize, no slot internals.
#[derive(Debug, Clone, Serialize)]
pub struct SlotsSummary {
    pub project: String,
    pub environment: Environment,
    pub active_slot: SlotName,
    pub blue_state: SlotState,
    pub green_state: SlotState,
    pub blue_version: Option<String>,
    pub green_version: Option<String>,
    pub last_updated: DateTime<Utc>,
}

/// Durable JSON store for `ProjectSlots` documents.
///
/// Only the control loop mutates these, serialized per (project,
/// environment); the store's job is atomic persistence plus the
/// store-time invariant recheck.
#[derive(Debug, Clone)]
pub struct SlotStore {
    root: PathBuf,
}

impl SlotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn path_for(&self, project: &str, environment: Environment) -> PathBuf {
        self.root.join(format!("{project}-{environment}.json"))
    }

    pub fn exists(&self, project: &str, environment: Environment) -> bool {
        self.path_for(project, environment).exists()
    }

    pub fn load(&self, project: &str, environment: Environment) -> Result<ProjectSlots, CoreError> {
        let path = self.path_for(project, environment);
        let raw = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("no slot registry for {project}/{environment}"))
            } else {
                CoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Atomic write-then-rename; refuses documents violating invariants,
    /// and refuses a both-empty document (cleanup removes it instead).
    pub fn store(&self, slots: &ProjectSlots) -> Result<(), CoreError> {
        slots.validate()?;
        if slots.both_empty() {
            return Err(CoreError::InvariantViolation(format!(
                "{}/{}: refusing to store a document with both slots empty",
                slots.project, slots.environment
            )));
        }
        fs::create_dir_all(&self.root)?;
        let path = self.path_for(&slots.project, slots.environment);
        write_atomic(&path, &serde_json::to_vec_pretty(slots)?)
    }

    pub fn remove(&self, project: &str, environment: Environment) -> Result<(), CoreError> {
        let path = self.path_for(project, environment);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// All registry documents, summarized. Unreadable files are skipped
    /// (surfaced by reconciliation, not by listing).
    pub fn list(&self) -> Result<Vec<SlotsSummary>, CoreError> {
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(CoreError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(doc) = serde_json::from_str::<ProjectSlots>(&raw) else {
                continue;
            };
            out.push(SlotsSummary {
                project: doc.project.clone(),
                environment: doc.environment,
                active_slot: doc.active_slot,
                blue_state: doc.blue.state,
                green_state: doc.green.state,
                blue_version: doc.blue.version.clone(),
                green_version: doc.green.version.clone(),
                last_updated: doc.last_updated,
            });
        }
        out.sort_by(|a, b| {
            a.project
                .cmp(&b.project)
                .then(a.environment.as_str().cmp(b.environment.as_str()))
        });
        Ok(out)
    }
}

/// Write `bytes` to `path` via `path.tmp` + rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
