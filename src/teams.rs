use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::CoreError;
use crate::registry::{Environment, is_valid_slug, validate_project_name, write_atomic};

const SECRET_PREFIX: &str = "codeb";
const SECRET_BYTES: usize = 32;

/* ============================= ROLES ============================= */

/// Permission tier. Declaration order is the strict hierarchy used for
/// the no-escalation check: viewer < member < admin < owner.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(CoreError::Validation(format!(
                "unknown role '{other}' (viewer|member|admin|owner)"
            ))),
        }
    }
}

/// What a caller is trying to do; resolved against the role matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    ReadStatus,
    ReadAudit,
    Operate,
    ManageTokens,
    ManageTeam,
}

pub fn role_allows(role: Role, capability: Capability) -> bool {
    match capability {
        Capability::ReadStatus | Capability::ReadAudit => true,
        Capability::Operate => role >= Role::Member,
        Capability::ManageTokens => role >= Role::Admin,
        Capability::ManageTeam => role == Role::Owner,
    }
}

/* ============================= DOCUMENTS ============================= */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamSettings {
    pub default_environment: Environment,
    pub auto_promote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_hours: Option<u32>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_webhook: Option<String>,
}

impl Default for TeamSettings {
    fn default() -> Self {
        Self {
            default_environment: Environment::Staging,
            auto_promote: false,
            grace_period_hours: None,
            allowed_domains: Vec::new(),
            notification_webhook: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub team_id: String,
    pub display_name: String,
    pub owner_token_id: String,
    pub plan: String,
    pub created_at: DateTime<Utc>,
    pub settings: TeamSettings,
    pub projects: BTreeSet<String>,
}

/// An API token. The token *is* the member identity; only the SHA-256 of
/// the presented secret is ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub display_name: String,
    pub team_id: String,
    pub role: Role,
    /// Project scope; empty means every team project.
    #[serde(default)]
    pub projects: BTreeSet<String>,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub revoked: bool,
}

/// Listing view; never exposes the stored hash.
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub token_id: String,
    pub display_name: String,
    pub role: Role,
    pub projects: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl From<&Token> for TokenSummary {
    fn from(t: &Token) -> Self {
        Self {
            token_id: t.token_id.clone(),
            display_name: t.display_name.clone(),
            role: t.role,
            projects: t.projects.clone(),
            created_at: t.created_at,
            created_by: t.created_by.clone(),
            last_used_at: t.last_used_at,
            expires_at: t.expires_at,
            revoked: t.revoked,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TeamsFile {
    teams: BTreeMap<String, Team>,
    tokens: BTreeMap<String, Token>,
}

/* ============================= AUTH CONTEXT ============================= */

/// Resolved identity of a request after authentication.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_id: String,
    pub team_id: String,
    pub role: Role,
    /// Effective project scope; `None` means all team projects.
    pub projects: Option<BTreeSet<String>>,
    /// Internal-scheduler identity; bypasses team membership checks.
    pub system: bool,
}

impl AuthContext {
    /// Identity used by internal schedulers (cleanup scan, reconciler, CLI).
    pub fn system() -> Self {
        Self {
            token_id: "system".to_string(),
            team_id: "system".to_string(),
            role: Role::Owner,
            projects: None,
            system: true,
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.system || role_allows(self.role, capability)
    }

    pub fn require(&self, capability: Capability) -> Result<(), CoreError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "role {} may not {:?}",
                self.role, capability
            )))
        }
    }
}

/* ============================= SETTINGS PATCH ============================= */

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SettingsPatch {
    pub default_environment: Option<Environment>,
    pub auto_promote: Option<bool>,
    pub grace_period_hours: Option<u32>,
    pub allowed_domains: Option<Vec<String>>,
    pub notification_webhook: Option<String>,
}

/* ============================= SECRETS ============================= */

fn sha256_hex(s: &str) -> String {
    let digest = Sha256::digest(s.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Byte-wise constant-time equality; both sides are fixed-length digests.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn generate_secret(role: Role) -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}_{role}_{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn generate_token_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("tok-{hex}")
}

/// Split a presented secret into its role hint. The role encoded in the
/// prefix is cosmetic; authority always comes from the stored record, but
/// a mismatch is rejected outright.
pub fn parse_secret_role(secret: &str) -> Result<Role, CoreError> {
    let mut parts = secret.splitn(3, '_');
    let (prefix, role, body) = (parts.next(), parts.next(), parts.next());
    match (prefix, role, body) {
        (Some(SECRET_PREFIX), Some(role), Some(body)) if !body.is_empty() => role.parse().map_err(
            |_| CoreError::Unauthenticated("malformed token secret".to_string()),
        ),
        _ => Err(CoreError::Unauthenticated(
            "malformed token secret".to_string(),
        )),
    }
}

/* ============================= TEAM STORE ============================= */

/// Durable registry of teams and tokens; the only component that mutates
/// it. All member/token changes are serialized behind one mutex.
pub struct TeamStore {
    path: PathBuf,
    state: Mutex<TeamsFile>,
    dev_mode: bool,
}

impl TeamStore {
    pub fn open(path: PathBuf, dev_mode: bool) -> Result<Self, CoreError> {
        let file = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TeamsFile::default(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        Ok(Self {
            path,
            state: Mutex::new(file),
            dev_mode,
        })
    }

    fn persist(&self, file: &TeamsFile) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(file)?)
    }

    /* ---------- authentication ---------- */

    /// Resolve a presented secret to an `AuthContext`.
    ///
    /// Lookup is by hash; comparison is constant-time. In dev mode an
    /// unmatched secret falls back to a bare token_id lookup (revocation
    /// and expiry still apply).
    pub async fn authenticate(&self, secret: &str) -> Result<AuthContext, CoreError> {
        let mut file = self.state.lock().await;

        let matched_id = match parse_secret_role(secret) {
            Ok(presented_role) => {
                let hash = sha256_hex(secret);
                file.tokens
                    .values()
                    .find(|t| constant_time_eq(&t.secret_hash, &hash))
                    .filter(|t| t.role == presented_role)
                    .map(|t| t.token_id.clone())
            }
            Err(e) => {
                if !self.dev_mode {
                    return Err(e);
                }
                None
            }
        };

        let matched_id = match matched_id {
            Some(id) => id,
            None if self.dev_mode && file.tokens.contains_key(secret) => secret.to_string(),
            None => {
                return Err(CoreError::Unauthenticated(
                    "unknown or invalid token".to_string(),
                ));
            }
        };

        let token = file
            .tokens
            .get_mut(&matched_id)
            .ok_or_else(|| CoreError::Unauthenticated("unknown or invalid token".to_string()))?;

        if token.revoked {
            return Err(CoreError::Unauthenticated("token is revoked".to_string()));
        }
        if let Some(expires) = token.expires_at {
            if expires <= Utc::now() {
                return Err(CoreError::Unauthenticated("token is expired".to_string()));
            }
        }

        token.last_used_at = Some(Utc::now());
        let auth = AuthContext {
            token_id: token.token_id.clone(),
            team_id: token.team_id.clone(),
            role: token.role,
            projects: if token.role == Role::Owner || token.projects.is_empty() {
                None
            } else {
                Some(token.projects.clone())
            },
            system: false,
        };

        // last-used is eventually consistent; a failed persist only loses
        // the timestamp update.
        if let Err(e) = self.persist(&file) {
            warn!(error = %e, "teams_last_used_persist_failed");
        }
        Ok(auth)
    }

    /// Project-level authorization: the project must belong to the caller's
    /// team and, below owner, sit inside the token's scope.
    pub async fn authorize_project(
        &self,
        auth: &AuthContext,
        project: &str,
    ) -> Result<(), CoreError> {
        if auth.system {
            return Ok(());
        }
        let file = self.state.lock().await;
        let team = file
            .teams
            .get(&auth.team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {}", auth.team_id)))?;
        if !team.projects.contains(project) {
            return Err(CoreError::Forbidden(format!(
                "project {project} is not owned by team {}",
                auth.team_id
            )));
        }
        if let Some(scope) = &auth.projects {
            if !scope.contains(project) {
                return Err(CoreError::Forbidden(format!(
                    "token is not scoped to project {project}"
                )));
            }
        }
        Ok(())
    }

    /* ---------- teams ---------- */

    /// Create a team with its single owner token. `auth` is `None` only for
    /// the CLI bootstrap path; over the API an owner identity is required.
    /// Returns the raw owner secret, shown exactly once.
    pub async fn create_team(
        &self,
        auth: Option<&AuthContext>,
        team_id: &str,
        display_name: &str,
        plan: &str,
    ) -> Result<(Team, String), CoreError> {
        if let Some(auth) = auth {
            if !auth.system && auth.role != Role::Owner {
                return Err(CoreError::Forbidden(
                    "only an owner token may create teams".to_string(),
                ));
            }
        }
        if !is_valid_slug(team_id, 3, 30) {
            return Err(CoreError::Validation(format!(
                "invalid team id '{team_id}' (lowercase alphanumerics and hyphens, 3-30 chars)"
            )));
        }

        let mut file = self.state.lock().await;
        if file.teams.contains_key(team_id) {
            return Err(CoreError::Validation(format!(
                "team {team_id} already exists"
            )));
        }

        let now = Utc::now();
        let token_id = generate_token_id();
        let secret = generate_secret(Role::Owner);
        let owner = Token {
            token_id: token_id.clone(),
            display_name: format!("{display_name} owner"),
            team_id: team_id.to_string(),
            role: Role::Owner,
            projects: BTreeSet::new(),
            secret_hash: sha256_hex(&secret),
            created_at: now,
            created_by: auth.map_or("bootstrap".to_string(), |a| a.token_id.clone()),
            last_used_at: None,
            expires_at: None,
            revoked: false,
        };
        let team = Team {
            team_id: team_id.to_string(),
            display_name: display_name.to_string(),
            owner_token_id: token_id.clone(),
            plan: plan.to_string(),
            created_at: now,
            settings: TeamSettings::default(),
            projects: BTreeSet::new(),
        };

        file.teams.insert(team_id.to_string(), team.clone());
        file.tokens.insert(token_id, owner);
        self.persist(&file)?;
        Ok((team, secret))
    }

    pub async fn get_team(&self, auth: &AuthContext, team_id: &str) -> Result<Team, CoreError> {
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        let file = self.state.lock().await;
        file.teams
            .get(team_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))
    }

    /// Teams visible to the caller: its own, or all for the system identity.
    pub async fn list_teams(&self, auth: &AuthContext) -> Result<Vec<Team>, CoreError> {
        let file = self.state.lock().await;
        Ok(file
            .teams
            .values()
            .filter(|t| auth.system || t.team_id == auth.team_id)
            .cloned()
            .collect())
    }

    /// Delete an empty team (no projects) together with its tokens.
    pub async fn delete_team(&self, auth: &AuthContext, team_id: &str) -> Result<(), CoreError> {
        auth.require(Capability::ManageTeam)?;
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        let mut file = self.state.lock().await;
        let team = file
            .teams
            .get(team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
        if !team.projects.is_empty() {
            return Err(CoreError::Validation(format!(
                "team {team_id} still owns {} project(s)",
                team.projects.len()
            )));
        }
        file.teams.remove(team_id);
        file.tokens.retain(|_, t| t.team_id != team_id);
        self.persist(&file)
    }

    pub async fn update_settings(
        &self,
        auth: &AuthContext,
        team_id: &str,
        patch: SettingsPatch,
    ) -> Result<TeamSettings, CoreError> {
        auth.require(Capability::ManageTeam)?;
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        if let Some(hours) = patch.grace_period_hours {
            if !(1..=168).contains(&hours) {
                return Err(CoreError::Validation(format!(
                    "grace period must be 1-168 hours, got {hours}"
                )));
            }
        }
        let mut file = self.state.lock().await;
        let team = file
            .teams
            .get_mut(team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
        if let Some(env) = patch.default_environment {
            team.settings.default_environment = env;
        }
        if let Some(auto) = patch.auto_promote {
            team.settings.auto_promote = auto;
        }
        if let Some(hours) = patch.grace_period_hours {
            team.settings.grace_period_hours = Some(hours);
        }
        if let Some(domains) = patch.allowed_domains {
            team.settings.allowed_domains = domains;
        }
        if let Some(webhook) = patch.notification_webhook {
            team.settings.notification_webhook = Some(webhook);
        }
        let settings = team.settings.clone();
        self.persist(&file)?;
        Ok(settings)
    }

    /* ---------- projects ---------- */

    /// Attach a project to a team. Project names are unique across the
    /// whole deployment.
    pub async fn assign_project(
        &self,
        auth: &AuthContext,
        team_id: &str,
        project: &str,
    ) -> Result<(), CoreError> {
        auth.require(Capability::ManageTeam)?;
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        validate_project_name(project)?;
        let mut file = self.state.lock().await;
        for team in file.teams.values() {
            if team.team_id != team_id && team.projects.contains(project) {
                return Err(CoreError::Validation(format!(
                    "project {project} already belongs to team {}",
                    team.team_id
                )));
            }
        }
        let team = file
            .teams
            .get_mut(team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
        team.projects.insert(project.to_string());
        self.persist(&file)
    }

    pub async fn remove_project(
        &self,
        auth: &AuthContext,
        team_id: &str,
        project: &str,
    ) -> Result<(), CoreError> {
        auth.require(Capability::ManageTeam)?;
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        let mut file = self.state.lock().await;
        let team = file
            .teams
            .get_mut(team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
        team.projects.remove(project);
        self.persist(&file)
    }

    /// Owning team for a project, if any.
    pub async fn owning_team(&self, project: &str) -> Option<Team> {
        let file = self.state.lock().await;
        file.teams
            .values()
            .find(|t| t.projects.contains(project))
            .cloned()
    }

    /* ---------- tokens ---------- */

    /// Issue a token. The escalation check runs before the capability
    /// check so an under-privileged caller asking for a higher role is
    /// reported as escalation, not a generic denial.
    pub async fn create_token(
        &self,
        auth: &AuthContext,
        team_id: &str,
        role: Role,
        display_name: &str,
        projects: BTreeSet<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(TokenSummary, String), CoreError> {
        if !auth.system && role > auth.role {
            return Err(CoreError::RoleEscalation(format!(
                "a {} token cannot issue a {} token",
                auth.role, role
            )));
        }
        auth.require(Capability::ManageTokens)?;
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }

        let mut file = self.state.lock().await;
        let team = file
            .teams
            .get(team_id)
            .ok_or_else(|| CoreError::NotFound(format!("team {team_id}")))?;
        if role == Role::Owner {
            return Err(CoreError::Validation(format!(
                "team {team_id} already has an owner token"
            )));
        }
        for project in &projects {
            if !team.projects.contains(project) {
                return Err(CoreError::Validation(format!(
                    "project {project} is not owned by team {team_id}"
                )));
            }
        }

        let token_id = generate_token_id();
        let secret = generate_secret(role);
        let token = Token {
            token_id: token_id.clone(),
            display_name: display_name.to_string(),
            team_id: team_id.to_string(),
            role,
            projects,
            secret_hash: sha256_hex(&secret),
            created_at: Utc::now(),
            created_by: auth.token_id.clone(),
            last_used_at: None,
            expires_at,
            revoked: false,
        };
        let summary = TokenSummary::from(&token);
        file.tokens.insert(token_id, token);
        self.persist(&file)?;
        Ok((summary, secret))
    }

    /// Revoke a token: issuers may revoke what they created; admin and
    /// owner may revoke any team token. The owner token itself cannot be
    /// revoked (the team would be orphaned).
    pub async fn revoke_token(
        &self,
        auth: &AuthContext,
        token_id: &str,
    ) -> Result<(), CoreError> {
        let mut file = self.state.lock().await;
        let token = file
            .tokens
            .get(token_id)
            .ok_or_else(|| CoreError::NotFound(format!("token {token_id}")))?;
        if !auth.system && token.team_id != auth.team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        if token.role == Role::Owner {
            return Err(CoreError::Validation(
                "the owner token cannot be revoked".to_string(),
            ));
        }
        let is_issuer = token.created_by == auth.token_id;
        if !auth.system && !is_issuer && auth.role < Role::Admin {
            return Err(CoreError::Forbidden(
                "only the issuer or an admin may revoke this token".to_string(),
            ));
        }
        if let Some(token) = file.tokens.get_mut(token_id) {
            token.revoked = true;
        }
        self.persist(&file)
    }

    pub async fn list_tokens(
        &self,
        auth: &AuthContext,
        team_id: &str,
    ) -> Result<Vec<TokenSummary>, CoreError> {
        if !auth.system && auth.team_id != team_id {
            return Err(CoreError::Forbidden(
                "token belongs to a different team".to_string(),
            ));
        }
        let file = self.state.lock().await;
        Ok(file
            .tokens
            .values()
            .filter(|t| t.team_id == team_id)
            .map(TokenSummary::from)
            .collect())
    }

    /// Effective grace period override for the team owning `project`.
    pub async fn grace_hours_for_project(&self, project: &str) -> Option<u32> {
        self.owning_team(project)
            .await
            .and_then(|t| t.settings.grace_period_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn store(tmp: &TempDir) -> TeamStore {
        TeamStore::open(tmp.path().join("teams.json"), false).unwrap()
    }

    async fn seeded(tmp: &TempDir) -> (TeamStore, AuthContext, String) {
        let s = store(tmp).await;
        let (_, owner_secret) = s.create_team(None, "acme", "Acme", "pro").await.unwrap();
        let owner = s.authenticate(&owner_secret).await.unwrap();
        s.assign_project(&owner, "acme", "web").await.unwrap();
        (s, owner, owner_secret)
    }

    // ── roles ──

    #[test]
    fn test_role_hierarchy_is_total_order() {
        assert!(Role::Viewer < Role::Member);
        assert!(Role::Member < Role::Admin);
        assert!(Role::Admin < Role::Owner);
    }

    #[test]
    fn test_capability_matrix() {
        assert!(role_allows(Role::Viewer, Capability::ReadStatus));
        assert!(role_allows(Role::Viewer, Capability::ReadAudit));
        assert!(!role_allows(Role::Viewer, Capability::Operate));
        assert!(role_allows(Role::Member, Capability::Operate));
        assert!(!role_allows(Role::Member, Capability::ManageTokens));
        assert!(role_allows(Role::Admin, Capability::ManageTokens));
        assert!(!role_allows(Role::Admin, Capability::ManageTeam));
        assert!(role_allows(Role::Owner, Capability::ManageTeam));
    }

    // ── secrets ──

    #[test]
    fn test_secret_format() {
        let secret = generate_secret(Role::Member);
        assert!(secret.starts_with("codeb_member_"));
        assert_eq!(parse_secret_role(&secret).unwrap(), Role::Member);
    }

    #[test]
    fn test_parse_secret_rejects_malformed() {
        for bad in ["", "codeb", "codeb_member", "other_member_abc", "codeb_root_abc"] {
            assert!(parse_secret_role(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abcd", "abcd"));
        assert!(!constant_time_eq("abcd", "abce"));
        assert!(!constant_time_eq("abcd", "abc"));
    }

    // ── team lifecycle ──

    #[tokio::test]
    async fn test_bootstrap_and_authenticate() {
        let tmp = TempDir::new().unwrap();
        let (_, owner, _) = seeded(&tmp).await;
        assert_eq!(owner.team_id, "acme");
        assert_eq!(owner.role, Role::Owner);
        assert!(owner.projects.is_none());
    }

    #[tokio::test]
    async fn test_get_team_is_team_scoped() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let team = s.get_team(&owner, "acme").await.unwrap();
        assert_eq!(team.display_name, "Acme");
        assert!(team.projects.contains("web"));

        let (_, other_secret) = s.create_team(None, "other", "Other", "free").await.unwrap();
        let other = s.authenticate(&other_secret).await.unwrap();
        let err = s.get_team(&other, "acme").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");

        // Each owner sees only their own team in listings.
        let listed = s.list_teams(&owner).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].team_id, "acme");
    }

    #[tokio::test]
    async fn test_invalid_team_slug_rejected() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        for bad in ["ab", "Acme", "team_x", &"x".repeat(31)] {
            assert!(s.create_team(None, bad, "x", "free").await.is_err());
        }
    }

    #[tokio::test]
    async fn test_duplicate_team_rejected() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).await;
        s.create_team(None, "acme", "Acme", "pro").await.unwrap();
        assert!(s.create_team(None, "acme", "Acme 2", "pro").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_team_requires_empty() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let err = s.delete_team(&owner, "acme").await.unwrap_err();
        assert_eq!(err.code(), "validation");
        s.remove_project(&owner, "acme", "web").await.unwrap();
        s.delete_team(&owner, "acme").await.unwrap();
        assert!(s.owning_team("web").await.is_none());
    }

    #[tokio::test]
    async fn test_project_unique_across_teams() {
        let tmp = TempDir::new().unwrap();
        let (s, _, _) = seeded(&tmp).await;
        let (_, other_secret) = s.create_team(None, "other", "Other", "free").await.unwrap();
        let other_owner = s.authenticate(&other_secret).await.unwrap();
        let err = s
            .assign_project(&other_owner, "other", "web")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    // ── tokens ──

    #[tokio::test]
    async fn test_issue_and_authenticate_member() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let (summary, secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", ["web".to_string()].into(), None)
            .await
            .unwrap();
        assert_eq!(summary.role, Role::Member);
        let auth = s.authenticate(&secret).await.unwrap();
        assert_eq!(auth.role, Role::Member);
        assert_eq!(auth.projects.as_ref().map(|p| p.len()), Some(1));
        s.authorize_project(&auth, "web").await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_outside_team_rejected() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let err = s
            .create_token(&owner, "acme", Role::Member, "dev", ["blog".to_string()].into(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn test_escalation_rejected_before_capability() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let (_, member_secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", BTreeSet::new(), None)
            .await
            .unwrap();
        let member = s.authenticate(&member_secret).await.unwrap();

        // member → owner is escalation, not forbidden
        let err = s
            .create_token(&member, "acme", Role::Owner, "evil", BTreeSet::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "role_escalation");

        // member → member is plain forbidden (no ManageTokens)
        let err = s
            .create_token(&member, "acme", Role::Member, "peer", BTreeSet::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn test_second_owner_token_rejected() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let err = s
            .create_token(&owner, "acme", Role::Owner, "twin", BTreeSet::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn test_revoked_token_never_authenticates() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let (summary, secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", BTreeSet::new(), None)
            .await
            .unwrap();
        s.revoke_token(&owner, &summary.token_id).await.unwrap();
        let err = s.authenticate(&secret).await.unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_expired_token_is_unauthenticated() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let past = Utc::now() - Duration::hours(1);
        let (_, secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", BTreeSet::new(), Some(past))
            .await
            .unwrap();
        let err = s.authenticate(&secret).await.unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_issuer_may_revoke_own_token() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let (_, admin_secret) = s
            .create_token(&owner, "acme", Role::Admin, "ops", BTreeSet::new(), None)
            .await
            .unwrap();
        let admin = s.authenticate(&admin_secret).await.unwrap();
        let (issued, _) = s
            .create_token(&admin, "acme", Role::Member, "dev", BTreeSet::new(), None)
            .await
            .unwrap();
        s.revoke_token(&admin, &issued.token_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_token_cannot_be_revoked() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let err = s.revoke_token(&owner, &owner.token_id).await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn test_wrong_prefix_role_rejected() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let (_, secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", BTreeSet::new(), None)
            .await
            .unwrap();
        let forged = secret.replacen("codeb_member_", "codeb_admin_", 1);
        let err = s.authenticate(&forged).await.unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
    }

    #[tokio::test]
    async fn test_authorize_project_scope() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        s.assign_project(&owner, "acme", "api").await.unwrap();
        let (_, secret) = s
            .create_token(&owner, "acme", Role::Member, "dev", ["web".to_string()].into(), None)
            .await
            .unwrap();
        let auth = s.authenticate(&secret).await.unwrap();
        s.authorize_project(&auth, "web").await.unwrap();
        let err = s.authorize_project(&auth, "api").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
        // Not owned by the team at all.
        let err = s.authorize_project(&auth, "blog").await.unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn test_settings_patch() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let settings = s
            .update_settings(
                &owner,
                "acme",
                SettingsPatch {
                    auto_promote: Some(true),
                    grace_period_hours: Some(24),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(settings.auto_promote);
        assert_eq!(settings.grace_period_hours, Some(24));
        assert_eq!(s.grace_hours_for_project("web").await, Some(24));
    }

    #[tokio::test]
    async fn test_settings_grace_bounds() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        for hours in [0, 169] {
            let err = s
                .update_settings(
                    &owner,
                    "acme",
                    SettingsPatch {
                        grace_period_hours: Some(hours),
                        ..Default::default()
                    },
                )
                .await
                .unwrap_err();
            assert_eq!(err.code(), "validation");
        }
    }

    #[tokio::test]
    async fn test_store_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let secret;
        {
            let (_s, _owner, owner_secret) = seeded(&tmp).await;
            secret = owner_secret;
        }
        let s = TeamStore::open(tmp.path().join("teams.json"), false).unwrap();
        let auth = s.authenticate(&secret).await.unwrap();
        assert_eq!(auth.team_id, "acme");
    }

    #[tokio::test]
    async fn test_dev_mode_token_id_fallback() {
        let tmp = TempDir::new().unwrap();
        let s = TeamStore::open(tmp.path().join("teams.json"), true).unwrap();
        let (_, owner_secret) = s.create_team(None, "acme", "Acme", "pro").await.unwrap();
        let owner = s.authenticate(&owner_secret).await.unwrap();
        // Authenticate by bare token id works only in dev mode.
        let auth = s.authenticate(&owner.token_id).await.unwrap();
        assert_eq!(auth.token_id, owner.token_id);
    }

    #[tokio::test]
    async fn test_list_tokens_hides_hash() {
        let tmp = TempDir::new().unwrap();
        let (s, owner, _) = seeded(&tmp).await;
        let tokens = s.list_tokens(&owner, "acme").await.unwrap();
        assert_eq!(tokens.len(), 1);
        let json = serde_json::to_string(&tokens).unwrap();
        assert!(!json.contains("secret_hash"));
    }
}
