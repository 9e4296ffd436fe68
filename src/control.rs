use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::cleanup::{self, CleanupOutcome};
use crate::config::CoreConfig;
use crate::deploy::{self, DeployOutcome, DeployRequest};
use crate::error::CoreError;
use crate::executor::{Executor, RemoteCommand};
use crate::fleet;
use crate::ports::{PortLedger, parse_listening_ports};
use crate::promote::{self, PromoteOutcome};
use crate::registry::{
    Environment, ProjectSlots, SlotStore, SlotsSummary, validate_project_name,
};
use crate::rollback::{self, RollbackOutcome};
use crate::teams::{AuthContext, Capability, TeamStore};

/* ============================= CORE ============================= */

/// The control plane: engines, registries, and the per-key serialization
/// that makes every state transition atomic from the lock's point of view.
///
/// Mutating operations authorize first, then acquire the
/// per-(project, environment) lock with a bounded wait, then run the
/// engine under an overall deadline. Reads never take the lock and may
/// observe an in-flight operation's pre-state.
pub struct Core {
    pub config: CoreConfig,
    pub executor: Arc<dyn Executor>,
    pub slots: SlotStore,
    pub ports: PortLedger,
    pub teams: TeamStore,
    pub audit: AuditLog,
    locks: StdMutex<HashMap<(String, Environment), Arc<Mutex<()>>>>,
}

impl Core {
    pub fn new(config: CoreConfig, executor: Arc<dyn Executor>) -> Result<Self, CoreError> {
        config.validate()?;
        let slots = SlotStore::new(config.slots_dir());
        let ports = PortLedger::new(config.ssot_path());
        let teams = TeamStore::open(config.teams_path(), config.dev_mode)?;
        let audit = AuditLog::new(config.logs_dir());
        Ok(Self {
            config,
            executor,
            slots,
            ports,
            teams,
            audit,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    /* ---------- locking ---------- */

    fn lock_for(&self, project: &str, environment: Environment) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry((project.to_string(), environment))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire(
        &self,
        project: &str,
        environment: Environment,
    ) -> Result<OwnedMutexGuard<()>, CoreError> {
        let lock = self.lock_for(project, environment);
        tokio::time::timeout(self.config.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| CoreError::Busy {
                project: project.to_string(),
                environment: environment.to_string(),
            })
    }

    /* ---------- authorization (always before the lock) ---------- */

    async fn authorize(
        &self,
        auth: &AuthContext,
        capability: Capability,
        project: &str,
        environment: Environment,
    ) -> Result<(), CoreError> {
        let result = match auth.require(capability) {
            Ok(()) => self.teams.authorize_project(auth, project).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if matches!(e, CoreError::Forbidden(_) | CoreError::RoleEscalation(_)) {
                let event = AuditEvent::new(AuditKind::AuthzDenied, project, environment, auth)
                    .failed(e);
                if let Err(e) = self.audit.append(&event) {
                    warn!(error = %e, "audit_append_failed");
                }
            }
        }
        result
    }

    async fn deadline<T>(
        &self,
        operation: &str,
        limit: Duration,
        fut: impl Future<Output = T>,
    ) -> Result<T, CoreError> {
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| CoreError::DeadlineExceeded {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            })
    }

    /* ---------- engine operations ---------- */

    /// Deploy to the inactive slot. Pre-engine failures (authorization,
    /// lock wait, validation, deadline) come back as `Err`; once the
    /// engine runs, the outcome carries its own success flag, step trace
    /// and error so the caller always sees where it stopped.
    pub async fn deploy(
        &self,
        auth: &AuthContext,
        req: &DeployRequest,
    ) -> Result<DeployOutcome, CoreError> {
        validate_project_name(&req.project)?;
        self.authorize(auth, Capability::Operate, &req.project, req.environment)
            .await?;
        let _guard = self.acquire(&req.project, req.environment).await?;
        self.deadline("deploy", self.config.deploy_timeout, deploy::run(self, auth, req))
            .await
    }

    pub async fn promote(
        &self,
        auth: &AuthContext,
        project: &str,
        environment: Environment,
    ) -> Result<PromoteOutcome, CoreError> {
        validate_project_name(project)?;
        self.authorize(auth, Capability::Operate, project, environment)
            .await?;
        let _guard = self.acquire(project, environment).await?;
        self.deadline(
            "promote",
            self.config.promote_timeout,
            promote::run(self, auth, project, environment),
        )
        .await?
    }

    pub async fn rollback(
        &self,
        auth: &AuthContext,
        project: &str,
        environment: Environment,
        reason: Option<String>,
    ) -> Result<RollbackOutcome, CoreError> {
        validate_project_name(project)?;
        self.authorize(auth, Capability::Operate, project, environment)
            .await?;
        let _guard = self.acquire(project, environment).await?;
        self.deadline(
            "rollback",
            self.config.rollback_timeout,
            rollback::run(self, auth, project, environment, reason),
        )
        .await?
    }

    pub async fn cleanup(
        &self,
        auth: &AuthContext,
        project: &str,
        environment: Environment,
        force: bool,
    ) -> Result<CleanupOutcome, CoreError> {
        self.cleanup_at(auth, project, environment, force, Utc::now())
            .await
    }

    /// Cleanup against an explicit wall-clock reading; expiry decisions
    /// use `now` so the whole sweep sees one consistent time.
    pub async fn cleanup_at(
        &self,
        auth: &AuthContext,
        project: &str,
        environment: Environment,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<CleanupOutcome, CoreError> {
        validate_project_name(project)?;
        self.authorize(auth, Capability::Operate, project, environment)
            .await?;
        let _guard = self.acquire(project, environment).await?;
        self.deadline(
            "cleanup",
            self.config.cleanup_timeout,
            cleanup::run(self, auth, project, environment, force, now),
        )
        .await?
    }

    /// The periodic scan: non-forced cleanup of every registry. Runs as
    /// the system identity; per-key failures are collected, not fatal.
    pub async fn cleanup_sweep(&self) -> Vec<(String, Environment, Result<CleanupOutcome, CoreError>)> {
        let auth = AuthContext::system();
        let summaries = match self.slots.list() {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cleanup_sweep_list_failed");
                return Vec::new();
            }
        };
        let mut results = Vec::new();
        for summary in summaries {
            let result = self
                .cleanup(&auth, &summary.project, summary.environment, false)
                .await;
            results.push((summary.project, summary.environment, result));
        }
        results
    }

    /* ---------- reads (lock-free) ---------- */

    pub async fn status(
        &self,
        auth: &AuthContext,
        project: &str,
        environment: Environment,
    ) -> Result<ProjectSlots, CoreError> {
        auth.require(Capability::ReadStatus)?;
        self.teams.authorize_project(auth, project).await?;
        self.slots.load(project, environment)
    }

    /// Registry summaries the caller is allowed to see.
    pub async fn list(&self, auth: &AuthContext) -> Result<Vec<SlotsSummary>, CoreError> {
        auth.require(Capability::ReadStatus)?;
        let mut visible = Vec::new();
        for summary in self.slots.list()? {
            if self
                .teams
                .authorize_project(auth, &summary.project)
                .await
                .is_ok()
            {
                visible.push(summary);
            }
        }
        Ok(visible)
    }

    /// Audit history for one (operation, project, environment); readable
    /// by every role, scoped like status.
    pub async fn audit_events(
        &self,
        auth: &AuthContext,
        kind: AuditKind,
        project: &str,
        environment: Environment,
    ) -> Result<Vec<AuditEvent>, CoreError> {
        auth.require(Capability::ReadAudit)?;
        self.teams.authorize_project(auth, project).await?;
        self.audit.read(kind, project, environment)
    }

    /* ---------- host probes ---------- */

    /// Single health probe of a slot port on the application host.
    /// A refused connection is "unhealthy", not an error.
    pub(crate) async fn probe_health(&self, port: u16) -> Result<bool, CoreError> {
        let url = format!("http://127.0.0.1:{port}/health");
        let cmd = RemoteCommand::new("curl")
            .args(["-s", "-o", "/dev/null", "-w", "%{http_code}", "--max-time", "5"])
            .arg(url);
        let out = self
            .executor
            .run(fleet::APP, cmd, Duration::from_secs(10))
            .await?;
        if !out.ok() {
            return Ok(false);
        }
        let code: u16 = out.stdout.trim().parse().unwrap_or(0);
        Ok((200..300).contains(&code))
    }

    /// Live listening-port snapshot on the application host. A failed
    /// enumeration degrades to "no extra ports in use"; the ledger and the
    /// deploy-time collision checks still apply.
    pub(crate) async fn live_ports(&self) -> BTreeSet<u16> {
        let cmd = RemoteCommand::new("ss").arg("-ltnH");
        match self
            .executor
            .run(fleet::APP, cmd, Duration::from_secs(10))
            .await
        {
            Ok(out) if out.ok() => parse_listening_ports(&out.stdout),
            Ok(_) | Err(_) => BTreeSet::new(),
        }
    }
}
