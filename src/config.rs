use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::error::CoreError;
use crate::fleet::{self, Fleet};
use crate::registry::{Environment, SlotName};

/* ============================= DEFAULTS ============================= */

const DEFAULT_PROXY_SITES_DIR: &str = "/etc/caddy/sites";
const DEFAULT_BASE_DOMAIN: &str = "codeb.dev";
const DEFAULT_REGISTRY_ORG: &str = "codeb-dev";
const DEFAULT_GRACE_HOURS: u32 = 48;
const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 240;
const DEFAULT_PROMOTE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ROLLBACK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 5;
const DEFAULT_HEALTH_SETTLE_SECS: u64 = 3;
const DEFAULT_HEALTH_DEADLINE_SECS: u64 = 60;
const DEFAULT_MAX_REMOTE_CONCURRENCY: usize = 8;
const DEFAULT_SSH_USER: &str = "deploy";

/* ============================= CORE CONFIG ============================= */

/// Explicit configuration handed to the control plane once at construction.
///
/// There are no ambient globals: every path, domain, and timeout flows from
/// here. `CODEB_BASE_DIR` is required; everything else has a default and an
/// environment override.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub base_dir: PathBuf,
    pub proxy_sites_dir: PathBuf,
    pub base_domain: String,
    pub registry_org: String,
    pub grace_hours: u32,
    pub deploy_timeout: Duration,
    pub promote_timeout: Duration,
    pub rollback_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub lock_timeout: Duration,
    pub health_interval: Duration,
    pub health_settle: Duration,
    pub health_deadline: Duration,
    pub max_remote_concurrency: usize,
    /// Server name whose commands run locally instead of over SSH.
    pub local_server: String,
    pub ssh_user: String,
    /// Relaxed token verification for local development. Never in production.
    pub dev_mode: bool,
    pub fleet: Fleet,
}

impl CoreConfig {
    /// Build from `CODEB_*` environment variables.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_dir = get("CODEB_BASE_DIR")
            .map(PathBuf::from)
            .ok_or_else(|| CoreError::Validation("CODEB_BASE_DIR is not set".to_string()))?;

        let mut fleet = Fleet::default_fleet();
        for (var, name) in [
            ("CODEB_APP_HOST", fleet::APP),
            ("CODEB_STREAMING_HOST", fleet::STREAMING),
            ("CODEB_STORAGE_HOST", fleet::STORAGE),
            ("CODEB_BACKUP_HOST", fleet::BACKUP),
        ] {
            if let Some(ip) = get(var) {
                fleet.set_ip(name, &ip);
            }
        }

        let config = Self {
            base_dir,
            proxy_sites_dir: get("CODEB_PROXY_SITES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROXY_SITES_DIR)),
            base_domain: get("CODEB_BASE_DOMAIN").unwrap_or_else(|| DEFAULT_BASE_DOMAIN.into()),
            registry_org: get("CODEB_REGISTRY_ORG").unwrap_or_else(|| DEFAULT_REGISTRY_ORG.into()),
            grace_hours: parse_num(&get, "CODEB_GRACE_HOURS", DEFAULT_GRACE_HOURS)?,
            deploy_timeout: parse_secs(&get, "CODEB_DEPLOY_TIMEOUT_SECS", DEFAULT_DEPLOY_TIMEOUT_SECS)?,
            promote_timeout: parse_secs(&get, "CODEB_PROMOTE_TIMEOUT_SECS", DEFAULT_PROMOTE_TIMEOUT_SECS)?,
            rollback_timeout: parse_secs(&get, "CODEB_ROLLBACK_TIMEOUT_SECS", DEFAULT_ROLLBACK_TIMEOUT_SECS)?,
            cleanup_timeout: parse_secs(&get, "CODEB_CLEANUP_TIMEOUT_SECS", DEFAULT_CLEANUP_TIMEOUT_SECS)?,
            lock_timeout: parse_secs(&get, "CODEB_LOCK_TIMEOUT_SECS", DEFAULT_LOCK_TIMEOUT_SECS)?,
            health_interval: parse_secs(&get, "CODEB_HEALTH_INTERVAL_SECS", DEFAULT_HEALTH_INTERVAL_SECS)?,
            health_settle: parse_secs(&get, "CODEB_HEALTH_SETTLE_SECS", DEFAULT_HEALTH_SETTLE_SECS)?,
            health_deadline: parse_secs(&get, "CODEB_HEALTH_DEADLINE_SECS", DEFAULT_HEALTH_DEADLINE_SECS)?,
            max_remote_concurrency: parse_num(
                &get,
                "CODEB_MAX_REMOTE_CONCURRENCY",
                DEFAULT_MAX_REMOTE_CONCURRENCY,
            )?,
            local_server: get("CODEB_LOCAL_SERVER").unwrap_or_else(|| fleet::APP.into()),
            ssh_user: get("CODEB_SSH_USER").unwrap_or_else(|| DEFAULT_SSH_USER.into()),
            dev_mode: matches!(get("CODEB_DEV_MODE").as_deref(), Some("1") | Some("true")),
            fleet,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(CoreError::Validation("base directory is empty".into()));
        }
        if !(1..=168).contains(&self.grace_hours) {
            return Err(CoreError::Validation(format!(
                "grace period must be 1-168 hours, got {}",
                self.grace_hours
            )));
        }
        if self.max_remote_concurrency == 0 {
            return Err(CoreError::Validation(
                "max remote concurrency must be at least 1".into(),
            ));
        }
        if self.fleet.get(&self.local_server).is_none() {
            return Err(CoreError::Validation(format!(
                "local server '{}' is not in the fleet",
                self.local_server
            )));
        }
        if self.dev_mode {
            warn!("dev_mode_enabled_token_verification_relaxed");
        }
        Ok(())
    }

    /* ---------- path derivation (single-sourced) ---------- */

    pub fn slots_dir(&self) -> PathBuf {
        self.base_dir.join("registry").join("slots")
    }

    pub fn ssot_path(&self) -> PathBuf {
        self.base_dir.join("registry").join("ssot.json")
    }

    pub fn teams_path(&self) -> PathBuf {
        self.base_dir.join("config").join("teams.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn unit_dir(&self, project: &str) -> PathBuf {
        self.base_dir
            .join("projects")
            .join(project)
            .join(".config")
            .join("containers")
            .join("systemd")
    }

    pub fn unit_path(&self, project: &str, environment: Environment, slot: SlotName) -> PathBuf {
        self.unit_dir(project)
            .join(format!("{project}-{environment}-{slot}.container"))
    }

    pub fn env_file_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.base_dir
            .join("projects")
            .join(project)
            .join(format!(".env.{environment}"))
    }

    pub fn site_path(&self, project: &str, environment: Environment) -> PathBuf {
        self.proxy_sites_dir
            .join(format!("{project}-{environment}.site"))
    }

    /// Test-friendly constructor rooted at a scratch directory.
    pub fn rooted_at(base_dir: &Path, proxy_sites_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            proxy_sites_dir: proxy_sites_dir.to_path_buf(),
            base_domain: DEFAULT_BASE_DOMAIN.to_string(),
            registry_org: DEFAULT_REGISTRY_ORG.to_string(),
            grace_hours: DEFAULT_GRACE_HOURS,
            deploy_timeout: Duration::from_secs(DEFAULT_DEPLOY_TIMEOUT_SECS),
            promote_timeout: Duration::from_secs(DEFAULT_PROMOTE_TIMEOUT_SECS),
            rollback_timeout: Duration::from_secs(DEFAULT_ROLLBACK_TIMEOUT_SECS),
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            health_interval: Duration::from_millis(10),
            health_settle: Duration::from_millis(0),
            health_deadline: Duration::from_secs(2),
            max_remote_concurrency: DEFAULT_MAX_REMOTE_CONCURRENCY,
            local_server: fleet::APP.to_string(),
            ssh_user: DEFAULT_SSH_USER.to_string(),
            dev_mode: false,
            fleet: Fleet::default_fleet(),
        }
    }
}

fn parse_num<F, T>(get: &F, key: &str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} is not a valid number: {raw}"))),
    }
}

fn parse_secs<F>(get: &F, key: &str, default: u64) -> Result<Duration, CoreError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parse_num(get, key, default)?))
}
