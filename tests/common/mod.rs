#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use codeb_control::deploy::DeployRequest;
use codeb_control::error::CoreError;
use codeb_control::executor::{ExecOutput, Executor, RemoteCommand};
use codeb_control::registry::Environment;
use codeb_control::teams::{AuthContext, Role};
use codeb_control::{Core, CoreConfig};

/* ============================= SCRIPTED EXECUTOR ============================= */

/// Test double for the remote executor: file operations hit the local
/// scratch directory, process commands are answered from a small script
/// (and recorded), and `rm -f` really deletes so cleanup is observable.
pub struct ScriptedExecutor {
    pub commands: StdMutex<Vec<String>>,
    /// Responses for upcoming health probes; drained front-first.
    pub health_queue: StdMutex<VecDeque<String>>,
    /// Fallback health response once the queue is empty.
    pub default_health: StdMutex<String>,
    /// `ss -ltnH` output returned for live-port snapshots.
    pub listening: StdMutex<String>,
    pub fail_start: AtomicBool,
    pub fail_is_active: AtomicBool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            commands: StdMutex::new(Vec::new()),
            health_queue: StdMutex::new(VecDeque::new()),
            default_health: StdMutex::new("200".to_string()),
            listening: StdMutex::new(String::new()),
            fail_start: AtomicBool::new(false),
            fail_is_active: AtomicBool::new(false),
        }
    }

    pub fn set_default_health(&self, code: &str) {
        *self.default_health.lock().unwrap() = code.to_string();
    }

    pub fn push_health(&self, code: &str) {
        self.health_queue.lock().unwrap().push_back(code.to_string());
    }

    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn next_health(&self) -> String {
        self.health_queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_health.lock().unwrap().clone())
    }

    fn respond(&self, rendered: &str) -> ExecOutput {
        if rendered.starts_with("curl ") {
            let code = self.next_health();
            if code == "000" {
                return ExecOutput {
                    exit: 7,
                    stdout: "000".to_string(),
                    stderr: "connection refused".to_string(),
                };
            }
            return ExecOutput {
                exit: 0,
                stdout: code,
                stderr: String::new(),
            };
        }
        if rendered.starts_with("ss ") {
            return ExecOutput {
                exit: 0,
                stdout: self.listening.lock().unwrap().clone(),
                stderr: String::new(),
            };
        }
        if rendered.contains("systemctl --user start") && self.fail_start.load(Ordering::Relaxed) {
            return ExecOutput {
                exit: 1,
                stdout: String::new(),
                stderr: "Job failed. See journalctl for details.".to_string(),
            };
        }
        if rendered.contains("is-active") && self.fail_is_active.load(Ordering::Relaxed) {
            return ExecOutput {
                exit: 3,
                stdout: String::new(),
                stderr: String::new(),
            };
        }
        if let Some(rest) = rendered.strip_prefix("rm -f ") {
            let _ = std::fs::remove_file(rest.trim());
        }
        ExecOutput {
            exit: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        server: &str,
        cmd: RemoteCommand,
        _timeout: Duration,
    ) -> Result<ExecOutput, CoreError> {
        let rendered = cmd.rendered();
        self.commands
            .lock()
            .unwrap()
            .push(format!("{server}: {rendered}"));
        Ok(self.respond(&rendered))
    }

    async fn read_file(&self, _server: &str, path: &Path) -> Result<Vec<u8>, CoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    async fn write_file(&self, _server: &str, path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    async fn mkdir_p(&self, _server: &str, path: &Path) -> Result<(), CoreError> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }
}

/* ============================= HARNESS ============================= */

pub struct Harness {
    pub tmp: TempDir,
    pub core: Core,
    pub exec: Arc<ScriptedExecutor>,
}

impl Harness {
    pub fn base(&self) -> std::path::PathBuf {
        self.tmp.path().join("base")
    }

    pub fn sites(&self) -> std::path::PathBuf {
        self.tmp.path().join("sites")
    }

    pub fn registry_json(&self, project: &str, environment: &str) -> serde_json::Value {
        let path = self
            .base()
            .join("registry/slots")
            .join(format!("{project}-{environment}.json"));
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    pub fn site_text(&self, project: &str, environment: &str) -> String {
        std::fs::read_to_string(self.sites().join(format!("{project}-{environment}.site"))).unwrap()
    }

    pub fn unit_path(&self, project: &str, environment: &str, slot: &str) -> std::path::PathBuf {
        self.base()
            .join("projects")
            .join(project)
            .join(".config/containers/systemd")
            .join(format!("{project}-{environment}-{slot}.container"))
    }

    /// Team `acme` owning `web`, with a member token scoped to `web`.
    pub async fn seed_team(&self) -> Seeded {
        let (_, owner_secret) = self
            .core
            .teams
            .create_team(None, "acme", "Acme", "pro")
            .await
            .unwrap();
        let owner = self.core.teams.authenticate(&owner_secret).await.unwrap();
        self.core
            .teams
            .assign_project(&owner, "acme", "web")
            .await
            .unwrap();
        let (_, dev_secret) = self
            .core
            .teams
            .create_token(
                &owner,
                "acme",
                Role::Member,
                "dev",
                ["web".to_string()].into(),
                None,
            )
            .await
            .unwrap();
        let dev = self.core.teams.authenticate(&dev_secret).await.unwrap();
        Seeded {
            owner,
            owner_secret,
            dev,
            dev_secret,
        }
    }
}

pub struct Seeded {
    pub owner: AuthContext,
    pub owner_secret: String,
    pub dev: AuthContext,
    pub dev_secret: String,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Build a scratch control plane, letting the caller tweak the config
/// before construction.
pub fn harness_with(tweak: impl FnOnce(&mut CoreConfig)) -> Harness {
    let tmp = TempDir::new().unwrap();
    let mut config = CoreConfig::rooted_at(&tmp.path().join("base"), &tmp.path().join("sites"));
    tweak(&mut config);
    let exec = Arc::new(ScriptedExecutor::new());
    let core = Core::new(config, exec.clone()).unwrap();
    Harness { tmp, core, exec }
}

pub fn deploy_req(project: &str, environment: Environment, version: &str) -> DeployRequest {
    DeployRequest {
        project: project.to_string(),
        environment,
        version: Some(version.to_string()),
        image: None,
        skip_healthcheck: false,
    }
}
