use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind};
use crate::control::Core;
use crate::error::CoreError;
use crate::executor::RemoteCommand;
use crate::fleet;
use crate::registry::{Environment, HealthStatus, ProjectSlots, SlotName, SlotState};
use crate::render::{self, SlotIntent};
use crate::teams::AuthContext;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

/* ============================= REQUEST / OUTCOME ============================= */

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub project: String,
    pub environment: Environment,
    /// Commit-sha-like string; defaults to "latest".
    pub version: Option<String>,
    /// Full image reference; defaults to `ghcr.io/{org}/{project}:{version}`.
    pub image: Option<String>,
    pub skip_healthcheck: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// One entry of the per-deploy trace operators read to see where an
/// operation stopped.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct DeployOutcome {
    pub success: bool,
    pub slot: Option<SlotName>,
    pub port: Option<u16>,
    pub version: String,
    pub image: String,
    pub preview_url: Option<String>,
    pub steps: Vec<StepResult>,
    pub error: Option<CoreError>,
}

/* ============================= STEP TRACE ============================= */

#[derive(Default)]
struct Steps {
    list: Vec<StepResult>,
}

impl Steps {
    async fn run<T, F>(&mut self, name: &str, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        let started = Instant::now();
        match fut.await {
            Ok(value) => {
                self.list.push(StepResult {
                    name: name.to_string(),
                    status: StepStatus::Success,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: None,
                });
                Ok(value)
            }
            Err(e) => {
                self.list.push(StepResult {
                    name: name.to_string(),
                    status: StepStatus::Failed,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn skip(&mut self, name: &str) {
        self.list.push(StepResult {
            name: name.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            error: None,
        });
    }
}

/* ============================= ENGINE ============================= */

/// Prepare the inactive slot: write its unit, start the container, wait
/// for health, record the result. Never touches the proxy and never
/// promotes. Must run under the per-(project, environment) lock.
pub(crate) async fn run(core: &Core, auth: &AuthContext, req: &DeployRequest) -> DeployOutcome {
    let started = Instant::now();
    let version = req.version.clone().unwrap_or_else(|| "latest".to_string());
    let image = req
        .image
        .clone()
        .unwrap_or_else(|| render::image_ref(&core.config.registry_org, &req.project, &version));

    let mut steps = Steps::default();
    let result = attempt(core, auth, req, &version, &image, &mut steps).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok((doc, slot)) => {
            let port = doc.slot(slot).port;
            info!(
                project = %req.project,
                environment = %req.environment,
                slot = %slot,
                port,
                version = %version,
                "deploy_succeeded"
            );
            DeployOutcome {
                success: true,
                slot: Some(slot),
                port: Some(port),
                version: version.clone(),
                image: image.clone(),
                preview_url: Some(render::preview_url(
                    &req.project,
                    slot,
                    &core.config.base_domain,
                )),
                steps: steps.list,
                error: None,
            }
        }
        Err(e) => {
            warn!(
                project = %req.project,
                environment = %req.environment,
                error = %e,
                "deploy_failed"
            );
            DeployOutcome {
                success: false,
                slot: None,
                port: None,
                version: version.clone(),
                image: image.clone(),
                preview_url: None,
                steps: steps.list,
                error: Some(e),
            }
        }
    };

    let mut event = AuditEvent::new(AuditKind::Deploy, &req.project, req.environment, auth)
        .slots(None, outcome.slot)
        .versions(None, Some(version))
        .duration(duration_ms);
    if let Some(e) = &outcome.error {
        event = event.failed(e);
    }
    if let Err(e) = core.audit.append(&event) {
        warn!(error = %e, "audit_append_failed");
    }

    outcome
}

/// The fallible body; on failure after the unit write the slot is stopped
/// and its unit removed so a retry starts clean.
async fn attempt(
    core: &Core,
    auth: &AuthContext,
    req: &DeployRequest,
    version: &str,
    image: &str,
    steps: &mut Steps,
) -> Result<(ProjectSlots, SlotName), CoreError> {
    let project = req.project.as_str();
    let environment = req.environment;

    // Load or create the registry document; a first deploy allocates the
    // port pair (checking live listeners as well as the ledger).
    let mut first_deploy = false;
    let mut doc = steps
        .run("load_registry", async {
            match core.slots.load(project, environment) {
                Ok(doc) => Ok(doc),
                Err(CoreError::NotFound(_)) => {
                    first_deploy = true;
                    let live = core.live_ports().await;
                    let (blue, green) = core.ports.allocate_pair(environment, &live).await?;
                    Ok(ProjectSlots::new(project, environment, blue, green))
                }
                Err(e) => Err(e),
            }
        })
        .await?;

    // Existing documents must still agree with the ledger.
    steps
        .run("verify_ports", async {
            if doc.blue.port % 2 != 0 || doc.green.port != doc.blue.port + 1 {
                return Err(CoreError::PortsMismatch {
                    detail: format!(
                        "pair ({}, {}) is not an even/odd pair",
                        doc.blue.port, doc.green.port
                    ),
                });
            }
            for port in [doc.blue.port, doc.green.port] {
                if !environment.contains_port(port) {
                    return Err(CoreError::PortsMismatch {
                        detail: format!("port {port} outside the {environment} range"),
                    });
                }
            }
            if !core.ports.holds_all(&[doc.blue.port, doc.green.port]).await? {
                return Err(CoreError::PortsMismatch {
                    detail: format!(
                        "pair ({}, {}) is not recorded in the port ledger",
                        doc.blue.port, doc.green.port
                    ),
                });
            }
            Ok(())
        })
        .await?;

    // First deploy lands on the active-elect slot; otherwise on the
    // inactive one.
    let target = if first_deploy || doc.both_empty() {
        doc.active_slot
    } else {
        doc.active_slot.other()
    };
    let target_state = doc.slot(target).state;
    if matches!(target_state, SlotState::Active | SlotState::Grace) {
        let e = CoreError::TargetBusy {
            slot: target.to_string(),
            state: target_state.to_string(),
        };
        steps.list.push(StepResult {
            name: "select_slot".to_string(),
            status: StepStatus::Failed,
            duration_ms: 0,
            error: Some(e.to_string()),
        });
        if first_deploy {
            release_fresh_pair(core, &doc).await;
        }
        return Err(e);
    }

    let port = doc.slot(target).port;
    let team = core
        .teams
        .owning_team(project)
        .await
        .map(|t| t.team_id)
        .unwrap_or_else(|| auth.team_id.clone());

    let mut intent = SlotIntent::new(project, environment, target, port, image, version, &team);
    let env_file = core.config.env_file_path(project, environment);
    if env_file.exists() {
        intent.env_file = Some(env_file);
    }
    let unit_name = intent.unit_name();
    let unit_path = core.config.unit_path(project, environment, target);
    let unit_text = render::quadlet_unit(&intent);

    // Everything past this point owns a written unit file and must clean
    // it up on failure.
    let unit_dir = core.config.unit_dir(project);
    let write_result = steps
        .run("write_unit", async {
            core.executor
                .mkdir_p(fleet::APP, &unit_dir)
                .await
                .map_err(|e| CoreError::QuadletWrite { detail: e.to_string() })?;
            core.executor
                .write_file(fleet::APP, &unit_path, unit_text.as_bytes())
                .await
                .map_err(|e| CoreError::QuadletWrite { detail: e.to_string() })
        })
        .await;
    if let Err(e) = write_result {
        if first_deploy {
            release_fresh_pair(core, &doc).await;
        }
        return Err(e);
    }

    let started_result = async {
        steps
            .run("daemon_reload", async {
                core.executor
                    .exec(
                        fleet::APP,
                        RemoteCommand::new("systemctl").args(["--user", "daemon-reload"]),
                        STEP_TIMEOUT,
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| CoreError::DaemonReload { detail: e.to_string() })
            })
            .await?;

        // A stale container from an earlier generation may still be up.
        steps
            .run("stop_stale", async {
                let _ = core
                    .executor
                    .run(
                        fleet::APP,
                        RemoteCommand::new("systemctl").args(["--user", "stop", &unit_name]),
                        STEP_TIMEOUT,
                    )
                    .await?;
                Ok(())
            })
            .await?;

        steps
            .run("start", async {
                core.executor
                    .exec(
                        fleet::APP,
                        RemoteCommand::new("systemctl").args(["--user", "start", &unit_name]),
                        STEP_TIMEOUT,
                    )
                    .await
                    .map(|_| ())
                    .map_err(|e| CoreError::StartFailed { detail: e.to_string() })
            })
            .await?;

        if req.skip_healthcheck {
            steps.skip("health_wait");
        } else {
            steps
                .run("health_wait", wait_healthy(core, port))
                .await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = started_result {
        compensate(core, &unit_name, &unit_path).await;
        if first_deploy {
            release_fresh_pair(core, &doc).await;
        }
        return Err(e);
    }

    // Only now advance the registry.
    steps
        .run("store_registry", async {
            let now = Utc::now();
            let slot = doc.slot_mut(target);
            slot.state = SlotState::Deployed;
            slot.version = Some(version.to_string());
            slot.image = Some(image.to_string());
            slot.deployed_at = Some(now);
            slot.deployed_by = Some(auth.token_id.clone());
            slot.promoted_at = None;
            slot.promoted_by = None;
            slot.rolled_back_at = None;
            slot.rolled_back_by = None;
            slot.health = HealthStatus::Healthy;
            doc.last_updated = now;
            core.slots.store(&doc)
        })
        .await?;

    Ok((doc, target))
}

/// Poll the slot's `/health` endpoint until 2xx or the deadline passes.
async fn wait_healthy(core: &Core, port: u16) -> Result<(), CoreError> {
    tokio::time::sleep(core.config.health_settle).await;
    let deadline = Instant::now() + core.config.health_deadline;
    loop {
        if core.probe_health(port).await? {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CoreError::HealthTimeout {
                port,
                waited_secs: core.config.health_deadline.as_secs(),
            });
        }
        tokio::time::sleep(core.config.health_interval).await;
    }
}

/// Best-effort teardown after a failed start: stop the unit, delete the
/// unit file, reload. Idempotent.
async fn compensate(core: &Core, unit_name: &str, unit_path: &std::path::Path) {
    let _ = core
        .executor
        .run(
            fleet::APP,
            RemoteCommand::new("systemctl").args(["--user", "stop", unit_name]),
            STEP_TIMEOUT,
        )
        .await;
    let _ = core
        .executor
        .run(
            fleet::APP,
            RemoteCommand::new("rm")
                .arg("-f")
                .arg(unit_path.display().to_string()),
            STEP_TIMEOUT,
        )
        .await;
    let _ = core
        .executor
        .run(
            fleet::APP,
            RemoteCommand::new("systemctl").args(["--user", "daemon-reload"]),
            STEP_TIMEOUT,
        )
        .await;
}

/// A failed first deploy returns its freshly reserved pair so a retry does
/// not leak ports.
async fn release_fresh_pair(core: &Core, doc: &ProjectSlots) {
    if let Err(e) = core.ports.release(&[doc.blue.port, doc.green.port]).await {
        warn!(error = %e, "port_release_failed");
    }
}
