use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind};
use crate::control::Core;
use crate::error::CoreError;
use crate::executor::RemoteCommand;
use crate::fleet;
use crate::registry::{Environment, HealthStatus, SlotName, SlotState};
use crate::render;
use crate::teams::AuthContext;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    pub project: String,
    pub environment: Environment,
    /// Slot traffic returned to.
    pub restored: SlotName,
    pub port: u16,
    /// Former active slot, now deployed (re-promotable or cleanable).
    pub demoted: SlotName,
}

/// Repoint the proxy at the grace slot. Instantaneous because that
/// container never stopped. Repeating it toggles traffic back and forth,
/// which is deliberate. Must run under the per-(project, environment) lock.
pub(crate) async fn run(
    core: &Core,
    auth: &AuthContext,
    project: &str,
    environment: Environment,
    reason: Option<String>,
) -> Result<RollbackOutcome, CoreError> {
    let started = Instant::now();
    let mut doc = core.slots.load(project, environment)?;

    let current = doc.active_slot;
    let prev = current.other();
    let prev_slot = doc.slot(prev);

    if prev_slot.state != SlotState::Grace {
        return Err(CoreError::NoPreviousVersion);
    }

    // Cleanup may have reclaimed the container even though the registry
    // still says grace; the probe catches that before traffic moves.
    if !core.probe_health(prev_slot.port).await? {
        return Err(CoreError::PreviousUnhealthy {
            slot: prev.to_string(),
        });
    }

    let port = prev_slot.port;
    let version = prev_slot
        .version
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let site = render::caddy_site(
        project,
        environment,
        &core.config.base_domain,
        port,
        &version,
        prev,
    );
    core.executor
        .write_file(fleet::APP, &core.config.site_path(project, environment), site.as_bytes())
        .await?;
    core.executor
        .exec(
            fleet::APP,
            RemoteCommand::new("systemctl").args(["reload", "caddy"]),
            STEP_TIMEOUT,
        )
        .await?;

    let now = Utc::now();
    let from_version = doc.slot(current).version.clone();
    {
        let slot = doc.slot_mut(prev);
        slot.state = SlotState::Active;
        slot.grace_expires_at = None;
        slot.rolled_back_at = Some(now);
        slot.rolled_back_by = Some(auth.token_id.clone());
        slot.health = HealthStatus::Healthy;
    }
    doc.slot_mut(current).state = SlotState::Deployed;
    doc.active_slot = prev;
    doc.last_updated = now;
    core.slots.store(&doc)?;

    info!(
        project,
        environment = %environment,
        restored = %prev,
        port,
        reason = reason.as_deref().unwrap_or(""),
        "rollback_succeeded"
    );

    let event = AuditEvent::new(AuditKind::Rollback, project, environment, auth)
        .slots(Some(current), Some(prev))
        .versions(from_version, Some(version))
        .reason(reason)
        .duration(started.elapsed().as_millis() as u64);
    if let Err(e) = core.audit.append(&event) {
        warn!(error = %e, "audit_append_failed");
    }

    Ok(RollbackOutcome {
        project: project.to_string(),
        environment,
        restored: prev,
        port,
        demoted: current,
    })
}
