use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
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
pub struct PromoteOutcome {
    pub project: String,
    pub environment: Environment,
    pub promoted: SlotName,
    pub port: u16,
    pub domain: String,
    /// Former active slot now in grace, if there was one.
    pub previous: Option<SlotName>,
    pub grace_expires_at: Option<DateTime<Utc>>,
    /// True when the proxy already pointed at the intended slot and
    /// nothing changed.
    pub noop: bool,
}

/// Switch traffic to the deployed slot and start the grace window on the
/// former active slot. Must run under the per-(project, environment) lock;
/// holding it across write/reload/store is what keeps the proxy and the
/// registry from diverging.
pub(crate) async fn run(
    core: &Core,
    auth: &AuthContext,
    project: &str,
    environment: Environment,
) -> Result<PromoteOutcome, CoreError> {
    let started = Instant::now();
    let mut doc = core.slots.load(project, environment)?;

    let current_active = [&doc.blue, &doc.green]
        .into_iter()
        .find(|s| s.state == SlotState::Active)
        .map(|s| s.name);

    // First-time promote serves the active-elect slot itself; afterwards
    // the candidate is always the non-active one.
    let new_name = match current_active {
        Some(active) => active.other(),
        None => doc.active_slot,
    };
    let new = doc.slot(new_name);

    if new.state != SlotState::Deployed {
        // Re-promote with nothing new deployed: a no-op when the proxy
        // already serves the active slot's config, an error otherwise.
        if let Some(active_name) = current_active {
            let active = doc.slot(active_name);
            let intended = render::caddy_site(
                project,
                environment,
                &core.config.base_domain,
                active.port,
                active.version.as_deref().unwrap_or("unknown"),
                active_name,
            );
            let site_path = core.config.site_path(project, environment);
            if let Ok(existing) = core.executor.read_file(fleet::APP, &site_path).await {
                if existing == intended.as_bytes() {
                    info!(project, environment = %environment, "promote_noop");
                    return Ok(PromoteOutcome {
                        project: project.to_string(),
                        environment,
                        promoted: active_name,
                        port: active.port,
                        domain: render::site_domain(project, environment, &core.config.base_domain),
                        previous: None,
                        grace_expires_at: None,
                        noop: true,
                    });
                }
            }
        }
        return Err(CoreError::NotDeployed {
            slot: new_name.to_string(),
            state: new.state.to_string(),
        });
    }

    // Single health re-probe before taking traffic.
    if !core.probe_health(new.port).await? {
        return Err(CoreError::Unhealthy {
            slot: new_name.to_string(),
            port: new.port,
        });
    }

    let port = new.port;
    let version = new.version.clone().unwrap_or_else(|| "unknown".to_string());
    let site = render::caddy_site(
        project,
        environment,
        &core.config.base_domain,
        port,
        &version,
        new_name,
    );
    let site_path = core.config.site_path(project, environment);

    // Skip the write + reload when the file already matches (retry after
    // a divergent failure); the registry swap below still happens.
    let already_current = match core.executor.read_file(fleet::APP, &site_path).await {
        Ok(existing) => existing == site.as_bytes(),
        Err(_) => false,
    };
    if !already_current {
        core.executor
            .write_file(fleet::APP, &site_path, site.as_bytes())
            .await?;
        core.executor
            .exec(
                fleet::APP,
                RemoteCommand::new("systemctl").args(["reload", "caddy"]),
                STEP_TIMEOUT,
            )
            .await?;
    }

    let grace_hours = core
        .teams
        .grace_hours_for_project(project)
        .await
        .unwrap_or(core.config.grace_hours);

    let now = Utc::now();
    let grace_expires_at = now + chrono::Duration::hours(i64::from(grace_hours));

    let from_version = current_active.and_then(|n| doc.slot(n).version.clone());

    {
        let slot = doc.slot_mut(new_name);
        slot.state = SlotState::Active;
        slot.promoted_at = Some(now);
        slot.promoted_by = Some(auth.token_id.clone());
        slot.health = HealthStatus::Healthy;
    }
    let mut graced = None;
    if let Some(active_name) = current_active {
        let slot = doc.slot_mut(active_name);
        slot.state = SlotState::Grace;
        slot.grace_expires_at = Some(grace_expires_at);
        graced = Some(active_name);
    }
    doc.active_slot = new_name;
    doc.last_updated = now;
    core.slots.store(&doc)?;

    info!(
        project,
        environment = %environment,
        slot = %new_name,
        port,
        version = %version,
        "promote_succeeded"
    );

    let event = AuditEvent::new(AuditKind::Promote, project, environment, auth)
        .slots(graced, Some(new_name))
        .versions(from_version, Some(version))
        .duration(started.elapsed().as_millis() as u64);
    if let Err(e) = core.audit.append(&event) {
        warn!(error = %e, "audit_append_failed");
    }

    Ok(PromoteOutcome {
        project: project.to_string(),
        environment,
        promoted: new_name,
        port,
        domain: render::site_domain(project, environment, &core.config.base_domain),
        previous: graced,
        grace_expires_at: graced.map(|_| grace_expires_at),
        noop: false,
    })
}
