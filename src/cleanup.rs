use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind};
use crate::control::Core;
use crate::error::CoreError;
use crate::executor::RemoteCommand;
use crate::fleet;
use crate::registry::{Environment, SlotName, SlotState};
use crate::render;
use crate::teams::AuthContext;

const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub cleaned: Vec<SlotName>,
    /// Slots left alone, with the reason.
    pub skipped: Vec<(SlotName, String)>,
}

/// Reclaim slots whose grace window has elapsed (or any non-active slot
/// with `force`). Container teardown is best-effort; the registry reset is
/// not. Ports stay reserved in the ledger so the project's pair is stable.
/// Must run under the per-(project, environment) lock.
///
/// `now` is injected so expiry is decided on one consistent wall-clock
/// reading.
pub(crate) async fn run(
    core: &Core,
    auth: &AuthContext,
    project: &str,
    environment: Environment,
    force: bool,
    now: DateTime<Utc>,
) -> Result<CleanupOutcome, CoreError> {
    let mut doc = core.slots.load(project, environment)?;
    let mut outcome = CleanupOutcome::default();

    for name in [SlotName::Blue, SlotName::Green] {
        let slot = doc.slot(name);
        let reclaim = match slot.state {
            SlotState::Active => {
                outcome.skipped.push((name, "active".to_string()));
                false
            }
            SlotState::Empty => false,
            SlotState::Grace => {
                let expired = slot.grace_expires_at.is_some_and(|t| t <= now);
                if expired || force {
                    true
                } else {
                    outcome.skipped.push((
                        name,
                        format!(
                            "grace until {}",
                            slot.grace_expires_at
                                .map(|t| t.to_rfc3339())
                                .unwrap_or_default()
                        ),
                    ));
                    false
                }
            }
            SlotState::Deployed => {
                if force {
                    true
                } else {
                    outcome
                        .skipped
                        .push((name, "deployed (force to reclaim)".to_string()));
                    false
                }
            }
        };
        if !reclaim {
            continue;
        }

        let from_version = doc.slot(name).version.clone();
        teardown(core, project, environment, name).await;
        doc.slot_mut(name).reset();
        outcome.cleaned.push(name);

        let event = AuditEvent::new(AuditKind::Cleanup, project, environment, auth)
            .slots(Some(name), None)
            .versions(from_version, None)
            .reason(if force {
                Some("forced".to_string())
            } else {
                Some("grace expired".to_string())
            });
        if let Err(e) = core.audit.append(&event) {
            warn!(error = %e, "audit_append_failed");
        }
    }

    if outcome.cleaned.is_empty() {
        return Ok(outcome);
    }

    doc.last_updated = now;
    if doc.both_empty() {
        // An all-empty document must not exist; the pair stays in the
        // ledger for the project's next deploy.
        core.slots.remove(project, environment)?;
    } else {
        core.slots.store(&doc)?;
    }

    info!(
        project,
        environment = %environment,
        cleaned = outcome.cleaned.len(),
        "cleanup_succeeded"
    );
    Ok(outcome)
}

/// Stop the container, delete its unit, reload the unit manager. Each
/// step tolerates failure; a dead container or missing file is fine.
async fn teardown(core: &Core, project: &str, environment: Environment, slot: SlotName) {
    let unit = render::unit_name(project, environment, slot);
    let unit_path = core.config.unit_path(project, environment, slot);
    let _ = core
        .executor
        .run(
            fleet::APP,
            RemoteCommand::new("systemctl").args(["--user", "stop", &unit]),
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
