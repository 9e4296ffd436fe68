use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditKind};
use crate::control::Core;
use crate::error::CoreError;
use crate::executor::RemoteCommand;
use crate::fleet;
use crate::registry::{Environment, SlotState};
use crate::render;
use crate::teams::AuthContext;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/* ============================= REPORT ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// The registry says a slot is active but no proxy site file exists.
    ProxyMissing,
    /// The proxy serves a different port than the active slot's.
    ProxyPortMismatch,
    /// The active slot's unit is not running.
    UnitInactive,
}

#[derive(Debug, Clone, Serialize)]
pub struct Divergence {
    pub project: String,
    pub environment: Environment,
    pub kind: DivergenceKind,
    pub detail: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub divergences: Vec<Divergence>,
}

/* ============================= WALK ============================= */

/// Compare every registry's `active` slot to what is actually on the host:
/// the proxy site file and the unit manager's view. Divergences are
/// reported (audit event per finding) and never silently repaired — the
/// operator decides between re-promote and rollback.
pub async fn run(core: &Core) -> Result<ReconcileReport, CoreError> {
    let auth = AuthContext::system();
    let mut report = ReconcileReport::default();

    for summary in core.slots.list()? {
        let doc = match core.slots.load(&summary.project, summary.environment) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(project = %summary.project, error = %e, "reconcile_load_failed");
                continue;
            }
        };
        let Some(active) = [&doc.blue, &doc.green]
            .into_iter()
            .find(|s| s.state == SlotState::Active)
        else {
            continue;
        };
        report.checked += 1;

        let site_path = core.config.site_path(&doc.project, doc.environment);
        match core.executor.read_file(fleet::APP, &site_path).await {
            Err(_) => {
                record(
                    core,
                    &auth,
                    &mut report,
                    &doc.project,
                    doc.environment,
                    DivergenceKind::ProxyMissing,
                    format!("no site file at {}", site_path.display()),
                );
            }
            Ok(bytes) => {
                let served = render::parse_site_port(&String::from_utf8_lossy(&bytes));
                if served != Some(active.port) {
                    record(
                        core,
                        &auth,
                        &mut report,
                        &doc.project,
                        doc.environment,
                        DivergenceKind::ProxyPortMismatch,
                        format!(
                            "proxy serves port {}, registry says {} ({})",
                            served.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                            active.port,
                            active.name
                        ),
                    );
                }
            }
        }

        let unit = render::unit_name(&doc.project, doc.environment, active.name);
        let is_active = core
            .executor
            .run(
                fleet::APP,
                RemoteCommand::new("systemctl").args(["--user", "is-active", "--quiet", &unit]),
                PROBE_TIMEOUT,
            )
            .await
            .map(|out| out.ok())
            .unwrap_or(false);
        if !is_active {
            record(
                core,
                &auth,
                &mut report,
                &doc.project,
                doc.environment,
                DivergenceKind::UnitInactive,
                format!("unit {unit} is not running"),
            );
        }
    }

    info!(
        checked = report.checked,
        divergences = report.divergences.len(),
        "reconcile_completed"
    );
    Ok(report)
}

fn record(
    core: &Core,
    auth: &AuthContext,
    report: &mut ReconcileReport,
    project: &str,
    environment: Environment,
    kind: DivergenceKind,
    detail: String,
) {
    warn!(project, environment = %environment, ?kind, detail, "reconcile_divergence");
    let mut event = AuditEvent::new(AuditKind::Reconcile, project, environment, auth)
        .reason(Some(detail.clone()));
    event.success = false;
    if let Err(e) = core.audit.append(&event) {
        warn!(error = %e, "audit_append_failed");
    }
    report.divergences.push(Divergence {
        project: project.to_string(),
        environment,
        kind,
        detail,
    });
}
