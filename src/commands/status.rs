use codeb_control::audit::AuditKind;
use codeb_control::registry::{Environment, Slot};
use codeb_control::teams::AuthContext;

use super::init_core;

/// Print both slots of one (project, environment) plus recent history.
pub async fn run(project: &str, environment: &str) -> anyhow::Result<()> {
    let environment: Environment = environment.parse()?;
    let core = init_core()?;
    let auth = AuthContext::system();

    let doc = core.status(&auth, project, environment).await?;

    println!("{} / {}", doc.project, doc.environment);
    println!("  active slot: {}", doc.active_slot);
    println!("  last updated: {}", doc.last_updated.to_rfc3339());
    println!();
    print_slot(&doc.blue);
    print_slot(&doc.green);

    let mut history = Vec::new();
    for kind in [AuditKind::Deploy, AuditKind::Promote, AuditKind::Rollback, AuditKind::Cleanup] {
        history.extend(core.audit_events(&auth, kind, project, environment).await?);
    }
    history.sort_by_key(|e| e.timestamp);

    if !history.is_empty() {
        println!("\n  Recent events:");
        for event in history.iter().rev().take(10) {
            println!(
                "    {} {:<9} {} {}",
                event.timestamp.to_rfc3339(),
                event.event.as_str(),
                if event.success { "ok" } else { "FAILED" },
                event.to_version.as_deref().unwrap_or("-"),
            );
        }
    }

    Ok(())
}

fn print_slot(slot: &Slot) {
    println!("  {} (port {})", slot.name, slot.port);
    println!("    state:    {}", slot.state);
    println!("    version:  {}", slot.version.as_deref().unwrap_or("-"));
    println!("    image:    {}", slot.image.as_deref().unwrap_or("-"));
    if let Some(t) = slot.deployed_at {
        println!("    deployed: {}", t.to_rfc3339());
    }
    if let Some(t) = slot.promoted_at {
        println!("    promoted: {}", t.to_rfc3339());
    }
    if let Some(t) = slot.grace_expires_at {
        println!("    grace expires: {}", t.to_rfc3339());
    }
}

/// Table of every slot registry.
pub async fn list() -> anyhow::Result<()> {
    let core = init_core()?;
    let rows = core.list(&AuthContext::system()).await?;

    println!(
        "{:<24} {:<12} {:<8} {:<10} {:<10} {:<20}",
        "PROJECT", "ENVIRONMENT", "ACTIVE", "BLUE", "GREEN", "UPDATED"
    );
    println!("{}", "-".repeat(88));
    for row in &rows {
        println!(
            "{:<24} {:<12} {:<8} {:<10} {:<10} {:<20}",
            row.project,
            row.environment.to_string(),
            row.active_slot.to_string(),
            row.blue_state.to_string(),
            row.green_state.to_string(),
            row.last_updated.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    println!("\nTotal: {} registries", rows.len());
    Ok(())
}
