use codeb_control::reconcile;

use super::init_core;

/// One-shot reconciliation: walk every registry, compare the active slot
/// to the proxy and the unit manager, print the drift.
pub async fn run() -> anyhow::Result<()> {
    let core = init_core()?;
    let report = reconcile::run(&core).await?;

    println!(
        "Checked {} active registr{}.",
        report.checked,
        if report.checked == 1 { "y" } else { "ies" }
    );

    if report.divergences.is_empty() {
        println!("No divergence found.");
        return Ok(());
    }

    println!("\n{} divergence(s):", report.divergences.len());
    for d in &report.divergences {
        println!("  {}/{} {:?}: {}", d.project, d.environment, d.kind, d.detail);
    }
    println!("\nDivergences are reported, never auto-repaired: re-promote or roll back.");
    Ok(())
}
