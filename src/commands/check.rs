use std::time::Duration;

use futures::future::join_all;

use codeb_control::executor::{Executor, RemoteCommand};
use codeb_control::teams::AuthContext;

use super::init_core;

/// Dotted-checklist diagnostics: configuration, registries, and a probe
/// of every fleet server.
pub async fn run() -> anyhow::Result<()> {
    println!("Running control plane checks...\n");

    print!("  Configuration ............... ");
    let core = match init_core() {
        Ok(core) => {
            println!("OK");
            core
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load configuration: {e:#}");
        }
    };

    print!("  Base directory .............. ");
    if core.config.base_dir.is_dir() {
        println!("OK ({})", core.config.base_dir.display());
    } else {
        println!("MISSING ({})", core.config.base_dir.display());
    }

    print!("  Teams registry .............. ");
    match core.teams.list_teams(&AuthContext::system()).await {
        Ok(teams) => println!("OK ({} teams)", teams.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Slot registries ............. ");
    match core.slots.list() {
        Ok(list) => println!("OK ({} documents)", list.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    print!("  Port ledger ................. ");
    match core.ports.snapshot().await {
        Ok(ports) => println!("OK ({} ports allocated)", ports.len()),
        Err(e) => println!("FAIL ({e})"),
    }

    println!("\n  Fleet connectivity:");
    let probes = core.config.fleet.iter().map(|server| {
        let name = server.name.clone();
        let executor = core.executor.clone();
        async move {
            let result = executor
                .exec(
                    &name,
                    RemoteCommand::new("echo").arg("ok"),
                    Duration::from_secs(10),
                )
                .await;
            (name, result)
        }
    });
    for (name, result) in join_all(probes).await {
        let dots = ".".repeat(26usize.saturating_sub(name.len()));
        match result {
            Ok(_) => println!("    {name} {dots} OK"),
            Err(e) => println!("    {name} {dots} FAIL ({})", e.code()),
        }
    }

    println!("\nAll checks completed.");
    Ok(())
}
