use codeb_control::teams::AuthContext;

use super::init_core;

/// Create a team with its owner token and optionally assign projects.
/// The raw owner secret is printed exactly once and never stored.
pub async fn bootstrap(
    team: &str,
    name: &str,
    plan: &str,
    projects: &[String],
) -> anyhow::Result<()> {
    let core = init_core()?;
    let auth = AuthContext::system();

    let (created, secret) = core.teams.create_team(None, team, name, plan).await?;
    for project in projects {
        core.teams.assign_project(&auth, team, project).await?;
    }

    println!("Team '{}' created (plan: {}).", created.team_id, created.plan);
    if !projects.is_empty() {
        println!("Projects: {}", projects.join(", "));
    }
    println!("\nOwner token (store it now, it will not be shown again):\n");
    println!("  {secret}\n");
    Ok(())
}

pub async fn list() -> anyhow::Result<()> {
    let core = init_core()?;
    let teams = core.teams.list_teams(&AuthContext::system()).await?;

    println!("{:<20} {:<24} {:<8} {:<8}", "TEAM", "NAME", "PLAN", "PROJECTS");
    println!("{}", "-".repeat(62));
    for team in &teams {
        println!(
            "{:<20} {:<24} {:<8} {:<8}",
            team.team_id,
            team.display_name,
            team.plan,
            team.projects.len(),
        );
    }
    println!("\nTotal: {} teams", teams.len());
    Ok(())
}
