mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, TeamAction};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run().await?,
        Commands::Status { project, environment } => {
            commands::status::run(&project, &environment).await?;
        }
        Commands::List => commands::status::list().await?,
        Commands::Scan { addr, interval } => commands::scan::run(&addr, interval).await?,
        Commands::Reconcile => commands::reconcile::run().await?,
        Commands::Team { action } => match action {
            TeamAction::Bootstrap { team, name, plan, projects } => {
                commands::team::bootstrap(&team, &name, &plan, &projects).await?;
            }
            TeamAction::List => commands::team::list().await?,
        },
    }

    Ok(())
}
