use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "codeb-control")]
#[command(about = "Blue-Green deployment control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check configuration, registries, and fleet connectivity
    Check,

    /// Show both slots of one (project, environment)
    Status {
        project: String,
        /// staging | production | preview
        environment: String,
    },

    /// List all slot registries
    List,

    /// Run the periodic cleanup/reconcile scheduler with an ops HTTP server
    Scan {
        #[arg(long, default_value = "0.0.0.0:9090")]
        addr: String,
        /// Seconds between sweeps
        #[arg(long, default_value_t = 300)]
        interval: u64,
    },

    /// Compare registries against the proxy and unit manager, report drift
    Reconcile,

    /// Manage teams
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },
}

#[derive(Subcommand)]
pub enum TeamAction {
    /// Create a team and print its owner token (shown exactly once)
    Bootstrap {
        /// Team slug (lowercase alphanumerics and hyphens, 3-30 chars)
        #[arg(long)]
        team: String,
        /// Display name
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "free")]
        plan: String,
        /// Project to assign (repeatable)
        #[arg(long = "project")]
        projects: Vec<String>,
    },

    /// List teams
    List,
}
