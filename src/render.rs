//! Stateless renderers turning typed intents into the artifacts the hosts
//! consume: a Quadlet container unit and a Caddy site config. Renderers
//! never touch the filesystem.

use std::path::PathBuf;

use crate::registry::{Environment, SlotName};

/// Default port an application container listens on internally.
pub const CONTAINER_PORT: u16 = 3000;

const DEFAULT_MEMORY_LIMIT: &str = "512m";
const DEFAULT_CPU_LIMIT: &str = "1.0";

/* ============================= INTENT ============================= */

/// Everything needed to materialize one slot as a container unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotIntent {
    pub project: String,
    pub environment: Environment,
    pub slot: SlotName,
    pub port: u16,
    pub image: String,
    pub version: String,
    pub team: String,
    pub env_file: Option<PathBuf>,
    pub container_port: u16,
    pub memory_limit: String,
    pub cpu_limit: String,
}

impl SlotIntent {
    pub fn new(
        project: &str,
        environment: Environment,
        slot: SlotName,
        port: u16,
        image: &str,
        version: &str,
        team: &str,
    ) -> Self {
        Self {
            project: project.to_string(),
            environment,
            slot,
            port,
            image: image.to_string(),
            version: version.to_string(),
            team: team.to_string(),
            env_file: None,
            container_port: CONTAINER_PORT,
            memory_limit: DEFAULT_MEMORY_LIMIT.to_string(),
            cpu_limit: DEFAULT_CPU_LIMIT.to_string(),
        }
    }

    pub fn unit_name(&self) -> String {
        unit_name(&self.project, self.environment, self.slot)
    }
}

/* ============================= NAMES & URLS ============================= */

pub fn unit_name(project: &str, environment: Environment, slot: SlotName) -> String {
    format!("{project}-{environment}-{slot}")
}

/// Default image reference when the caller does not pin one.
pub fn image_ref(org: &str, project: &str, version: &str) -> String {
    format!("ghcr.io/{org}/{project}:{version}")
}

/// Public domain a promoted environment serves on.
pub fn site_domain(project: &str, environment: Environment, base_domain: &str) -> String {
    match environment {
        Environment::Production => format!("{project}.{base_domain}"),
        other => format!("{project}-{other}.{base_domain}"),
    }
}

/// Slot-specific URL for validating a deployed-but-not-promoted version.
pub fn preview_url(project: &str, slot: SlotName, base_domain: &str) -> String {
    format!("https://{project}-{slot}.preview.{base_domain}")
}

/* ============================= QUADLET ============================= */

/// Render the systemd Quadlet unit for a slot.
pub fn quadlet_unit(intent: &SlotIntent) -> String {
    let unit = intent.unit_name();
    let env_file_line = intent
        .env_file
        .as_ref()
        .map(|p| format!("EnvironmentFile={}\n", p.display()))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description={project} {environment} ({slot} slot)
Wants=network-online.target
After=network-online.target

[Container]
ContainerName={unit}
Image={image}
PublishPort={port}:{container_port}
{env_file_line}Label=codeb.team={team}
Label=codeb.project={project}
Label=codeb.environment={environment}
Label=codeb.slot={slot}
Label=codeb.version={version}
HealthCmd=curl -fsS http://127.0.0.1:{container_port}/health
HealthInterval=30s
HealthRetries=3
HealthStartPeriod=10s
Memory={memory}
PodmanArgs=--cpus={cpus}

[Service]
Restart=on-failure
TimeoutStartSec=120

[Install]
WantedBy=default.target
"#,
        project = intent.project,
        environment = intent.environment,
        slot = intent.slot,
        image = intent.image,
        port = intent.port,
        container_port = intent.container_port,
        team = intent.team,
        version = intent.version,
        memory = intent.memory_limit,
        cpus = intent.cpu_limit,
    )
}

/* ============================= CADDY ============================= */

/// Render the Caddy site config pointing a domain at the active slot.
pub fn caddy_site(
    project: &str,
    environment: Environment,
    base_domain: &str,
    port: u16,
    version: &str,
    slot: SlotName,
) -> String {
    let domain = site_domain(project, environment, base_domain);
    format!(
        r#"{domain} {{
	encode zstd gzip

	header {{
		X-Content-Type-Options nosniff
		X-Frame-Options DENY
		Referrer-Policy strict-origin-when-cross-origin
	}}

	header X-Codeb-Project "{project}"
	header X-Codeb-Environment "{environment}"
	header X-Codeb-Version "{version}"
	header X-Codeb-Slot "{slot}"

	log {{
		output file /var/log/caddy/{project}-{environment}.access.log
		format json
	}}

	reverse_proxy localhost:{port}
}}
"#
    )
}

/// Extract the upstream port from a rendered site config; used by the
/// reconciler and the promote idempotence check.
pub fn parse_site_port(site: &str) -> Option<u16> {
    site.lines()
        .map(str::trim)
        .find_map(|l| l.strip_prefix("reverse_proxy localhost:"))
        .and_then(|p| p.parse().ok())
}
