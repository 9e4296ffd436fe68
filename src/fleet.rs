/* ============================= FLEET ============================= */

/// Well-known server names. Commands are always addressed to one of these.
pub const APP: &str = "app";
pub const STREAMING: &str = "streaming";
pub const STORAGE: &str = "storage";
pub const BACKUP: &str = "backup";

/// One server in the fixed fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub ip: String,
    pub role: String,
}

/// The fixed four-server fleet the control plane manages.
#[derive(Debug, Clone)]
pub struct Fleet {
    servers: Vec<Server>,
}

impl Fleet {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    /// Default addressing; each IP can be overridden from the environment.
    pub fn default_fleet() -> Self {
        Self {
            servers: vec![
                Server {
                    name: APP.to_string(),
                    ip: "10.0.0.10".to_string(),
                    role: "application host (podman, caddy, registries)".to_string(),
                },
                Server {
                    name: STREAMING.to_string(),
                    ip: "10.0.0.11".to_string(),
                    role: "streaming host".to_string(),
                },
                Server {
                    name: STORAGE.to_string(),
                    ip: "10.0.0.12".to_string(),
                    role: "storage host".to_string(),
                },
                Server {
                    name: BACKUP.to_string(),
                    ip: "10.0.0.13".to_string(),
                    role: "backup host".to_string(),
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn set_ip(&mut self, name: &str, ip: &str) {
        if let Some(s) = self.servers.iter_mut().find(|s| s.name == name) {
            s.ip = ip.to_string();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fleet_has_four_servers() {
        let fleet = Fleet::default_fleet();
        assert_eq!(fleet.len(), 4);
        for name in [APP, STREAMING, STORAGE, BACKUP] {
            assert!(fleet.get(name).is_some(), "missing server {name}");
        }
    }

    #[test]
    fn test_get_unknown_server() {
        let fleet = Fleet::default_fleet();
        assert!(fleet.get("database").is_none());
    }

    #[test]
    fn test_set_ip_overrides() {
        let mut fleet = Fleet::default_fleet();
        fleet.set_ip(APP, "192.168.1.50");
        assert_eq!(fleet.get(APP).map(|s| s.ip.as_str()), Some("192.168.1.50"));
    }

    #[test]
    fn test_set_ip_unknown_is_noop() {
        let mut fleet = Fleet::default_fleet();
        fleet.set_ip("database", "192.168.1.50");
        assert_eq!(fleet.len(), 4);
    }
}
