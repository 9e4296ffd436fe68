use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::registry::{Environment, write_atomic};

/* ============================= LEDGER FILE ============================= */

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    ports: PortSets,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PortSets {
    used: BTreeSet<u16>,
    reserved: BTreeSet<u16>,
}

/* ============================= PORT LEDGER ============================= */

/// The SSOT record of allocated ports across the fleet.
///
/// All mutation happens inside one critical section; `allocate_pair` is
/// linearizable across callers. Ports stay `used` for the lifetime of a
/// project's pair; releasing them is a separate administrative action.
pub struct PortLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PortLedger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<LedgerFile, CoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LedgerFile::default()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    fn store(&self, file: &LedgerFile) -> Result<(), CoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &serde_json::to_vec_pretty(file)?)
    }

    /// Reserve the lowest free (even, odd) pair in the environment's range.
    ///
    /// A pair is free when neither port appears in `used`, `reserved`, or
    /// the live listening snapshot the caller observed. The pair is written
    /// back to `used` before the lock is dropped, so a crash can lose an
    /// allocation but never half-record one.
    pub async fn allocate_pair(
        &self,
        environment: Environment,
        live: &BTreeSet<u16>,
    ) -> Result<(u16, u16), CoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        let (lo, hi) = environment.port_range();

        let mut p = if lo % 2 == 0 { lo } else { lo + 1 };
        while p + 1 <= hi {
            let q = p + 1;
            let taken = |port: u16| {
                file.ports.used.contains(&port)
                    || file.ports.reserved.contains(&port)
                    || live.contains(&port)
            };
            if !taken(p) && !taken(q) {
                file.ports.used.insert(p);
                file.ports.used.insert(q);
                self.store(&file)?;
                debug!(environment = %environment, blue = p, green = q, "port_pair_allocated");
                return Ok((p, q));
            }
            p += 2;
        }
        Err(CoreError::PortExhausted {
            environment: environment.to_string(),
        })
    }

    /// Drop the listed ports from `used`. Unknown ports are ignored.
    pub async fn release(&self, ports: &[u16]) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        for port in ports {
            file.ports.used.remove(port);
        }
        self.store(&file)
    }

    pub async fn snapshot(&self) -> Result<BTreeSet<u16>, CoreError> {
        let _guard = self.lock.lock().await;
        let file = self.load()?;
        Ok(file.ports.used.union(&file.ports.reserved).copied().collect())
    }

    /// True when every listed port is recorded as used.
    pub async fn holds_all(&self, ports: &[u16]) -> Result<bool, CoreError> {
        let _guard = self.lock.lock().await;
        let file = self.load()?;
        Ok(ports.iter().all(|p| file.ports.used.contains(p)))
    }

    /// Seed `used` directly; for migrations and tests.
    pub async fn mark_used(&self, ports: &[u16]) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load()?;
        file.ports.used.extend(ports.iter().copied());
        self.store(&file)
    }
}

/* ============================= LIVE SNAPSHOT ============================= */

/// Parse `ss -ltnH` output into the set of listening ports.
///
/// Tolerates unparseable lines; an empty or garbled snapshot simply means
/// the ledger relies on its own record.
pub fn parse_listening_ports(output: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for line in output.lines() {
        // LISTEN 0 4096 0.0.0.0:4000 0.0.0.0:* ...
        let Some(local) = line.split_whitespace().nth(3) else {
            continue;
        };
        let Some(port_str) = local.rsplit(':').next() else {
            continue;
        };
        if let Ok(port) = port_str.parse::<u16>() {
            ports.insert(port);
        }
    }
    ports
}
