//! Host-to-instance dispatch and lifecycle.
//!
//! Instances share one database handle; per-tenant table prefixes keep
//! their data apart. The cache sits behind a single reader/writer lock so
//! concurrent dispatches for the same host observe one consistent
//! instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use tracing::info;

use crate::config::Config;
use crate::instance::Instance;

pub struct Dispatcher {
    config_dir: PathBuf,
    conn: Arc<Mutex<Connection>>,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
}

impl Dispatcher {
    pub fn new(config_dir: PathBuf, db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?;
        Ok(Self {
            config_dir,
            conn: Arc::new(Mutex::new(conn)),
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Hosts with a config file present.
    pub fn known_hosts(&self) -> Result<Vec<String>> {
        let mut hosts = vec![];
        let entries = std::fs::read_dir(&self.config_dir)
            .with_context(|| format!("scanning config dir {}", self.config_dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    hosts.push(stem.to_string());
                }
            }
        }
        hosts.sort();
        Ok(hosts)
    }

    /// Host header values may carry a port; config files are keyed by bare
    /// host name.
    fn canonical_host(host: &str) -> &str {
        host.split(':').next().unwrap_or(host)
    }

    fn build(&self, host: &str) -> Result<Arc<Instance>> {
        let path = self.config_dir.join(format!("{host}.toml"));
        let config = Config::load(&path)?;
        if config.host != host {
            bail!(
                "config {} declares host {:?}, expected {:?}",
                path.display(),
                config.host,
                host
            );
        }
        let instance = Instance::new(config, self.conn.clone())?;
        Ok(Arc::new(instance))
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Instance>>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Instance>>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The instance for a Host header, constructing and caching it on the
    /// first dispatch.
    pub fn get(&self, host: &str) -> Result<Arc<Instance>> {
        let host = Self::canonical_host(host);
        if let Some(instance) = self.read_cache().get(host) {
            return Ok(instance.clone());
        }
        let instance = self.build(host)?;
        let mut cache = self.write_cache();
        // A concurrent dispatch may have won the build race; keep its copy.
        let entry = cache
            .entry(host.to_string())
            .or_insert_with(|| {
                info!(host, "loaded instance");
                instance
            });
        Ok(entry.clone())
    }

    /// Tear down the cached instance and rebuild from its config file.
    pub fn reload(&self, host: &str) -> Result<Arc<Instance>> {
        let host = Self::canonical_host(host);
        let instance = self.build(host)?;
        self.write_cache().insert(host.to_string(), instance.clone());
        info!(host, "reloaded instance");
        Ok(instance)
    }

    /// Drop a tenant whose config file went away.
    pub fn remove(&self, host: &str) {
        let host = Self::canonical_host(host);
        if self.write_cache().remove(host).is_some() {
            info!(host, "removed instance");
        }
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::fs;

    /// Write a minimal tenant config for `host` into the dispatcher's
    /// config dir.
    pub fn write_host_config(dir: &Path, host: &str, secret_seed: u8, extra: &str) {
        let mut secret = [0u8; 32];
        secret[31] = secret_seed;
        let schema = format!("s{}", host.replace(['.', '-'], "_"));
        let body = format!(
            "host = \"{host}\"\nschema = \"{schema}\"\nsecret = \"{}\"\n{extra}",
            hex::encode(secret)
        );
        fs::write(dir.join(format!("{host}.toml")), body).unwrap();
    }

    pub fn test_dispatcher(dir: &Path) -> Dispatcher {
        Dispatcher::new(dir.to_path_buf(), &dir.join("relay.db")).unwrap()
    }
}
