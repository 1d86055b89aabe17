use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::plugin;

#[derive(Debug, Deserialize, Clone)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    /// Follow RFC 7234 even where it lets clients force origin traffic.
    #[serde(default = "default_true")]
    pub rfc_compliant: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub remap_rules_file: String,
    #[serde(default)]
    pub concurrent_rule_requests: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size_bytes: u64,
    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            strict: false,
            rfc_compliant: true,
            hostname: None,
            pidfile: None,
            logger: Logger::default(),
            server: Server::default(),
            remap_rules_file: String::new(),
            concurrent_rule_requests: 0,
            cache_size_bytes: default_cache_size(),
            caches: HashMap::new(),
            upstream: Upstream::default(),
            plugins: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cache_size() -> u64 {
    1 << 30
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.remap_rules_file.trim().is_empty() {
            return Err(anyhow!("remap_rules_file is required"));
        }
        if self.caches.contains_key("") {
            return Err(anyhow!("caches: the empty name is reserved for the default cache"));
        }
        for p in &self.plugins {
            if plugin::lookup(&p.name).is_none() {
                return Err(anyhow!("plugin {} is not a known plugin", p.name));
            }
        }
        Ok(())
    }

    /// Rules file path, relative paths taken from the config file's directory.
    pub fn rules_path(&self, config_path: &Path) -> PathBuf {
        let rules = Path::new(&self.remap_rules_file);
        if rules.is_absolute() {
            return rules.to_path_buf();
        }
        match config_path.parent() {
            Some(dir) => dir.join(rules),
            None => rules.to_path_buf(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub traceid: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    /// Ask every client to close its connection after the response.
    #[serde(default)]
    pub connection_close: bool,
    /// Time a client gets to send the request head. Zero disables it.
    #[serde(default, with = "humantime_serde")]
    pub header_read_timeout: Duration,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct CacheConfig {
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Upstream {
    #[serde(default)]
    pub max_idle_conns_per_host: usize,
    #[serde(default, with = "humantime_serde")]
    pub idle_conn_timeout: Duration,
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Plugin {
    #[serde(default)]
    pub name: String,
    /// Lower runs first. Equal priorities keep list order.
    #[serde(default)]
    pub priority: i32,
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

/// Parses bootstrap YAML, returning the config and every key it ignored.
pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
