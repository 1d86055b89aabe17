use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use http::Uri;
use ipnet::IpNet;
use serde::Deserialize;

use crate::cache::Cache;
use crate::chash::{ConsistentHash, DEFAULT_REPLICAS};
use crate::plugin::{PluginConfigs, PluginRegistry};
use crate::rfc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentSelection {
    ConsistentHash,
    RoundRobin,
}

impl ParentSelection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "consistent-hash" => Some(ParentSelection::ConsistentHash),
            "round-robin" => Some(ParentSelection::RoundRobin),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueryStringRule {
    /// Keep the query on the parent request and hash on it.
    #[serde(default)]
    pub remap: bool,
    /// Include the query in the cache key.
    #[serde(default)]
    pub cache: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RulesJson {
    #[serde(default)]
    retry_num: Option<usize>,
    #[serde(default)]
    retry_codes: Option<Vec<u16>>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    parent_selection: Option<String>,
    #[serde(default)]
    stats: StatsJson,
    #[serde(default)]
    plugins: HashMap<String, serde_json::Value>,
    #[serde(default)]
    plugins_shared: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    rules: Vec<RuleJson>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsJson {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RuleJson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    from: String,
    #[serde(default, rename = "connection-close")]
    connection_close: bool,
    #[serde(default, rename = "query-string")]
    query_string: QueryStringRule,
    #[serde(default)]
    concurrent_rule_requests: usize,
    #[serde(default)]
    dscp: u8,
    #[serde(default)]
    retry_num: Option<usize>,
    #[serde(default)]
    retry_codes: Option<Vec<u16>>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    parent_selection: Option<String>,
    #[serde(default)]
    to: Vec<ToJson>,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
    #[serde(default)]
    cache_name: Option<String>,
    #[serde(default)]
    plugins: HashMap<String, serde_json::Value>,
    #[serde(default)]
    plugins_shared: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize, Default)]
struct ToJson {
    #[serde(default)]
    url: String,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    retry_num: Option<usize>,
    #[serde(default)]
    proxy_url: Option<String>,
    #[serde(default)]
    timeout_ms: Option<i64>,
    #[serde(default)]
    retry_codes: Option<Vec<u16>>,
}

/// A parent of a rule with every setting resolved.
#[derive(Debug, Clone)]
pub struct RemapRuleTo {
    pub url: String,
    pub weight: f64,
    pub retry_num: usize,
    pub proxy_url: Option<Uri>,
    pub timeout: Duration,
    pub retry_codes: Arc<HashSet<u16>>,
}

impl RemapRuleTo {
    /// Name this parent is placed under on the hash ring.
    pub fn ring_identity(&self) -> &str {
        self.proxy_url
            .as_ref()
            .and_then(|u| u.host())
            .unwrap_or(self.url.as_str())
    }
}

pub struct RemapRule {
    pub name: String,
    pub from: String,
    pub connection_close: bool,
    pub query_string: QueryStringRule,
    /// 0 means the bootstrap default applies.
    pub concurrent_rule_requests: usize,
    pub dscp: u8,
    pub retry_num: usize,
    pub parent_selection: ParentSelection,
    pub to: Vec<RemapRuleTo>,
    pub allow: Vec<IpNet>,
    pub deny: Vec<IpNet>,
    pub cache_name: String,
    pub cache: Arc<dyn Cache>,
    pub plugins: PluginConfigs,
    pub plugins_shared: HashMap<String, serde_json::Value>,
    /// Ring of indexes into `to`, built for consistent-hash rules.
    pub consistent_hash: Option<ConsistentHash<usize>>,
}

impl RemapRule {
    /// Deny entries are checked first. An empty allow list admits everyone.
    pub fn allowed(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(&ip)) {
            log::debug!("rule {}: deny list contains {ip}", self.name);
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|net| net.contains(&ip))
    }

    /// Picks the parent for `hash_key` after `failures` failed attempts.
    /// Any lookup problem falls back to the first parent.
    pub fn select_to(&self, hash_key: &str, failures: usize) -> &RemapRuleTo {
        let first = &self.to[0];
        if self.parent_selection != ParentSelection::ConsistentHash {
            return first;
        }
        let Some(ring) = self.consistent_hash.as_ref() else {
            log::error!("rule {}: consistent-hash selection without a ring, using first parent", self.name);
            return first;
        };
        match ring.lookup_failover(hash_key, failures) {
            Ok(idx) => self.to.get(**idx).unwrap_or(first),
            Err(err) => {
                log::error!("rule {}: consistent hash lookup failed ({err}), using first parent", self.name);
                first
            }
        }
    }

    /// Maps `from_uri` onto the parent chosen for this attempt. Returns the
    /// parent URI and the chosen parent.
    pub fn uri(&self, from_uri: &str, path: &str, query: Option<&str>, failures: usize) -> (String, &RemapRuleTo) {
        let mut hash_key = path.to_string();
        if self.query_string.remap {
            if let Some(q) = query.filter(|q| !q.is_empty()) {
                hash_key.push('?');
                hash_key.push_str(q);
            }
        }
        let to = self.select_to(&hash_key, failures);
        let mut uri = format!("{}{}", to.url, &from_uri[self.from.len()..]);
        if !self.query_string.remap {
            strip_query(&mut uri);
        }
        (uri, to)
    }

    /// Keyed on the first parent whichever parent ends up serving, so every
    /// parent shares one entry per resource.
    pub fn cache_key(&self, method: &str, from_uri: &str) -> String {
        let mut uri = format!("{}{}", self.to[0].url, &from_uri[self.from.len()..]);
        if !self.query_string.cache {
            strip_query(&mut uri);
        }
        format!("{method}:{uri}")
    }
}

impl std::fmt::Debug for RemapRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemapRule")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("parent_selection", &self.parent_selection)
            .field("to", &self.to)
            .field("cache_name", &self.cache_name)
            .finish()
    }
}

fn strip_query(uri: &mut String) {
    if let Some(i) = uri.find('?') {
        uri.truncate(i);
    }
}

/// Networks allowed to read the stats endpoint. Unlike rule lists, an empty
/// allow list admits nobody.
#[derive(Debug, Clone, Default)]
pub struct StatsRules {
    pub allow: Vec<IpNet>,
    pub deny: Vec<IpNet>,
}

impl StatsRules {
    pub fn allowed(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        self.allow.iter().any(|net| net.contains(&ip))
    }
}

pub struct RemapRules {
    pub rules: Vec<Arc<RemapRule>>,
    /// Plugin config from the top of the file. Rules already carry it merged.
    pub plugins: PluginConfigs,
    pub stats: StatsRules,
}

pub fn load_rules(
    path: &Path,
    registry: &PluginRegistry,
    caches: &HashMap<String, Arc<dyn Cache>>,
) -> Result<RemapRules> {
    log::info!("loading remap rules from {}", path.display());
    let raw = fs::read_to_string(path).with_context(|| format!("read remap rules {}", path.display()))?;
    let rules = parse_rules(&raw, registry, caches).with_context(|| format!("load remap rules {}", path.display()))?;
    log::info!("loaded {} remap rules", rules.rules.len());
    Ok(rules)
}

pub fn parse_rules(
    raw: &str,
    registry: &PluginRegistry,
    caches: &HashMap<String, Arc<dyn Cache>>,
) -> Result<RemapRules> {
    let json: RulesJson = serde_json::from_str(raw).context("decoding JSON")?;

    let retry_codes = match &json.retry_codes {
        Some(codes) => Some(Arc::new(make_retry_codes(codes).context("rules retry_codes")?)),
        None => None,
    };
    let timeout = make_timeout(json.timeout_ms).context("rules timeout_ms")?;
    let parent_selection = match &json.parent_selection {
        Some(raw) => Some(ParentSelection::parse(raw).ok_or_else(|| anyhow!("rules parent_selection invalid: '{raw}'"))?),
        None => None,
    };
    let stats = StatsRules {
        allow: make_ip_nets(&json.stats.allow).context("stats allow")?,
        deny: make_ip_nets(&json.stats.deny).context("stats deny")?,
    };
    let plugins = load_plugin_configs(registry, &json.plugins).context("rules plugins")?;
    let global = Defaults {
        retry_num: json.retry_num,
        retry_codes,
        timeout,
        parent_selection,
        plugins_shared: json.plugins_shared.unwrap_or_default(),
    };

    let mut rules = Vec::with_capacity(json.rules.len());
    for rule_json in json.rules {
        let name = rule_json.name.clone();
        let rule = make_rule(rule_json, &global, &plugins, registry, caches)
            .with_context(|| format!("rule {name}"))?;
        log::debug!("created remap rule {} from {}", rule.name, rule.from);
        rules.push(Arc::new(rule));
    }
    Ok(RemapRules { rules, plugins, stats })
}

struct Defaults {
    retry_num: Option<usize>,
    retry_codes: Option<Arc<HashSet<u16>>>,
    timeout: Option<Duration>,
    parent_selection: Option<ParentSelection>,
    plugins_shared: HashMap<String, serde_json::Value>,
}

fn make_rule(
    json: RuleJson,
    global: &Defaults,
    global_plugins: &PluginConfigs,
    registry: &PluginRegistry,
    caches: &HashMap<String, Arc<dyn Cache>>,
) -> Result<RemapRule> {
    let plugins = load_plugin_configs(registry, &json.plugins)?.with_fallback(global_plugins);

    let retry_codes = match &json.retry_codes {
        Some(codes) => Some(Arc::new(make_retry_codes(codes)?)),
        None => global.retry_codes.clone(),
    };
    let timeout = match json.timeout_ms {
        Some(ms) => make_timeout(Some(ms))?,
        None => global.timeout,
    };
    let retry_num = json
        .retry_num
        .or(global.retry_num)
        .ok_or_else(|| anyhow!("no retry_num - must be set at rules or rule level"))?;

    let cache_name = json.cache_name.clone().unwrap_or_default();
    let cache = caches
        .get(&cache_name)
        .cloned()
        .ok_or_else(|| anyhow!("cache name '{cache_name}' not found"))?;

    let allow = make_ip_nets(&json.allow).context("allow")?;
    let deny = make_ip_nets(&json.deny).context("deny")?;

    let mut to = Vec::with_capacity(json.to.len());
    for to_json in &json.to {
        to.push(make_to(to_json, retry_num, timeout, retry_codes.as_ref()).with_context(|| format!("to {}", to_json.url))?);
    }

    let parent_selection = match &json.parent_selection {
        Some(raw) => ParentSelection::parse(raw).ok_or_else(|| anyhow!("parent selection invalid: '{raw}'"))?,
        None => global
            .parent_selection
            .ok_or_else(|| anyhow!("no parent_selection - must be set at rules or rule level"))?,
    };
    if to.is_empty() {
        bail!("no to - must have at least one parent");
    }

    let consistent_hash = match parent_selection {
        ParentSelection::ConsistentHash => Some(make_rule_hash(&json.name, &to)),
        ParentSelection::RoundRobin => None,
    };

    Ok(RemapRule {
        name: json.name,
        from: json.from,
        connection_close: json.connection_close,
        query_string: json.query_string,
        concurrent_rule_requests: json.concurrent_rule_requests,
        dscp: json.dscp,
        retry_num,
        parent_selection,
        to,
        allow,
        deny,
        cache_name,
        cache,
        plugins,
        plugins_shared: json.plugins_shared.unwrap_or_else(|| global.plugins_shared.clone()),
        consistent_hash,
    })
}

fn make_to(
    json: &ToJson,
    rule_retry_num: usize,
    rule_timeout: Option<Duration>,
    rule_retry_codes: Option<&Arc<HashSet<u16>>>,
) -> Result<RemapRuleTo> {
    let proxy_url = match &json.proxy_url {
        Some(raw) => Some(raw.parse::<Uri>().with_context(|| format!("proxy_url '{raw}'"))?),
        None => None,
    };
    let timeout = match json.timeout_ms {
        Some(ms) => make_timeout(Some(ms))?,
        None => rule_timeout,
    }
    .ok_or_else(|| anyhow!("no timeout_ms - must be set at rules, rule, or to level"))?;
    let retry_codes = match &json.retry_codes {
        Some(codes) => Arc::new(make_retry_codes(codes)?),
        None => rule_retry_codes
            .cloned()
            .ok_or_else(|| anyhow!("no retry_codes - must be set at rules, rule, or to level"))?,
    };
    Ok(RemapRuleTo {
        url: json.url.clone(),
        weight: json.weight.unwrap_or(1.0),
        retry_num: json.retry_num.unwrap_or(rule_retry_num),
        proxy_url,
        timeout,
        retry_codes,
    })
}

fn make_rule_hash(name: &str, to: &[RemapRuleTo]) -> ConsistentHash<usize> {
    let mut ring = ConsistentHash::new(DEFAULT_REPLICAS);
    for (idx, parent) in to.iter().enumerate() {
        ring.insert(idx, parent.ring_identity(), parent.weight);
    }
    if ring.is_empty() {
        log::error!("rule {name}: consistent hash ring is empty");
    }
    ring
}

fn make_retry_codes(codes: &[u16]) -> Result<HashSet<u16>> {
    let mut set = HashSet::with_capacity(codes.len());
    for &code in codes {
        if !rfc::is_valid_code(code) {
            bail!("retry code invalid: {code}");
        }
        set.insert(code);
    }
    Ok(set)
}

fn make_timeout(ms: Option<i64>) -> Result<Option<Duration>> {
    match ms {
        Some(ms) if ms < 0 => bail!("timeout must be positive: {ms}ms"),
        Some(ms) => Ok(Some(Duration::from_millis(ms as u64))),
        None => Ok(None),
    }
}

pub fn make_ip_nets(raw: &[String]) -> Result<Vec<IpNet>> {
    let mut nets = Vec::with_capacity(raw.len());
    for entry in raw {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let net = entry
            .parse::<IpNet>()
            .with_context(|| format!("error parsing CIDR '{entry}'"))?;
        nets.push(net);
    }
    Ok(nets)
}

fn load_plugin_configs(registry: &PluginRegistry, raw: &HashMap<String, serde_json::Value>) -> Result<PluginConfigs> {
    let mut configs = PluginConfigs::default();
    for (name, value) in raw {
        match registry.load_config(name, value.clone()).with_context(|| format!("plugin {name} config"))? {
            Some(cfg) => configs.insert(name, cfg),
            None => log::debug!("ignoring config for plugin {name}, it is not enabled"),
        }
    }
    Ok(configs)
}
