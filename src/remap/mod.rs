use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, HeaderValue, Method, Uri};
use thiserror::Error;

use crate::cache::Cache;
use crate::plugin::PluginConfigs;

pub mod rules;

pub use rules::{
    load_rules, parse_rules, ParentSelection, QueryStringRule, RemapRule, RemapRuleTo, RemapRules, StatsRules,
};

#[derive(Debug, Error)]
pub enum RemapError {
    #[error("remap rule not found")]
    RuleNotFound,
    #[error("IP not allowed")]
    IpNotAllowed,
    #[error("malformed client address: {0}")]
    ClientAddr(String),
    #[error("retry num exceeded")]
    NoMoreRetries,
    #[error("creating parent request: {0}")]
    BuildRequest(String),
}

/// Full URI of an inbound request. Clients send origin-form targets, so the
/// scheme and host are put back in front of the path.
pub fn request_uri(scheme: &str, host: &str, path_and_query: &str) -> String {
    format!("{scheme}://{host}{path_and_query}")
}

/// First `X-Forwarded-For` entry when present, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> Result<IpAddr, RemapError> {
    let Some(value) = headers.get("x-forwarded-for") else {
        return Ok(peer.ip());
    };
    let raw = value
        .to_str()
        .map_err(|_| RemapError::ClientAddr("non-ascii X-Forwarded-For".to_string()))?;
    let first = raw.split(',').next().unwrap_or("").trim();
    if let Ok(ip) = first.parse::<IpAddr>() {
        return Ok(ip);
    }
    first
        .parse::<SocketAddr>()
        .map(|addr| addr.ip())
        .map_err(|_| RemapError::ClientAddr(first.to_string()))
}

/// Host part of a remap URI: everything between `://` and the next `/`.
pub fn fqdn(uri: &str) -> &str {
    let rest = match uri.find("://") {
        Some(pos) => &uri[pos + 3..],
        None => return uri,
    };
    match rest.find('/') {
        Some(slash) => &rest[..slash],
        None => rest,
    }
}

/// The rule set in file order. Matching is a literal prefix scan; the first
/// rule whose `from` prefixes the request URI wins.
pub struct Remapper {
    rules: Vec<Arc<RemapRule>>,
    plugins: PluginConfigs,
    stats: StatsRules,
}

impl Remapper {
    pub fn new(rules: RemapRules) -> Self {
        Self {
            rules: rules.rules,
            plugins: rules.plugins,
            stats: rules.stats,
        }
    }

    pub fn remap(&self, uri: &str) -> Option<&Arc<RemapRule>> {
        self.rules.iter().find(|rule| uri.starts_with(&rule.from))
    }

    pub fn rules(&self) -> &[Arc<RemapRule>] {
        &self.rules
    }

    /// Plugin config given at the top of the rules file.
    pub fn plugin_configs(&self) -> &PluginConfigs {
        &self.plugins
    }

    pub fn stats(&self) -> &StatsRules {
        &self.stats
    }

    /// Matches the request to a rule, checks the client against the rule's
    /// lists and computes the cache key.
    pub fn producer(
        &self,
        method: &Method,
        uri: String,
        path: &str,
        query: Option<&str>,
        client: Result<IpAddr, RemapError>,
    ) -> Result<RemappingProducer, RemapError> {
        let rule = self.remap(&uri).ok_or(RemapError::RuleNotFound)?;
        let ip = client?;
        if !rule.allowed(ip) {
            return Err(RemapError::IpNotAllowed);
        }
        log::debug!("rule {} allows {ip}", rule.name);
        // HEAD shares the GET entry
        let key_method = if method == Method::HEAD { Method::GET } else { method.clone() };
        let cache_key = rule.cache_key(key_method.as_str(), &uri);
        Ok(RemappingProducer {
            old_uri: uri,
            path: path.to_string(),
            query: query.map(str::to_string),
            rule: Arc::clone(rule),
            cache_key,
            failures: 0,
        })
    }
}

/// A request about to be sent to a parent.
#[derive(Debug, Clone)]
pub struct ParentRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Everything one attempt against a parent needs.
#[derive(Clone)]
pub struct Remapping {
    pub request: ParentRequest,
    pub proxy_url: Option<Uri>,
    pub name: String,
    pub cache_key: String,
    pub connection_close: bool,
    pub timeout: Duration,
    pub retry_num: usize,
    pub retry_codes: Arc<HashSet<u16>>,
    pub cache: Arc<dyn Cache>,
}

impl Remapping {
    /// Proxy host recorded on cache objects, empty without a proxy.
    pub fn proxy_host(&self) -> String {
        self.proxy_url
            .as_ref()
            .and_then(|u| u.authority())
            .map(|a| a.as_str().to_string())
            .unwrap_or_default()
    }
}

/// Per-request cursor over a rule's parents.
pub struct RemappingProducer {
    old_uri: String,
    path: String,
    query: Option<String>,
    rule: Arc<RemapRule>,
    cache_key: String,
    failures: usize,
}

impl RemappingProducer {
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn override_cache_key(&mut self, key: String) {
        self.cache_key = key;
    }

    pub fn rule(&self) -> &Arc<RemapRule> {
        &self.rule
    }

    pub fn name(&self) -> &str {
        &self.rule.name
    }

    pub fn connection_close(&self) -> bool {
        self.rule.connection_close
    }

    pub fn dscp(&self) -> u8 {
        self.rule.dscp
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.rule.cache
    }

    pub fn plugin_configs(&self) -> &PluginConfigs {
        &self.rule.plugins
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Builds the next attempt. The bool is whether another attempt may follow
    /// this one. Fails with `NoMoreRetries` once `retry_num + 1` attempts
    /// have been handed out.
    pub fn get_next(&mut self, method: &Method, headers: &HeaderMap) -> Result<(Remapping, bool), RemapError> {
        if self.rule.retry_num < self.failures {
            return Err(RemapError::NoMoreRetries);
        }
        let (new_uri, to) = self
            .rule
            .uri(&self.old_uri, &self.path, self.query.as_deref(), self.failures);
        self.failures += 1;

        let uri = new_uri
            .parse::<Uri>()
            .map_err(|err| RemapError::BuildRequest(format!("{new_uri}: {err}")))?;
        let host = HeaderValue::from_str(fqdn(&new_uri))
            .map_err(|err| RemapError::BuildRequest(format!("host of {new_uri}: {err}")))?;
        let mut headers = headers.clone();
        headers.insert(HOST, host);
        log::debug!("rule {} attempt {} -> {new_uri}", self.rule.name, self.failures);

        let retry_allowed = self.rule.retry_num >= self.failures;
        let remapping = Remapping {
            request: ParentRequest {
                method: method.clone(),
                uri,
                headers,
                body: Bytes::new(),
            },
            proxy_url: to.proxy_url.clone(),
            name: self.rule.name.clone(),
            cache_key: self.cache_key.clone(),
            connection_close: self.rule.connection_close,
            timeout: to.timeout,
            retry_num: self.rule.retry_num,
            retry_codes: Arc::clone(&to.retry_codes),
            cache: Arc::clone(&self.rule.cache),
        };
        Ok((remapping, retry_allowed))
    }
}
