//! Hooks run at fixed points of the request pipeline.
//!
//! Plugins are compiled in or registered at runtime, and enabled by listing
//! their name in the bootstrap config. Each
//! plugin may decode its own config from the rules file; the decoded value is
//! looked up by plugin name and downcast by the plugin itself.

use std::any::Any;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, StatusCode};

use crate::cache::{Cache, CacheObject, CacheStatus};
use crate::config;
use crate::remap::{ParentRequest, RemapRule, RemappingProducer, StatsRules};

pub mod if_modified_since;
pub mod modify_headers;
pub mod stats;

pub type PluginConfig = Arc<dyn Any + Send + Sync>;
pub type PluginCtor = fn() -> Arc<dyn Plugin>;

/// Decoded plugin configs keyed by plugin name.
#[derive(Clone, Default)]
pub struct PluginConfigs(HashMap<String, PluginConfig>);

impl PluginConfigs {
    pub fn insert(&mut self, name: &str, cfg: PluginConfig) {
        self.0.insert(name.to_string(), cfg);
    }

    pub fn raw(&self, name: &str) -> Option<&PluginConfig> {
        self.0.get(name)
    }

    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.0.get(name).and_then(|cfg| cfg.downcast_ref::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Adds every entry of `global` this map doesn't set itself.
    pub fn with_fallback(mut self, global: &PluginConfigs) -> Self {
        for (name, cfg) in &global.0 {
            self.0.entry(name.clone()).or_insert_with(|| Arc::clone(cfg));
        }
        self
    }
}

/// Per-request plugin state keyed by plugin name. Every request starts from
/// a copy of what the plugins stored at startup.
#[derive(Clone, Default)]
pub struct PluginContext(HashMap<String, PluginConfig>);

impl PluginContext {
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.0.get(name).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn set<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        self.0.insert(name.to_string(), Arc::new(value));
    }

    fn seed(&mut self, name: &str, value: PluginConfig) {
        self.0.insert(name.to_string(), value);
    }
}

/// Response about to be written. Plugins may change any part of it.
#[derive(Debug, Clone)]
pub struct ResponseDraft {
    pub code: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseDraft {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(code: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut draft = Self::new(code);
        draft.headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        draft.body = body.into();
        draft
    }
}

pub struct StartupData<'a> {
    pub rules: &'a [Arc<RemapRule>],
    pub global: &'a PluginConfigs,
}

pub struct OnRequestData<'a> {
    pub req: &'a Parts,
    pub client_ip: Option<IpAddr>,
    pub stats: &'a StatsRules,
    pub caches: &'a HashMap<String, Arc<dyn Cache>>,
}

pub struct BeforeCacheLookupData<'a> {
    pub req: &'a Parts,
    pub producer: &'a mut RemappingProducer,
}

pub struct BeforeParentRequestData<'a> {
    pub req: &'a Parts,
    pub rule: &'a str,
    pub parent: &'a mut ParentRequest,
}

pub struct BeforeRespondData<'a> {
    pub req: &'a Parts,
    pub rule: &'a str,
    pub cache_object: Option<&'a CacheObject>,
    pub draft: &'a mut ResponseDraft,
}

pub struct AfterRespondData<'a> {
    pub req: &'a Parts,
    pub rule: Option<&'a str>,
    pub client_ip: Option<IpAddr>,
    pub code: StatusCode,
    pub cache_status: Option<CacheStatus>,
    pub body_bytes: u64,
    pub elapsed: Duration,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decodes this plugin's section of the rules file. Errors abort the
    /// rules load.
    fn load_config(&self, raw: serde_json::Value) -> Result<PluginConfig> {
        Ok(Arc::new(raw))
    }

    /// Runs once per rule set. A returned value seeds every request's context.
    fn on_startup(&self, _data: &StartupData<'_>) -> Result<Option<PluginConfig>> {
        Ok(None)
    }

    /// Returning a draft answers the request and skips the rest of the pipeline.
    fn on_request(
        &self,
        _cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        _data: &OnRequestData<'_>,
    ) -> Option<ResponseDraft> {
        None
    }

    fn on_before_cache_lookup(
        &self,
        _cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        _data: &mut BeforeCacheLookupData<'_>,
    ) {
    }

    fn on_before_parent_request(
        &self,
        _cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        _data: &mut BeforeParentRequestData<'_>,
    ) {
    }

    fn on_before_respond(
        &self,
        _cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        _data: &mut BeforeRespondData<'_>,
    ) {
    }

    fn on_after_respond(&self, _cfg: Option<&PluginConfig>, _ctx: &mut PluginContext, _data: &AfterRespondData<'_>) {}
}

/// Constructor for a compiled-in plugin.
pub fn builtin(name: &str) -> Option<PluginCtor> {
    match name {
        stats::NAME => Some(stats::new_plugin),
        modify_headers::NAME => Some(modify_headers::new_plugin),
        if_modified_since::NAME => Some(if_modified_since::new_plugin),
        _ => None,
    }
}

fn registry() -> &'static Mutex<HashMap<String, PluginCtor>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, PluginCtor>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Makes `name` available to the bootstrap `plugins` list. Registered
/// plugins shadow built-ins of the same name.
pub fn register(name: &str, ctor: PluginCtor) {
    let mut map = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.insert(name.to_string(), ctor);
}

pub fn lookup(name: &str) -> Option<PluginCtor> {
    let map = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.get(name).copied().or_else(|| builtin(name))
}

/// Enabled plugins in run order.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn from_config(list: &[config::Plugin]) -> Result<Self> {
        let mut entries = Vec::with_capacity(list.len());
        for entry in list {
            let ctor = lookup(&entry.name).ok_or_else(|| anyhow!("plugin {} not registered", entry.name))?;
            entries.push((entry.priority, ctor()));
        }
        Ok(Self::new(entries))
    }

    /// Orders `entries` by priority, keeping the given order for ties.
    pub fn new(mut entries: Vec<(i32, Arc<dyn Plugin>)>) -> Self {
        entries.sort_by_key(|(priority, _)| *priority);
        Self {
            plugins: entries.into_iter().map(|(_, p)| p).collect(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// `None` when no enabled plugin has that name.
    pub fn load_config(&self, name: &str, raw: serde_json::Value) -> Result<Option<PluginConfig>> {
        match self.plugins.iter().find(|p| p.name() == name) {
            Some(plugin) => plugin.load_config(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Runs every startup hook and returns the context each request starts from.
    pub fn on_startup(&self, data: &StartupData<'_>) -> Result<PluginContext> {
        let mut ctx = PluginContext::default();
        for plugin in &self.plugins {
            if let Some(value) = plugin.on_startup(data)? {
                ctx.seed(plugin.name(), value);
            }
        }
        Ok(ctx)
    }

    pub fn on_request(
        &self,
        cfgs: &PluginConfigs,
        ctx: &mut PluginContext,
        data: &OnRequestData<'_>,
    ) -> Option<ResponseDraft> {
        self.plugins
            .iter()
            .find_map(|p| p.on_request(cfgs.raw(p.name()), ctx, data))
    }

    pub fn on_before_cache_lookup(
        &self,
        cfgs: &PluginConfigs,
        ctx: &mut PluginContext,
        data: &mut BeforeCacheLookupData<'_>,
    ) {
        for p in &self.plugins {
            p.on_before_cache_lookup(cfgs.raw(p.name()), ctx, data);
        }
    }

    pub fn on_before_parent_request(
        &self,
        cfgs: &PluginConfigs,
        ctx: &mut PluginContext,
        data: &mut BeforeParentRequestData<'_>,
    ) {
        for p in &self.plugins {
            p.on_before_parent_request(cfgs.raw(p.name()), ctx, data);
        }
    }

    pub fn on_before_respond(&self, cfgs: &PluginConfigs, ctx: &mut PluginContext, data: &mut BeforeRespondData<'_>) {
        for p in &self.plugins {
            p.on_before_respond(cfgs.raw(p.name()), ctx, data);
        }
    }

    pub fn on_after_respond(&self, cfgs: &PluginConfigs, ctx: &mut PluginContext, data: &AfterRespondData<'_>) {
        for p in &self.plugins {
            p.on_after_respond(cfgs.raw(p.name()), ctx, data);
        }
    }
}
