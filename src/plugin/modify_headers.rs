use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

use crate::plugin::{BeforeParentRequestData, BeforeRespondData, Plugin, PluginConfig, PluginContext};

pub const NAME: &str = "modify_headers";

#[derive(Debug, Deserialize, Default)]
struct EditsJson {
    #[serde(default)]
    set: BTreeMap<String, String>,
    #[serde(default)]
    drop: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfigJson {
    #[serde(default)]
    parent_request: EditsJson,
    #[serde(default)]
    response: EditsJson,
}

#[derive(Debug, Default, Clone)]
pub struct HeaderEdits {
    pub set: Vec<(HeaderName, HeaderValue)>,
    pub drop: Vec<HeaderName>,
}

impl HeaderEdits {
    fn parse(json: EditsJson) -> Result<Self> {
        let mut set = Vec::with_capacity(json.set.len());
        for (name, value) in json.set {
            let header = HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("header name '{name}'"))?;
            let value = HeaderValue::from_str(&value).with_context(|| format!("value of header '{name}'"))?;
            set.push((header, value));
        }
        let mut drop = Vec::with_capacity(json.drop.len());
        for name in json.drop {
            drop.push(HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("header name '{name}'"))?);
        }
        Ok(Self { set, drop })
    }

    /// Drops first, then sets, so a header listed in both ends up set.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.drop {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ModifyHeadersConfig {
    pub parent_request: HeaderEdits,
    pub response: HeaderEdits,
}

/// Rewrites headers on the way to the parent and on the way to the client.
pub struct ModifyHeaders;

pub fn new_plugin() -> Arc<dyn Plugin> {
    Arc::new(ModifyHeaders)
}

fn config(cfg: Option<&PluginConfig>) -> Option<&ModifyHeadersConfig> {
    cfg.and_then(|c| c.downcast_ref::<ModifyHeadersConfig>())
}

impl Plugin for ModifyHeaders {
    fn name(&self) -> &'static str {
        NAME
    }

    fn load_config(&self, raw: serde_json::Value) -> Result<PluginConfig> {
        let json: ConfigJson = serde_json::from_value(raw).context("decode modify_headers config")?;
        Ok(Arc::new(ModifyHeadersConfig {
            parent_request: HeaderEdits::parse(json.parent_request).context("parent_request")?,
            response: HeaderEdits::parse(json.response).context("response")?,
        }))
    }

    fn on_before_parent_request(
        &self,
        cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        data: &mut BeforeParentRequestData<'_>,
    ) {
        if let Some(cfg) = config(cfg) {
            cfg.parent_request.apply(&mut data.parent.headers);
        }
    }

    fn on_before_respond(&self, cfg: Option<&PluginConfig>, _ctx: &mut PluginContext, data: &mut BeforeRespondData<'_>) {
        if let Some(cfg) = config(cfg) {
            cfg.response.apply(&mut data.draft.headers);
        }
    }
}
