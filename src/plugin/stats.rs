use std::sync::Arc;

use http::{HeaderValue, Method, StatusCode};

use crate::constants;
use crate::metrics;
use crate::plugin::{OnRequestData, Plugin, PluginConfig, PluginContext, ResponseDraft};

pub const NAME: &str = "stats";

/// Serves the metrics text on the stats path to clients the rules file's
/// `stats` lists admit.
pub struct StatsPlugin;

pub fn new_plugin() -> Arc<dyn Plugin> {
    Arc::new(StatsPlugin)
}

impl Plugin for StatsPlugin {
    fn name(&self) -> &'static str {
        NAME
    }

    fn on_request(
        &self,
        _cfg: Option<&PluginConfig>,
        _ctx: &mut PluginContext,
        data: &OnRequestData<'_>,
    ) -> Option<ResponseDraft> {
        if data.req.uri.path() != constants::STATS_PATH {
            return None;
        }
        if data.req.method != Method::GET && data.req.method != Method::HEAD {
            return Some(ResponseDraft::text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
        }
        let allowed = data.client_ip.map(|ip| data.stats.allowed(ip)).unwrap_or(false);
        if !allowed {
            log::debug!("stats request from {:?} denied", data.client_ip);
            return Some(ResponseDraft::text(StatusCode::FORBIDDEN, "forbidden"));
        }
        for (name, cache) in data.caches {
            metrics::observe_cache_size(name, cache.size());
        }
        let mut draft = ResponseDraft::text(StatusCode::OK, metrics::render());
        draft.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        Some(draft)
    }
}
