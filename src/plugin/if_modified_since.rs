use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, IF_MODIFIED_SINCE};
use http::StatusCode;

use crate::plugin::{BeforeRespondData, Plugin, PluginConfig, PluginContext};
use crate::rfc;

pub const NAME: &str = "if_modified_since";

/// Answers conditional client requests with an empty 304 when the object
/// hasn't changed since the client's copy.
pub struct IfModifiedSince;

pub fn new_plugin() -> Arc<dyn Plugin> {
    Arc::new(IfModifiedSince)
}

impl Plugin for IfModifiedSince {
    fn name(&self) -> &'static str {
        NAME
    }

    fn on_before_respond(&self, _cfg: Option<&PluginConfig>, _ctx: &mut PluginContext, data: &mut BeforeRespondData<'_>) {
        if data.draft.code != StatusCode::OK {
            return;
        }
        let Some(obj) = data.cache_object else { return };
        let Some(since) = rfc::header_date(&data.req.headers, IF_MODIFIED_SINCE) else {
            return;
        };
        if obj.last_modified > since {
            return;
        }
        data.draft.code = StatusCode::NOT_MODIFIED;
        data.draft.body = Bytes::new();
        data.draft.headers.remove(CONTENT_LENGTH);
    }
}
