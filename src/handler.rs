//! The request pipeline: plugin hooks, rule resolution, cache lookup, the
//! reuse decision and the response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST};
use http::request::Parts;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;

use crate::cache::{self, Cache, CacheObject, CacheStatus, MemCache};
use crate::config::Bootstrap;
use crate::constants;
use crate::fetch::Retrier;
use crate::metrics;
use crate::plugin::{
    AfterRespondData, BeforeCacheLookupData, BeforeParentRequestData, BeforeRespondData, OnRequestData,
    PluginConfigs, PluginContext, PluginRegistry, ResponseDraft, StartupData,
};
use crate::proxy::{Getter, RuleThrottlers};
use crate::remap::{self, RemapError, Remapper, RemappingProducer};
use crate::rfc::{self, CacheControl, Reuse};
use crate::upstream::{self, UpstreamClient};

/// Everything a request needs, built from one config and rules file. Never
/// changed after it is published; a reload builds a new one.
pub struct Snapshot {
    pub remapper: Remapper,
    pub throttlers: RuleThrottlers,
    pub caches: HashMap<String, Arc<dyn Cache>>,
    pub plugins: PluginRegistry,
    pub plugin_context: PluginContext,
    pub upstream: UpstreamClient,
    pub getter: Arc<Getter<Arc<CacheObject>>>,
    /// RFC 7234 strict mode.
    pub strict: bool,
    pub connection_close: bool,
    pub scheme: &'static str,
}

impl Snapshot {
    /// Caches that `previous` already holds are carried over by name.
    pub fn build(cfg: &Bootstrap, rules_path: &Path, previous: Option<&Snapshot>) -> Result<Self> {
        let caches = build_caches(cfg, previous);
        let plugins = PluginRegistry::from_config(&cfg.plugins)?;
        let rules = remap::load_rules(rules_path, &plugins, &caches)?;
        let plugin_context = plugins
            .on_startup(&StartupData {
                rules: &rules.rules,
                global: &rules.plugins,
            })
            .context("plugin startup")?;
        let throttlers = RuleThrottlers::new(&rules.rules, cfg.concurrent_rule_requests);
        let upstream = UpstreamClient::new(&cfg.upstream)?;
        Ok(Self {
            remapper: Remapper::new(rules),
            throttlers,
            caches,
            plugins,
            plugin_context,
            upstream,
            getter: Arc::new(Getter::new()),
            strict: cfg.rfc_compliant,
            connection_close: cfg.server.connection_close,
            scheme: "http",
        })
    }
}

fn build_caches(cfg: &Bootstrap, previous: Option<&Snapshot>) -> HashMap<String, Arc<dyn Cache>> {
    let mut caches: HashMap<String, Arc<dyn Cache>> = HashMap::with_capacity(cfg.caches.len() + 1);
    let mut sizes: Vec<(String, u64)> = vec![(String::new(), cfg.cache_size_bytes)];
    sizes.extend(cfg.caches.iter().map(|(name, c)| (name.clone(), c.size_bytes)));
    for (name, size) in sizes {
        let cache = match previous.and_then(|p| p.caches.get(&name)) {
            Some(existing) => Arc::clone(existing),
            None => {
                log::info!("creating memory cache '{name}' of {size} bytes");
                Arc::new(MemCache::new(size)) as Arc<dyn Cache>
            }
        };
        caches.insert(name, cache);
    }
    caches
}

/// The published snapshot. Requests clone the `Arc` once and use it to the end.
pub struct SnapshotCell {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotCell {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    pub fn store(&self, snapshot: Snapshot) {
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }
}

/// The client connection a request arrived on.
pub struct ConnInfo {
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    /// Duplicate of the client socket, used to mark traffic.
    pub socket: Option<OwnedFd>,
}

impl ConnInfo {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            local: None,
            socket: None,
        }
    }
}

pub async fn serve(snap: Arc<Snapshot>, req: Request<Incoming>, conn: Arc<ConnInfo>) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let request_id = metrics::request_id_from_headers(&parts.headers);
    let client_ip = remap::client_ip(&parts.headers, conn.peer);
    let mut ctx = snap.plugin_context.clone();

    let mut responder = Responder {
        snap: Arc::clone(&snap),
        parts,
        request_id,
        client_ip: client_ip.as_ref().ok().copied(),
        started,
        rule: None,
        cfgs: PluginConfigs::default(),
        connection_close: snap.connection_close,
    };

    let on_request = OnRequestData {
        req: &responder.parts,
        client_ip: responder.client_ip,
        stats: snap.remapper.stats(),
        caches: &snap.caches,
    };
    if let Some(draft) = snap.plugins.on_request(snap.remapper.plugin_configs(), &mut ctx, &on_request) {
        return responder.finish(&mut ctx, draft, None);
    }

    let host = request_host(&responder.parts);
    let path_and_query = responder
        .parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = remap::request_uri(snap.scheme, &host, path_and_query);
    let producer = snap.remapper.producer(
        &responder.parts.method,
        uri,
        responder.parts.uri.path(),
        responder.parts.uri.query(),
        client_ip,
    );
    let mut producer = match producer {
        Ok(p) => p,
        Err(err) => {
            let code = match err {
                RemapError::RuleNotFound => StatusCode::NOT_FOUND,
                RemapError::IpNotAllowed => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            };
            log::debug!("{} {}: {err}", responder.parts.method, responder.parts.uri);
            let draft = ResponseDraft::text(code, code.canonical_reason().unwrap_or(""));
            return responder.finish(&mut ctx, draft, None);
        }
    };
    responder.rule = Some(producer.name().to_string());
    responder.cfgs = producer.plugin_configs().clone();
    responder.connection_close = snap.connection_close || producer.connection_close();

    if producer.dscp() != 0 {
        if let Err(err) = set_dscp(&conn, producer.dscp()) {
            log::debug!("could not set DSCP {} for {}: {err}", producer.dscp(), conn.peer);
        }
    }

    let method = responder.parts.method.clone();
    let cacheable_method = method == Method::GET || method == Method::HEAD;
    let req_body = if cacheable_method {
        Bytes::new()
    } else {
        match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                log::debug!("read request body: {err}");
                let draft = ResponseDraft::text(StatusCode::BAD_REQUEST, "Bad Request");
                return responder.finish(&mut ctx, draft, None);
            }
        }
    };

    snap.plugins.on_before_cache_lookup(
        &responder.cfgs,
        &mut ctx,
        &mut BeforeCacheLookupData {
            req: &responder.parts,
            producer: &mut producer,
        },
    );

    let retrier = Retrier::new(
        Arc::clone(&snap.getter),
        snap.upstream.clone(),
        snap.throttlers.get(producer.name()),
        responder.parts.headers.clone(),
        snap.strict,
    );

    let cached = if cacheable_method {
        cache::get_object(producer.cache().as_ref(), producer.cache_key())
    } else {
        None
    };

    let outcome = match cached {
        None => {
            log::debug!("{} not in cache", producer.cache_key());
            fetch_parent(&responder, &mut ctx, &retrier, &mut producer, req_body, None)
                .await
                .map(|obj| {
                    let status = fetched_status(&obj, CacheStatus::Miss);
                    (obj, status)
                })
        }
        Some(old) => {
            let req_cc = CacheControl::parse(&responder.parts.headers);
            let verdict = rfc::can_reuse_stored(
                &responder.parts.headers,
                &old.resp_headers,
                &req_cc,
                &old.resp_cache_control,
                &old.req_headers,
                old.req_time,
                old.req_resp_time,
                snap.strict,
            );
            log::debug!("{} cached, reuse {}", producer.cache_key(), verdict.as_str());
            match verdict {
                Reuse::Can => {
                    old.record_hit();
                    Ok((old, CacheStatus::Hit))
                }
                Reuse::Cannot => fetch_parent(&responder, &mut ctx, &retrier, &mut producer, req_body, None)
                    .await
                    .map(|obj| {
                        let status = fetched_status(&obj, CacheStatus::Miss);
                        (obj, status)
                    }),
                Reuse::MustRevalidate => {
                    fetch_parent(&responder, &mut ctx, &retrier, &mut producer, req_body, Some(Arc::clone(&old)))
                        .await
                        .map(|obj| {
                            let status = revalidated_status(&obj);
                            (obj, status)
                        })
                }
                Reuse::MustRevalidateCanStale => {
                    let fetched =
                        fetch_parent(&responder, &mut ctx, &retrier, &mut producer, req_body, Some(Arc::clone(&old))).await;
                    match fetched {
                        Ok(obj) if !is_failed_fetch(&producer, &obj) => {
                            let status = revalidated_status(&obj);
                            Ok((obj, status))
                        }
                        Ok(obj) => {
                            log::warn!(
                                "revalidating {} got {}, serving stale",
                                producer.cache_key(),
                                obj.code
                            );
                            Ok((old, CacheStatus::Stale))
                        }
                        Err(err) => {
                            log::error!("revalidating {} failed, serving stale: {err:#}", producer.cache_key());
                            Ok((old, CacheStatus::Stale))
                        }
                    }
                }
            }
        }
    };

    let (obj, status) = match outcome {
        Ok(found) => found,
        Err(err) => {
            log::error!("retrying get for {}: {err:#}", producer.cache_key());
            let draft = ResponseDraft::text(StatusCode::BAD_GATEWAY, "Bad Gateway");
            return responder.finish(&mut ctx, draft, Some(CacheStatus::ConnectFail));
        }
    };

    let mut draft = ResponseDraft {
        code: StatusCode::from_u16(obj.code).unwrap_or(StatusCode::BAD_GATEWAY),
        headers: obj.resp_headers.clone(),
        body: obj.body.clone(),
    };
    let rule = producer.name().to_string();
    snap.plugins.on_before_respond(
        &responder.cfgs,
        &mut ctx,
        &mut BeforeRespondData {
            req: &responder.parts,
            rule: &rule,
            cache_object: Some(obj.as_ref()),
            draft: &mut draft,
        },
    );
    responder.finish(&mut ctx, draft, Some(status))
}

async fn fetch_parent(
    responder: &Responder,
    ctx: &mut PluginContext,
    retrier: &Retrier,
    producer: &mut RemappingProducer,
    body: Bytes,
    revalidate: Option<Arc<CacheObject>>,
) -> Result<Arc<CacheObject>> {
    let snap = &responder.snap;
    let rule = producer.name().to_string();
    let method = responder.parts.method.clone();
    retrier
        .get(producer, &method, body, revalidate, |parent| {
            snap.plugins.on_before_parent_request(
                &responder.cfgs,
                ctx,
                &mut BeforeParentRequestData {
                    req: &responder.parts,
                    rule: &rule,
                    parent,
                },
            )
        })
        .await
}

fn fetched_status(obj: &CacheObject, otherwise: CacheStatus) -> CacheStatus {
    if obj.connect_failed {
        CacheStatus::ConnectFail
    } else {
        otherwise
    }
}

fn revalidated_status(obj: &CacheObject) -> CacheStatus {
    if obj.origin_code == 304 {
        fetched_status(obj, CacheStatus::Revalidated)
    } else {
        fetched_status(obj, CacheStatus::Miss)
    }
}

fn is_failed_fetch(producer: &RemappingProducer, obj: &CacheObject) -> bool {
    obj.connect_failed || producer.rule().to.iter().any(|to| to.retry_codes.contains(&obj.code))
}

fn request_host(parts: &Parts) -> String {
    parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_string()))
        .unwrap_or_default()
}

struct Responder {
    snap: Arc<Snapshot>,
    parts: Parts,
    request_id: String,
    client_ip: Option<std::net::IpAddr>,
    started: Instant,
    rule: Option<String>,
    cfgs: PluginConfigs,
    connection_close: bool,
}

impl Responder {
    fn finish(self, ctx: &mut PluginContext, mut draft: ResponseDraft, status: Option<CacheStatus>) -> Response<Full<Bytes>> {
        upstream::strip_hop_by_hop(&mut draft.headers);
        let body_len = draft.body.len() as u64;
        let body = if self.parts.method == Method::HEAD {
            if !draft.headers.contains_key(CONTENT_LENGTH) {
                draft.headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
            }
            Bytes::new()
        } else {
            draft.headers.remove(CONTENT_LENGTH);
            draft.body
        };
        if self.connection_close {
            draft.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        if let Some(status) = status {
            draft.headers.insert(
                constants::PROTOCOL_CACHE_STATUS_KEY,
                HeaderValue::from_static(status.as_str()),
            );
        }
        if let Ok(v) = HeaderValue::from_str(&self.request_id) {
            draft.headers.insert(constants::PROTOCOL_REQUEST_ID_KEY, v);
        }

        let sent = body.len() as u64;
        let rule = self.rule.as_deref().unwrap_or(metrics::NO_RULE);
        metrics::record_request(rule, draft.code);
        if let Some(status) = status {
            metrics::record_cache(rule, status);
        }
        metrics::record_bytes_out(rule, sent);

        let cfgs = if self.rule.is_some() {
            &self.cfgs
        } else {
            self.snap.remapper.plugin_configs()
        };
        self.snap.plugins.on_after_respond(
            cfgs,
            ctx,
            &AfterRespondData {
                req: &self.parts,
                rule: self.rule.as_deref(),
                client_ip: self.client_ip,
                code: draft.code,
                cache_status: status,
                body_bytes: sent,
                elapsed: self.started.elapsed(),
            },
        );
        log::info!(
            "{} {} {} {} {} {}B {}ms",
            self.client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string()),
            self.parts.method,
            self.parts.uri,
            draft.code.as_u16(),
            status.map(|s| s.as_str()).unwrap_or("-"),
            sent,
            self.started.elapsed().as_millis()
        );

        let mut resp = Response::new(Full::new(body));
        *resp.status_mut() = draft.code;
        *resp.headers_mut() = draft.headers;
        resp
    }
}

#[cfg(target_os = "linux")]
fn set_dscp(conn: &ConnInfo, dscp: u8) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    let Some(socket) = conn.socket.as_ref() else {
        return Ok(());
    };
    let tos = i32::from(dscp) << 2;
    match conn.local.unwrap_or(conn.peer) {
        SocketAddr::V4(_) => setsockopt(socket, sockopt::IpTos, &tos)?,
        SocketAddr::V6(_) => setsockopt(socket, sockopt::Ipv6TClass, &tos)?,
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_dscp(_conn: &ConnInfo, _dscp: u8) -> Result<()> {
    Ok(())
}
