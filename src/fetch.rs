//! Origin fetching: the retry loop over a rule's parents and the single
//! round trip that stores what it gets.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::FutureExt;
use http::header::{DATE, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{HeaderMap, HeaderValue, Method};

use crate::cache::CacheObject;
use crate::constants::CODE_CONNECT_FAILURE;
use crate::metrics;
use crate::proxy::{CanUseFn, FetchFn, Getter, Throttler};
use crate::remap::{ParentRequest, RemapError, Remapping, RemappingProducer};
use crate::rfc::{self, CacheControl, Reuse};
use crate::upstream::UpstreamClient;

/// Whether `obj` should send the request on to the next parent.
pub fn is_failure(obj: &CacheObject, retry_codes: &std::collections::HashSet<u16>) -> bool {
    obj.connect_failed || obj.code == CODE_CONNECT_FAILURE || retry_codes.contains(&obj.code)
}

/// Asks the producer for attempts until one doesn't fail. `prepare` sees
/// each parent request before it is sent. `attempt` is told whether it is
/// the last one allowed, in which case a failure response may be cached.
/// Once the producer runs out, the last object is returned as-is.
pub async fn retrying_get<P, F, Fut>(
    producer: &mut RemappingProducer,
    method: &Method,
    headers: &HeaderMap,
    mut prepare: P,
    mut attempt: F,
) -> Result<Arc<CacheObject>>
where
    P: FnMut(&mut ParentRequest),
    F: FnMut(Remapping, bool) -> Fut,
    Fut: Future<Output = Arc<CacheObject>>,
{
    let mut last: Option<Arc<CacheObject>> = None;
    loop {
        let (mut remapping, retry_allowed) = match producer.get_next(method, headers) {
            Ok(next) => next,
            Err(RemapError::NoMoreRetries) => {
                return last.ok_or_else(|| anyhow!("remapping producer allows no requests"));
            }
            Err(err) => return Err(err.into()),
        };
        prepare(&mut remapping.request);
        let retry_codes = Arc::clone(&remapping.retry_codes);
        let obj = attempt(remapping, !retry_allowed).await;
        if !is_failure(&obj, &retry_codes) {
            return Ok(obj);
        }
        log::debug!(
            "rule {} attempt {} failed with {}, trying next parent",
            producer.name(),
            producer.failures(),
            obj.code
        );
        last = Some(obj);
    }
}

/// One round trip to the parent in `remapping`, run under `throttler`.
/// Transport errors and timeouts become an uncached connect-failure object.
/// Responses with a retry code are only stored when `cache_failures` is set.
/// A `304` answering a revalidation refreshes `revalidate` instead of
/// replacing it. Cacheable results are stored under the remapping's key;
/// the object is returned whether it was stored or not.
pub async fn get_and_cache(
    upstream: &UpstreamClient,
    throttler: &Throttler,
    remapping: &Remapping,
    req_headers: &HeaderMap,
    revalidate: Option<&CacheObject>,
    strict: bool,
    cache_failures: bool,
) -> Arc<CacheObject> {
    throttler
        .throttle(fetch_and_store(upstream, remapping, req_headers, revalidate, strict, cache_failures))
        .await
}

async fn fetch_and_store(
    upstream: &UpstreamClient,
    remapping: &Remapping,
    req_headers: &HeaderMap,
    revalidate: Option<&CacheObject>,
    strict: bool,
    cache_failures: bool,
) -> Arc<CacheObject> {
    let req = &remapping.request;
    let proxy_host = remapping.proxy_host();
    let req_time = Utc::now();

    let round_trip = upstream.round_trip(req, remapping.proxy_url.as_ref());
    let result = if remapping.timeout.is_zero() {
        round_trip.await
    } else {
        match tokio::time::timeout(remapping.timeout, round_trip).await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("timed out after {:?}", remapping.timeout)),
        }
    };
    let req_resp_time = Utc::now();

    let fetched = match result {
        Ok(fetched) => fetched,
        Err(err) => {
            log::error!(
                "parent error for {} cache key {} rule {} proxy '{}': {err:#}",
                req.uri,
                remapping.cache_key,
                remapping.name,
                proxy_host
            );
            metrics::record_origin(&remapping.name, CODE_CONNECT_FAILURE);
            return Arc::new(CacheObject::connect_failure(
                req_headers.clone(),
                proxy_host,
                req_time,
                req_resp_time,
            ));
        }
    };
    let code = fetched.status.as_u16();
    metrics::record_origin(&remapping.name, code);
    log::debug!("{} {} returned {code}", req.method, req.uri);

    if remapping.retry_codes.contains(&code) && !cache_failures {
        return Arc::new(CacheObject::new(
            req_headers.clone(),
            fetched.body,
            code,
            code,
            proxy_host,
            fetched.headers,
            req_time,
            req_resp_time,
            req_resp_time,
            req_resp_time,
        ));
    }

    let resp_resp_time = match rfc::header_date(&fetched.headers, DATE) {
        Some(date) => date,
        None => {
            log::warn!("{} returned no Date header - RFC violation", req.uri);
            req_resp_time
        }
    };
    let last_modified = rfc::header_date(&fetched.headers, LAST_MODIFIED).unwrap_or(resp_resp_time);

    let obj = match revalidate {
        Some(old) if code == 304 => {
            log::debug!("{} not modified, refreshing {}", req.uri, remapping.cache_key);
            old.revalidated(
                code,
                fetched.headers.get(DATE),
                proxy_host,
                req_time,
                req_resp_time,
                resp_resp_time,
            )
        }
        _ => CacheObject::new(
            req_headers.clone(),
            fetched.body,
            code,
            code,
            proxy_host,
            fetched.headers,
            req_time,
            req_resp_time,
            resp_resp_time,
            last_modified,
        ),
    };
    let obj = Arc::new(obj);

    if rfc::can_cache(&req.method, req_headers, obj.code, &obj.resp_headers, strict) {
        log::debug!("caching {} ({} bytes)", remapping.cache_key, obj.size);
        remapping.cache.add_size(&remapping.cache_key, obj.clone(), obj.size);
    }
    obj
}

/// Whether an object fetched for someone else may serve a request with
/// `req_headers`.
pub fn can_reuse(req_headers: &HeaderMap, req_cc: &CacheControl, obj: &CacheObject, strict: bool) -> bool {
    let verdict = rfc::can_reuse_stored(
        req_headers,
        &obj.resp_headers,
        req_cc,
        &obj.resp_cache_control,
        &obj.req_headers,
        obj.req_time,
        obj.req_resp_time,
        strict,
    );
    matches!(verdict, Reuse::Can | Reuse::MustRevalidate)
}

/// Per-request fetch path: retries over the producer's parents, coalescing
/// identical GETs through the shared getter.
pub struct Retrier {
    getter: Arc<Getter<Arc<CacheObject>>>,
    upstream: UpstreamClient,
    throttler: Throttler,
    req_headers: HeaderMap,
    req_cc: CacheControl,
    strict: bool,
}

impl Retrier {
    pub fn new(
        getter: Arc<Getter<Arc<CacheObject>>>,
        upstream: UpstreamClient,
        throttler: Throttler,
        req_headers: HeaderMap,
        strict: bool,
    ) -> Self {
        let req_cc = CacheControl::parse(&req_headers);
        Self {
            getter,
            upstream,
            throttler,
            req_headers,
            req_cc,
            strict,
        }
    }

    /// Fetches for the current request. With `revalidate` set the parent
    /// request is conditional on that object's response time.
    pub async fn get<P>(
        &self,
        producer: &mut RemappingProducer,
        method: &Method,
        body: bytes::Bytes,
        revalidate: Option<Arc<CacheObject>>,
        mut prepare: P,
    ) -> Result<Arc<CacheObject>>
    where
        P: FnMut(&mut ParentRequest),
    {
        // HEAD is fetched as GET so the body can be stored
        let parent_method = if method == Method::HEAD { Method::GET } else { method.clone() };
        let mut headers = self.req_headers.clone();
        headers.remove(IF_MODIFIED_SINCE);
        headers.remove(IF_NONE_MATCH);
        if let Some(old) = revalidate.as_ref() {
            if let Ok(v) = HeaderValue::from_str(&rfc::format_http_date(old.resp_resp_time)) {
                headers.insert(IF_MODIFIED_SINCE, v);
            }
        }
        let single_flight = parent_method == Method::GET;
        retrying_get(
            producer,
            &parent_method,
            &headers,
            |req| {
                if !single_flight {
                    req.body = body.clone();
                }
                prepare(req)
            },
            |remapping, last| self.attempt(remapping, revalidate.clone(), single_flight, last),
        )
        .await
    }

    async fn attempt(
        &self,
        remapping: Remapping,
        revalidate: Option<Arc<CacheObject>>,
        single_flight: bool,
        cache_failures: bool,
    ) -> Arc<CacheObject> {
        if !single_flight {
            let obj = get_and_cache(
                &self.upstream,
                &self.throttler,
                &remapping,
                &self.req_headers,
                None,
                self.strict,
                cache_failures,
            )
            .await;
            return obj;
        }

        let key = remapping.cache_key.clone();
        let name = remapping.name.clone();
        let proxy_host = remapping.proxy_host();
        let upstream = self.upstream.clone();
        let throttler = self.throttler.clone();
        let req_headers = self.req_headers.clone();
        let strict = self.strict;
        let remapping = Arc::new(remapping);
        let fetch: FetchFn<Arc<CacheObject>> = Arc::new(move || {
            let upstream = upstream.clone();
            let throttler = throttler.clone();
            let remapping = Arc::clone(&remapping);
            let req_headers = req_headers.clone();
            let revalidate = revalidate.clone();
            async move {
                get_and_cache(
                    &upstream,
                    &throttler,
                    &remapping,
                    &req_headers,
                    revalidate.as_deref(),
                    strict,
                    cache_failures,
                )
                .await
            }
            .boxed()
        });

        let waiter_headers = self.req_headers.clone();
        let waiter_cc = self.req_cc.clone();
        let can_use: CanUseFn<Arc<CacheObject>> =
            Box::new(move |obj: &Arc<CacheObject>| can_reuse(&waiter_headers, &waiter_cc, obj, strict));

        let req_time = Utc::now();
        match self.getter.get(&key, fetch, can_use).await {
            Ok(obj) => obj,
            Err(err) => {
                log::error!("rule {name}: {err:#}");
                Arc::new(CacheObject::connect_failure(
                    self.req_headers.clone(),
                    proxy_host,
                    req_time,
                    Utc::now(),
                ))
            }
        }
    }
}
