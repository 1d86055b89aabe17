//! HTTP caching rules from RFC 7234: what may be stored, and whether a stored
//! response may be reused for a new request.

use std::collections::HashMap;
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use http::header::{AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, LAST_MODIFIED, PRAGMA, VARY};
use http::{HeaderMap, HeaderName, Method};

/// Codes this cache understands (RFC 7234 section 3). Retry codes in the rules
/// file must come from this table.
const VALID_CODES: &[u16] = &[
    200, 201, 202, 203, 204, 205, 206, 207, 208, 226, //
    300, 301, 302, 303, 304, 305, 306, 307, 308, //
    400, 401, 402, 403, 404, 405, 406, 407, 408, 409, 410, 411, 412, 413, 414, 415, 416, 417, 418,
    421, 422, 423, 424, 428, 429, 431, 451, //
    500, 501, 502, 503, 504, 505, 506, 507, 508, 510, 511,
];

const DEFAULT_CACHEABLE_CODES: &[u16] = &[200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

pub fn is_valid_code(code: u16) -> bool {
    VALID_CODES.contains(&code)
}

pub fn code_default_cacheable(code: u16) -> bool {
    DEFAULT_CACHEABLE_CODES.contains(&code)
}

/// Outcome of checking a stored response against a new request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reuse {
    /// Serve the stored response without contacting the origin.
    Can,
    /// The stored response is unusable; fetch a new one.
    Cannot,
    /// Ask the origin whether the stored response is still valid.
    MustRevalidate,
    /// Revalidate, but if the origin can't be reached the stale response may be served.
    MustRevalidateCanStale,
}

impl Reuse {
    pub fn as_str(self) -> &'static str {
        match self {
            Reuse::Can => "can",
            Reuse::Cannot => "cannot",
            Reuse::MustRevalidate => "must-revalidate",
            Reuse::MustRevalidateCanStale => "must-revalidate-can-stale",
        }
    }
}

/// Parsed `Cache-Control` directives. Names are lowercased, values keep their
/// case with surrounding quotes removed. Valueless directives map to "".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheControl(HashMap<String, String>);

impl CacheControl {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut directives = HashMap::new();
        for value in headers.get_all(CACHE_CONTROL).iter() {
            let Ok(value) = value.to_str() else { continue };
            for part in value.split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let (name, val) = match part.split_once('=') {
                    Some((name, val)) => (name.trim(), val.trim().trim_matches('"')),
                    None => (part, ""),
                };
                directives.insert(name.to_ascii_lowercase(), val.to_string());
            }
        }
        Self(directives)
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Value of a delta-seconds directive such as `max-age`. Missing or
    /// malformed values are `None`.
    pub fn delta_seconds(&self, name: &str) -> Option<Duration> {
        let raw = self.get(name)?;
        let secs = raw.parse::<u32>().ok()?;
        Some(Duration::seconds(i64::from(secs)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parses an HTTP date in any of the three formats HTTP/1.1 allows
/// (RFC 1123, RFC 850, asctime).
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(raw.trim()).ok().map(DateTime::<Utc>::from)
}

pub fn header_date(headers: &HeaderMap, name: HeaderName) -> Option<DateTime<Utc>> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(parse_http_date)
}

/// Formats `t` as an RFC 1123 date in GMT.
pub fn format_http_date(t: DateTime<Utc>) -> String {
    httpdate::fmt_http_date(SystemTime::from(t))
}

/// Whether a response may be stored (RFC 7234 section 3). With `strict` off,
/// request directives that would prevent storage are ignored to protect origins.
pub fn can_cache(
    method: &Method,
    req_headers: &HeaderMap,
    code: u16,
    resp_headers: &HeaderMap,
    strict: bool,
) -> bool {
    if method != Method::GET {
        return false;
    }
    let req_cc = CacheControl::parse(req_headers);
    let resp_cc = CacheControl::parse(resp_headers);
    can_store_response(code, resp_headers, &req_cc, &resp_cc, strict)
        && can_store_authenticated(req_headers, &req_cc, &resp_cc)
}

fn can_store_response(
    code: u16,
    resp_headers: &HeaderMap,
    req_cc: &CacheControl,
    resp_cc: &CacheControl,
    strict: bool,
) -> bool {
    if strict && req_cc.has("no-store") {
        log::debug!("can_cache false: request has no-store");
        return false;
    }
    for directive in ["no-store", "no-cache", "private"] {
        if resp_cc.has(directive) {
            log::debug!("can_cache false: response has {directive}");
            return false;
        }
    }
    if resp_headers.contains_key(EXPIRES) || resp_cc.has("max-age") || resp_cc.has("s-maxage") {
        return true;
    }
    if code_default_cacheable(code) {
        return true;
    }
    log::debug!("can_cache false: no expires, max-age or s-maxage and code {code} is not cacheable by default");
    false
}

// RFC 7234 section 3.2
fn can_store_authenticated(req_headers: &HeaderMap, req_cc: &CacheControl, resp_cc: &CacheControl) -> bool {
    if !req_headers.contains_key(AUTHORIZATION) && !req_cc.has("authorization") {
        return true;
    }
    if resp_cc.has("must-revalidate") || resp_cc.has("public") || resp_cc.has("s-maxage") {
        return true;
    }
    log::debug!("can_cache false: authorized request without must-revalidate, public or s-maxage");
    false
}

/// Decides how a stored response may be used for the current request
/// (RFC 7234 section 4). `resp_req_time` is when the stored response was
/// requested from the origin and `resp_resp_time` when it arrived.
#[allow(clippy::too_many_arguments)]
pub fn can_reuse_stored(
    req_headers: &HeaderMap,
    resp_headers: &HeaderMap,
    req_cc: &CacheControl,
    resp_cc: &CacheControl,
    resp_req_headers: &HeaderMap,
    resp_req_time: DateTime<Utc>,
    resp_resp_time: DateTime<Utc>,
    strict: bool,
) -> Reuse {
    if !selected_headers_match(req_headers, resp_headers, resp_req_headers) {
        log::debug!("reuse cannot: vary-selected headers differ");
        return Reuse::Cannot;
    }

    let now = Utc::now();
    let lifetime = freshness_lifetime(resp_headers, resp_cc, resp_resp_time);
    let age = current_age(resp_headers, resp_req_time, resp_resp_time, now);
    if lifetime <= age {
        let verdict = allowed_stale(req_cc, resp_cc, lifetime, age, strict);
        log::debug!("reuse stale: lifetime {lifetime} age {age} => {}", verdict.as_str());
        return verdict;
    }

    if strict && has_pragma_no_cache(req_headers) {
        log::debug!("reuse must-revalidate: pragma no-cache");
        return Reuse::MustRevalidate;
    }
    if strict && req_cc.has("no-cache") {
        log::debug!("reuse cannot: request no-cache");
        return Reuse::Cannot;
    }
    if resp_cc.has("no-cache") {
        log::debug!("reuse cannot: response no-cache");
        return Reuse::Cannot;
    }
    if strict && !in_min_fresh(req_cc, lifetime, age) {
        return Reuse::MustRevalidate;
    }
    Reuse::Can
}

// RFC 7234 section 4.2.4
fn allowed_stale(
    req_cc: &CacheControl,
    resp_cc: &CacheControl,
    lifetime: Duration,
    age: Duration,
    strict: bool,
) -> Reuse {
    if resp_cc.has("must-revalidate") || resp_cc.has("proxy-revalidate") {
        return Reuse::MustRevalidate;
    }
    if strict && req_cc.has("max-age") && !req_cc.has("max-stale") {
        return Reuse::MustRevalidateCanStale;
    }
    if resp_cc.has("no-cache") || resp_cc.has("no-store") {
        return Reuse::Cannot;
    }
    if !in_max_stale(resp_cc, lifetime, age) {
        return Reuse::MustRevalidate;
    }
    Reuse::MustRevalidateCanStale
}

/// `max-stale` is read from the stored response's directives. A response
/// without one is always within budget.
fn in_max_stale(resp_cc: &CacheControl, lifetime: Duration, age: Duration) -> bool {
    match resp_cc.delta_seconds("max-stale") {
        Some(max_stale) => max_stale > age - lifetime,
        None => true,
    }
}

fn in_min_fresh(req_cc: &CacheControl, lifetime: Duration, age: Duration) -> bool {
    match req_cc.delta_seconds("min-fresh") {
        Some(min_fresh) => min_fresh < lifetime - age,
        None => true,
    }
}

/// Compares the request headers named by the stored response's `Vary`
/// against the request that produced it. `Vary: *` never matches.
fn selected_headers_match(req_headers: &HeaderMap, resp_headers: &HeaderMap, resp_req_headers: &HeaderMap) -> bool {
    let mut names = Vec::new();
    for value in resp_headers.get_all(VARY).iter() {
        let Ok(value) = value.to_str() else { return false };
        for name in value.split(',') {
            let name = name.trim();
            if !name.is_empty() {
                names.push(name.to_ascii_lowercase());
            }
        }
    }
    for name in &names {
        if name == "*" {
            return false;
        }
        let current: Vec<&[u8]> = req_headers.get_all(name.as_str()).iter().map(|v| v.as_bytes()).collect();
        let stored: Vec<&[u8]> = resp_req_headers.get_all(name.as_str()).iter().map(|v| v.as_bytes()).collect();
        if current != stored {
            return false;
        }
    }
    true
}

/// `Pragma: no-cache` only counts when the request has no `Cache-Control`,
/// and only as the first pragma (RFC 7234 section 5.4).
pub fn has_pragma_no_cache(req_headers: &HeaderMap) -> bool {
    if req_headers.contains_key(CACHE_CONTROL) {
        return false;
    }
    req_headers
        .get(PRAGMA)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().starts_with("no-cache"))
        .unwrap_or(false)
}

/// RFC 7234 section 4.2.1. `resp_time` stands in for a missing `Date`.
pub fn freshness_lifetime(resp_headers: &HeaderMap, resp_cc: &CacheControl, resp_time: DateTime<Utc>) -> Duration {
    if let Some(d) = resp_cc.delta_seconds("s-maxage") {
        return d;
    }
    if let Some(d) = resp_cc.delta_seconds("max-age") {
        return d;
    }
    let date = header_date(resp_headers, DATE).unwrap_or(resp_time);
    if resp_headers.contains_key(EXPIRES) {
        // an unparseable Expires means already expired
        return match header_date(resp_headers, EXPIRES) {
            Some(expires) => expires - date,
            None => Duration::zero(),
        };
    }
    heuristic_freshness(resp_headers, date)
}

// RFC 7234 section 4.2.2
fn heuristic_freshness(resp_headers: &HeaderMap, date: DateTime<Utc>) -> Duration {
    let day = Duration::days(1);
    match header_date(resp_headers, LAST_MODIFIED) {
        Some(last_modified) if last_modified <= date => std::cmp::min((date - last_modified) / 10, day),
        _ => day,
    }
}

/// RFC 7234 section 4.2.3 age as of `now`.
pub fn current_age(
    resp_headers: &HeaderMap,
    req_time: DateTime<Utc>,
    resp_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Duration {
    let date = header_date(resp_headers, DATE).unwrap_or(resp_time);
    let apparent_age = std::cmp::max(Duration::zero(), resp_time - date);
    let age_value = resp_headers
        .get(http::header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok())
        .map(|secs| Duration::seconds(i64::from(secs)))
        .unwrap_or_else(Duration::zero);
    let response_delay = resp_time - req_time;
    let corrected_age_value = age_value + response_delay;
    let corrected_initial_age = std::cmp::max(apparent_age, corrected_age_value);
    let resident_time = now - resp_time;
    corrected_initial_age + resident_time
}
