use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cache::CacheStatus;
use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
    registry().register(Box::new(counter.clone())).unwrap();
    counter
}

fn requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("grove_requests_total", "Client requests by rule and status class", &["rule", "class"]))
}

fn cache_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("grove_cache_total", "Cache outcomes by rule", &["rule", "status"]))
}

fn origin_requests_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        counter_vec("grove_origin_requests_total", "Parent round trips by rule and code", &["rule", "code"])
    })
}

fn bytes_out_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("grove_bytes_out_total", "Body bytes sent to clients", &["rule"]))
}

fn cache_size_bytes() -> &'static IntGaugeVec {
    static METRIC: OnceLock<IntGaugeVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGaugeVec::new(Opts::new("grove_cache_size_bytes", "Bytes held per cache"), &["cache"]).unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

/// Requests that never matched a rule are counted under this name.
pub const NO_RULE: &str = "-";

pub fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

pub fn record_request(rule: &str, status: StatusCode) {
    requests_total().with_label_values(&[rule, status_class(status)]).inc();
}

pub fn record_cache(rule: &str, status: CacheStatus) {
    cache_total().with_label_values(&[rule, status.as_str()]).inc();
}

pub fn record_origin(rule: &str, code: u16) {
    let code = code.to_string();
    origin_requests_total().with_label_values(&[rule, code.as_str()]).inc();
}

pub fn record_bytes_out(rule: &str, bytes: u64) {
    bytes_out_total().with_label_values(&[rule]).inc_by(bytes);
}

pub fn observe_cache_size(cache: &str, bytes: u64) {
    let name = if cache.is_empty() { "default" } else { cache };
    cache_size_bytes().with_label_values(&[name]).set(bytes as i64);
}

/// Text exposition of every grove metric.
pub fn render() -> String {
    let _ = (requests_total(), cache_total(), origin_requests_total(), bytes_out_total(), cache_size_bytes());
    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
