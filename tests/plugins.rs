mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use hyper::body::Incoming;
use serde_json::json;
use support::*;

const ALL_PLUGINS: &str = "plugins:\n  - name: stats\n  - name: modify_headers\n    priority: 5\n  - name: if_modified_since\n";

fn with_stats(mut rules: serde_json::Value, allow: &[&str]) -> serde_json::Value {
    rules["stats"] = json!({ "allow": allow });
    rules
}

#[tokio::test]
async fn stats_served_to_allowed_clients() {
    let origin = MockServer::start(cacheable("x", "max-age=60")).await;
    let rules = with_stats(simple_rules("http://cdn.test/", &[format!("{}/", origin.url())]), &["127.0.0.0/8"]);
    let proxy = TestProxy::start_with(ALL_PLUGINS, rules).await;

    proxy.client.get("http://cdn.test/x").await;
    let resp = proxy.client.get("http://cdn.test/_astats").await;
    assert_eq!(resp.status, StatusCode::OK);
    let text = String::from_utf8_lossy(&resp.body);
    assert!(text.contains("grove_requests_total"), "{text}");
    assert!(text.contains("grove_cache_size_bytes"), "{text}");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn stats_refused_without_an_allow_entry() {
    let origin = MockServer::start(cacheable("x", "max-age=60")).await;
    let proxy = TestProxy::start_with(ALL_PLUGINS, simple_rules("http://cdn.test/", &[format!("{}/", origin.url())])).await;

    assert_eq!(proxy.client.get("http://cdn.test/_astats").await.status, StatusCode::FORBIDDEN);
    let post = proxy.client.send(Method::POST, "http://cdn.test/_astats", HeaderMap::new()).await;
    assert_eq!(post.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn stats_path_is_proxied_when_the_plugin_is_off() {
    let origin = MockServer::start(cacheable("origin stats", "max-age=60")).await;
    let rules = with_stats(simple_rules("http://cdn.test/", &[format!("{}/", origin.url())]), &["127.0.0.0/8"]);
    let proxy = TestProxy::start(rules).await;

    let resp = proxy.client.get("http://cdn.test/_astats").await;
    assert_eq!(&resp.body[..], b"origin stats");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn modify_headers_edits_parent_requests_and_responses() {
    let saw_edge = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&saw_edge);
    let origin = MockServer::start(move |req: http::Request<Incoming>| {
        if req.headers().get("x-edge").map(|v| v == "grove").unwrap_or(false) {
            seen.store(true, Ordering::SeqCst);
        }
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", HeaderValue::from_static("max-age=60"));
        headers.insert("Date", http_date_now());
        headers.insert("X-Secret", HeaderValue::from_static("origin-internal"));
        build_response(StatusCode::OK, headers, Bytes::from_static(b"body"))
    })
    .await;
    let mut rules = simple_rules("http://cdn.test/", &[format!("{}/", origin.url())]);
    rules["rules"][0]["plugins"] = json!({
        "modify_headers": {
            "parent_request": { "set": { "x-edge": "grove" } },
            "response": { "set": { "x-served-by": "grove" }, "drop": ["x-secret"] }
        }
    });
    let proxy = TestProxy::start_with(ALL_PLUGINS, rules).await;

    for expected in ["MISS", "HIT"] {
        let resp = proxy.client.get("http://cdn.test/m").await;
        assert_eq!(resp.cache_status(), expected);
        assert_eq!(resp.header("x-served-by"), Some("grove"));
        assert!(resp.header("x-secret").is_none());
    }
    assert!(saw_edge.load(Ordering::SeqCst));
}

#[tokio::test]
async fn if_modified_since_answers_304_for_unchanged_objects() {
    let origin = MockServer::start(|_req: http::Request<Incoming>| {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", HeaderValue::from_static("max-age=60"));
        headers.insert("Date", http_date_now());
        headers.insert("Last-Modified", http_date_ago(3600));
        build_response(StatusCode::OK, headers, Bytes::from_static(b"content"))
    })
    .await;
    let proxy = TestProxy::start_with(ALL_PLUGINS, simple_rules("http://cdn.test/", &[format!("{}/", origin.url())])).await;

    let mut headers = HeaderMap::new();
    headers.insert("If-Modified-Since", http_date_now());
    let resp = proxy.client.send(Method::GET, "http://cdn.test/ims", headers).await;
    assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
    assert!(resp.body.is_empty());

    let mut headers = HeaderMap::new();
    headers.insert("If-Modified-Since", http_date_ago(7200));
    let resp = proxy.client.send(Method::GET, "http://cdn.test/ims", headers).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.cache_status(), "HIT");
    assert_eq!(&resp.body[..], b"content");
}

#[tokio::test]
async fn reload_swaps_rules_and_keeps_old_ones_on_error() {
    let first = MockServer::start(cacheable("first", "no-store")).await;
    let second = MockServer::start(cacheable("second", "no-store")).await;
    let proxy = TestProxy::start(simple_rules("http://cdn.test/", &[format!("{}/", first.url())])).await;
    assert_eq!(&proxy.client.get("http://cdn.test/r").await.body[..], b"first");

    proxy
        .rewrite_rules(simple_rules("http://cdn.test/", &[format!("{}/", second.url())]))
        .unwrap();
    assert_eq!(&proxy.client.get("http://cdn.test/r").await.body[..], b"second");

    assert!(proxy.write_raw_rules("{ \"rules\": [").is_err());
    assert_eq!(&proxy.client.get("http://cdn.test/r").await.body[..], b"second");
}
