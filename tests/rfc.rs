use chrono::{Duration, Utc};
use http::{HeaderMap, HeaderValue, Method};

use grove::rfc::{self, CacheControl, Reuse};

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(*name, HeaderValue::from_str(value).unwrap());
    }
    map
}

fn reuse(req: &HeaderMap, resp: &HeaderMap, stored_req: &HeaderMap, age_secs: i64, strict: bool) -> Reuse {
    let now = Utc::now();
    let req_time = now - Duration::seconds(age_secs);
    rfc::can_reuse_stored(
        req,
        resp,
        &CacheControl::parse(req),
        &CacheControl::parse(resp),
        stored_req,
        req_time,
        req_time,
        strict,
    )
}

fn dated(age_secs: i64, pairs: &[(&'static str, &str)]) -> HeaderMap {
    let date = rfc::format_http_date(Utc::now() - Duration::seconds(age_secs));
    let mut map = headers(pairs);
    map.insert("date", HeaderValue::from_str(&date).unwrap());
    map
}

#[test]
fn cache_control_parses_directives() {
    let cc = CacheControl::parse(&headers(&[
        ("cache-control", "Max-Age=60, no-transform"),
        ("cache-control", "private=\"Set-Cookie\""),
    ]));
    assert_eq!(cc.get("max-age"), Some("60"));
    assert!(cc.has("no-transform"));
    assert_eq!(cc.get("no-transform"), Some(""));
    assert_eq!(cc.get("private"), Some("Set-Cookie"));
    assert_eq!(cc.delta_seconds("max-age"), Some(Duration::seconds(60)));
    assert!(CacheControl::parse(&HeaderMap::new()).is_empty());
}

#[test]
fn malformed_delta_seconds_is_none() {
    let cc = CacheControl::parse(&headers(&[("cache-control", "max-age=soon, s-maxage=-1")]));
    assert_eq!(cc.delta_seconds("max-age"), None);
    assert_eq!(cc.delta_seconds("s-maxage"), None);
}

#[test]
fn http_dates_in_all_three_formats() {
    let expected = rfc::parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
    assert_eq!(rfc::parse_http_date("Sunday, 06-Nov-94 08:49:37 GMT"), Some(expected));
    assert_eq!(rfc::parse_http_date("Sun Nov  6 08:49:37 1994"), Some(expected));
    assert_eq!(rfc::format_http_date(expected), "Sun, 06 Nov 1994 08:49:37 GMT");
    assert_eq!(rfc::parse_http_date("yesterday"), None);
}

#[test]
fn only_get_is_cached() {
    let resp = headers(&[("cache-control", "max-age=60")]);
    assert!(rfc::can_cache(&Method::GET, &HeaderMap::new(), 200, &resp, true));
    assert!(!rfc::can_cache(&Method::POST, &HeaderMap::new(), 200, &resp, true));
    assert!(!rfc::can_cache(&Method::HEAD, &HeaderMap::new(), 200, &resp, true));
}

#[test]
fn response_directives_prevent_storage() {
    for cc in ["no-store", "no-cache", "private", "max-age=60, private"] {
        let resp = headers(&[("cache-control", cc)]);
        assert!(!rfc::can_cache(&Method::GET, &HeaderMap::new(), 200, &resp, false), "{cc}");
    }
}

#[test]
fn request_no_store_only_counts_when_strict() {
    let req = headers(&[("cache-control", "no-store")]);
    let resp = headers(&[("cache-control", "max-age=60")]);
    assert!(!rfc::can_cache(&Method::GET, &req, 200, &resp, true));
    assert!(rfc::can_cache(&Method::GET, &req, 200, &resp, false));
}

#[test]
fn default_cacheable_codes_need_no_explicit_lifetime() {
    assert!(rfc::can_cache(&Method::GET, &HeaderMap::new(), 404, &HeaderMap::new(), true));
    assert!(!rfc::can_cache(&Method::GET, &HeaderMap::new(), 500, &HeaderMap::new(), true));
    let expires = headers(&[("expires", "Thu, 01 Dec 2094 16:00:00 GMT")]);
    assert!(rfc::can_cache(&Method::GET, &HeaderMap::new(), 500, &expires, true));
}

#[test]
fn authorized_requests_need_explicit_permission() {
    let req = headers(&[("authorization", "Basic Zm9vOmJhcg==")]);
    let plain = headers(&[("cache-control", "max-age=60")]);
    assert!(!rfc::can_cache(&Method::GET, &req, 200, &plain, true));
    for cc in ["public, max-age=60", "s-maxage=60", "must-revalidate, max-age=60"] {
        let resp = headers(&[("cache-control", cc)]);
        assert!(rfc::can_cache(&Method::GET, &req, 200, &resp, true), "{cc}");
    }
}

#[test]
fn valid_codes() {
    assert!(rfc::is_valid_code(200));
    assert!(rfc::is_valid_code(503));
    assert!(!rfc::is_valid_code(299));
    assert!(!rfc::is_valid_code(999));
}

#[test]
fn fresh_response_is_reused() {
    let resp = dated(10, &[("cache-control", "max-age=60")]);
    assert_eq!(reuse(&HeaderMap::new(), &resp, &HeaderMap::new(), 10, true), Reuse::Can);
}

#[test]
fn stale_response_may_be_served_stale() {
    let resp = dated(120, &[("cache-control", "max-age=60")]);
    assert_eq!(
        reuse(&HeaderMap::new(), &resp, &HeaderMap::new(), 120, true),
        Reuse::MustRevalidateCanStale
    );
}

#[test]
fn stale_must_revalidate_response_is_revalidated() {
    for cc in ["max-age=60, must-revalidate", "max-age=60, proxy-revalidate"] {
        let resp = dated(120, &[("cache-control", cc)]);
        assert_eq!(
            reuse(&HeaderMap::new(), &resp, &HeaderMap::new(), 120, true),
            Reuse::MustRevalidate,
            "{cc}"
        );
    }
}

#[test]
fn stale_beyond_max_stale_is_revalidated() {
    let resp = dated(120, &[("cache-control", "max-age=60, max-stale=30")]);
    assert_eq!(
        reuse(&HeaderMap::new(), &resp, &HeaderMap::new(), 120, true),
        Reuse::MustRevalidate
    );
    let resp = dated(70, &[("cache-control", "max-age=60, max-stale=30")]);
    assert_eq!(
        reuse(&HeaderMap::new(), &resp, &HeaderMap::new(), 70, true),
        Reuse::MustRevalidateCanStale
    );
}

#[test]
fn request_no_cache_forces_fetch_when_strict() {
    let req = headers(&[("cache-control", "no-cache")]);
    let resp = dated(10, &[("cache-control", "max-age=60")]);
    assert_eq!(reuse(&req, &resp, &HeaderMap::new(), 10, true), Reuse::Cannot);
    assert_eq!(reuse(&req, &resp, &HeaderMap::new(), 10, false), Reuse::Can);
}

#[test]
fn pragma_no_cache_without_cache_control_revalidates() {
    let req = headers(&[("pragma", "no-cache")]);
    let resp = dated(10, &[("cache-control", "max-age=60")]);
    assert_eq!(reuse(&req, &resp, &HeaderMap::new(), 10, true), Reuse::MustRevalidate);

    let with_cc = headers(&[("pragma", "no-cache"), ("cache-control", "max-stale")]);
    assert!(!rfc::has_pragma_no_cache(&with_cc));
    assert!(!rfc::has_pragma_no_cache(&headers(&[("pragma", "x, no-cache")])));
}

#[test]
fn min_fresh_beyond_remaining_lifetime_revalidates() {
    let req = headers(&[("cache-control", "min-fresh=100")]);
    let resp = dated(10, &[("cache-control", "max-age=60")]);
    assert_eq!(reuse(&req, &resp, &HeaderMap::new(), 10, true), Reuse::MustRevalidate);
    let req = headers(&[("cache-control", "min-fresh=5")]);
    assert_eq!(reuse(&req, &resp, &HeaderMap::new(), 10, true), Reuse::Can);
}

#[test]
fn vary_selects_on_stored_request_headers() {
    let resp = dated(0, &[("cache-control", "max-age=60"), ("vary", "Accept-Encoding")]);
    let stored = headers(&[("accept-encoding", "gzip")]);
    let same = headers(&[("accept-encoding", "gzip")]);
    let other = headers(&[("accept-encoding", "br")]);
    assert_eq!(reuse(&same, &resp, &stored, 0, true), Reuse::Can);
    assert_eq!(reuse(&other, &resp, &stored, 0, true), Reuse::Cannot);
    assert_eq!(reuse(&HeaderMap::new(), &resp, &stored, 0, true), Reuse::Cannot);

    let star = dated(0, &[("cache-control", "max-age=60"), ("vary", "*")]);
    assert_eq!(reuse(&same, &star, &stored, 0, true), Reuse::Cannot);
}

#[test]
fn freshness_prefers_s_maxage_then_max_age_then_expires() {
    let now = Utc::now();
    let resp = headers(&[("cache-control", "max-age=60, s-maxage=30")]);
    assert_eq!(
        rfc::freshness_lifetime(&resp, &CacheControl::parse(&resp), now),
        Duration::seconds(30)
    );

    let date = rfc::format_http_date(now);
    let expires = rfc::format_http_date(now + Duration::seconds(300));
    let resp = headers(&[("date", &date), ("expires", &expires)]);
    assert_eq!(
        rfc::freshness_lifetime(&resp, &CacheControl::parse(&resp), now),
        Duration::seconds(300)
    );

    let resp = headers(&[("date", &date), ("expires", "0")]);
    assert_eq!(
        rfc::freshness_lifetime(&resp, &CacheControl::parse(&resp), now),
        Duration::zero()
    );
}

#[test]
fn heuristic_freshness_is_a_tenth_of_last_modified_age() {
    let now = Utc::now();
    let date = rfc::format_http_date(now);
    let modified = rfc::format_http_date(now - Duration::seconds(1000));
    let resp = headers(&[("date", &date), ("last-modified", &modified)]);
    assert_eq!(
        rfc::freshness_lifetime(&resp, &CacheControl::default(), now),
        Duration::seconds(100)
    );

    let ancient = rfc::format_http_date(now - Duration::days(365));
    let resp = headers(&[("date", &date), ("last-modified", &ancient)]);
    assert_eq!(
        rfc::freshness_lifetime(&resp, &CacheControl::default(), now),
        Duration::days(1)
    );
}

#[test]
fn current_age_adds_age_header_and_resident_time() {
    let now = Utc::now();
    let resp_time = now - Duration::seconds(20);
    let date = rfc::format_http_date(resp_time);
    let resp = headers(&[("date", &date), ("age", "30")]);
    let age = rfc::current_age(&resp, resp_time, resp_time, now);
    assert_eq!(age.num_seconds(), 50);
}
