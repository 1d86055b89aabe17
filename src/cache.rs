use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::DATE;
use http::{HeaderMap, HeaderValue};
use indexmap::IndexMap;

use crate::rfc::{self, CacheControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Hit,
    Revalidated,
    Stale,
    ConnectFail,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Stale => "STALE",
            CacheStatus::ConnectFail => "ERR_CONNECT_FAIL",
        }
    }
}

/// Values stored in a [`Cache`]. Callers downcast to [`CacheObject`].
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Storage behind a remap rule. Implementations must be safe for concurrent
/// use from every request task.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<CacheValue>;
    /// Stores `value` under `key`, accounting `size` bytes. Returns whether
    /// anything was evicted to make room.
    fn add_size(&self, key: &str, value: CacheValue, size: u64) -> bool;
    fn remove(&self, key: &str);
    fn remove_oldest(&self);
    /// Bytes currently stored.
    fn size(&self) -> u64;
}

/// Looks up `key` and downcasts it. A value of any other type is logged and
/// treated as a miss.
pub fn get_object(cache: &dyn Cache, key: &str) -> Option<Arc<CacheObject>> {
    let value = cache.get(key)?;
    match value.downcast::<CacheObject>() {
        Ok(obj) => Some(obj),
        Err(_) => {
            log::error!("cache key {key} holds a value that is not a cache object, treating as miss");
            None
        }
    }
}

/// A stored response. Never mutated after it is published, apart from the
/// hit counter; updates build a new object.
#[derive(Debug)]
pub struct CacheObject {
    pub body: Bytes,
    pub req_headers: HeaderMap,
    pub resp_headers: HeaderMap,
    pub resp_cache_control: CacheControl,
    /// Code served to clients.
    pub code: u16,
    /// Code the origin sent on the last round trip, 304 after a revalidation.
    pub origin_code: u16,
    pub proxy_url: String,
    /// When the request to the origin was sent.
    pub req_time: DateTime<Utc>,
    /// When the origin response arrived, by our clock.
    pub req_resp_time: DateTime<Utc>,
    /// The origin's `Date`, or `req_resp_time` if it sent none.
    pub resp_resp_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// `body.len()`, fixed at construction.
    pub size: u64,
    /// Set on objects synthesized after a transport error.
    pub connect_failed: bool,
    hits: AtomicU64,
}

impl CacheObject {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        req_headers: HeaderMap,
        body: Bytes,
        code: u16,
        origin_code: u16,
        proxy_url: String,
        resp_headers: HeaderMap,
        req_time: DateTime<Utc>,
        req_resp_time: DateTime<Utc>,
        resp_resp_time: DateTime<Utc>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        let resp_cache_control = CacheControl::parse(&resp_headers);
        let size = body.len() as u64;
        Self {
            body,
            req_headers,
            resp_headers,
            resp_cache_control,
            code,
            origin_code,
            proxy_url,
            req_time,
            req_resp_time,
            resp_resp_time,
            last_modified,
            size,
            connect_failed: false,
            hits: AtomicU64::new(0),
        }
    }

    /// Stand-in object for an origin that could not be reached.
    pub fn connect_failure(req_headers: HeaderMap, proxy_url: String, req_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let code = crate::constants::CODE_CONNECT_FAILURE;
        let reason = http::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Bad Gateway");
        let mut obj = Self::new(
            req_headers,
            Bytes::from(reason),
            code,
            code,
            proxy_url,
            HeaderMap::new(),
            req_time,
            now,
            now,
            now,
        );
        obj.connect_failed = true;
        obj
    }

    /// Copy of this object after the origin answered a revalidation with 304.
    /// Body, request headers, directives and size carry over; the `Date`
    /// header, origin code and timestamps come from the new round trip.
    pub fn revalidated(
        &self,
        origin_code: u16,
        new_date: Option<&HeaderValue>,
        proxy_url: String,
        req_time: DateTime<Utc>,
        req_resp_time: DateTime<Utc>,
        resp_resp_time: DateTime<Utc>,
    ) -> Self {
        let mut resp_headers = self.resp_headers.clone();
        let date = match new_date {
            Some(v) => Some(v.clone()),
            None => HeaderValue::from_str(&rfc::format_http_date(resp_resp_time)).ok(),
        };
        if let Some(date) = date {
            resp_headers.insert(DATE, date);
        }
        Self {
            body: self.body.clone(),
            req_headers: self.req_headers.clone(),
            resp_headers,
            resp_cache_control: self.resp_cache_control.clone(),
            code: self.code,
            origin_code,
            proxy_url,
            req_time,
            req_resp_time,
            resp_resp_time,
            last_modified: self.last_modified,
            size: self.size,
            connect_failed: false,
            hits: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

struct Entry {
    value: CacheValue,
    size: u64,
}

struct MemInner {
    order: IndexMap<String, Entry>,
    size: u64,
}

/// Byte-bounded LRU kept in memory. The least recently used entry sits at
/// index 0.
pub struct MemCache {
    capacity: u64,
    inner: Mutex<MemInner>,
}

impl MemCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(MemInner {
                order: IndexMap::new(),
                size: 0,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cache for MemCache {
    fn get(&self, key: &str) -> Option<CacheValue> {
        let mut inner = self.lock();
        let idx = inner.order.get_index_of(key)?;
        let last = inner.order.len() - 1;
        inner.order.move_index(idx, last);
        inner.order.get_index(last).map(|(_, e)| Arc::clone(&e.value))
    }

    fn add_size(&self, key: &str, value: CacheValue, size: u64) -> bool {
        let mut inner = self.lock();
        if let Some(old) = inner.order.shift_remove(key) {
            inner.size -= old.size;
        }
        inner.order.insert(key.to_string(), Entry { value, size });
        inner.size += size;
        let mut evicted = false;
        while inner.size > self.capacity && inner.order.len() > 1 {
            if let Some((old_key, old)) = inner.order.shift_remove_index(0) {
                log::debug!("memcache evicting {old_key} ({} bytes)", old.size);
                inner.size -= old.size;
                evicted = true;
            }
        }
        evicted
    }

    fn remove(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(old) = inner.order.shift_remove(key) {
            inner.size -= old.size;
        }
    }

    fn remove_oldest(&self) {
        let mut inner = self.lock();
        if let Some((_, old)) = inner.order.shift_remove_index(0) {
            inner.size -= old.size;
        }
    }

    fn size(&self) -> u64 {
        self.lock().size
    }
}
