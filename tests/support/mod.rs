#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use grove::server::{ReloadHandle, Server};

#[derive(Clone, Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cache_status(&self) -> &str {
        self.header("X-Cache").unwrap_or("")
    }
}

#[derive(Clone)]
pub struct TestClient {
    proxy_addr: SocketAddr,
}

impl TestClient {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self { proxy_addr }
    }

    /// Sends `url` in origin form with its authority as the Host header.
    pub async fn send(&self, method: Method, url: &str, headers: HeaderMap) -> TestResponse {
        self.send_body(method, url, headers, Bytes::new()).await
    }

    pub async fn send_body(&self, method: Method, url: &str, headers: HeaderMap, body: Bytes) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.proxy_addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let uri: http::Uri = url.parse().expect("uri");
        let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let mut builder = Request::builder().method(method).uri(target);
        if !headers.contains_key(http::header::HOST) {
            if let Some(authority) = uri.authority() {
                builder = builder.header(http::header::HOST, authority.as_str());
            }
        }
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse { status, headers, body }
    }

    pub async fn get(&self, url: &str) -> TestResponse {
        self.send(Method::GET, url, HeaderMap::new()).await
    }
}

/// Origin stand-in. Counts the requests it answers.
pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

/// A running proxy with its config and rules in a private directory.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub client: TestClient,
    reload: ReloadHandle,
    shutdown: watch::Sender<bool>,
    rules_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl TestProxy {
    pub async fn start(rules: serde_json::Value) -> Self {
        Self::start_with("", rules).await
    }

    /// `extra` is appended to the bootstrap YAML.
    pub async fn start_with(extra: &str, rules: serde_json::Value) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let rules_path = dir.path().join("remap.json");
        std::fs::write(&rules_path, rules.to_string()).expect("write rules");
        let config_path = dir.path().join("grove.yaml");
        let yaml = format!(
            "server:\n  addr: 127.0.0.1:0\nremap_rules_file: remap.json\ncache_size_bytes: 1048576\n{extra}"
        );
        std::fs::write(&config_path, yaml).expect("write config");

        let (cfg, _) = grove::config::load(&config_path).expect("load config");
        let server = Server::bind(cfg, &config_path, false).await.expect("bind proxy");
        let addr = server.local_addr().expect("proxy addr");
        let reload = server.reload_handle();
        let shutdown = server.shutdown_handle();
        tokio::spawn(async move {
            let _ = server.serve().await;
        });

        Self {
            addr,
            client: TestClient::new(addr),
            reload,
            shutdown,
            rules_path,
            _dir: dir,
        }
    }

    pub fn rewrite_rules(&self, rules: serde_json::Value) -> anyhow::Result<()> {
        std::fs::write(&self.rules_path, rules.to_string())?;
        self.reload.reload()
    }

    pub fn write_raw_rules(&self, raw: &str) -> anyhow::Result<()> {
        std::fs::write(&self.rules_path, raw)?;
        self.reload.reload()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// A rules file with one round-robin rule from `from` to `to`.
pub fn simple_rules(from: &str, to: &[String]) -> serde_json::Value {
    let to: Vec<serde_json::Value> = to.iter().map(|url| serde_json::json!({ "url": url })).collect();
    serde_json::json!({
        "retry_num": 1,
        "retry_codes": [500, 502, 503, 504],
        "timeout_ms": 2000,
        "parent_selection": "round-robin",
        "rules": [{ "name": "test", "from": from, "to": to }]
    })
}

pub fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

pub fn http_date_now() -> HeaderValue {
    httpdate::fmt_http_date(std::time::SystemTime::now()).parse().unwrap()
}

pub fn http_date_ago(secs: u64) -> HeaderValue {
    let t = std::time::SystemTime::now() - std::time::Duration::from_secs(secs);
    httpdate::fmt_http_date(t).parse().unwrap()
}

/// Origin answering 200 with `body` and the given Cache-Control.
pub fn cacheable(body: &'static str, cache_control: &'static str) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req| {
        let mut headers = HeaderMap::new();
        headers.insert("Cache-Control", HeaderValue::from_static(cache_control));
        headers.insert("Date", http_date_now());
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));
        build_response(StatusCode::OK, headers, Bytes::from_static(body.as_bytes()))
    }
}

pub fn status_only(status: StatusCode) -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync {
    move |_req| {
        let mut headers = HeaderMap::new();
        headers.insert("Date", http_date_now());
        build_response(status, headers, Bytes::from_static(b"origin error"))
    }
}
