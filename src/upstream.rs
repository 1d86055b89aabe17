use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderName, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;

use crate::config;
use crate::remap::ParentRequest;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub struct Fetched {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Client for parent round trips. Direct requests share one pooled client;
/// requests through a forward proxy open a connection to the proxy and send
/// an absolute-form target.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    connect_timeout: Option<Duration>,
}

impl UpstreamClient {
    pub fn new(cfg: &config::Upstream) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(false);
        if !cfg.connect_timeout.is_zero() {
            connector.set_connect_timeout(Some(cfg.connect_timeout));
        }
        let https = if cfg.insecure_skip_verify {
            HttpsConnectorBuilder::new()
                .with_tls_config(insecure_tls_config()?)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(connector)
        } else {
            match HttpsConnectorBuilder::new().with_native_roots() {
                Ok(builder) => builder.https_or_http().enable_http1().enable_http2().wrap_connector(connector),
                Err(err) => {
                    log::warn!("no native root certificates ({err}), https parents will fail verification");
                    HttpsConnectorBuilder::new()
                        .with_tls_config(empty_roots_tls_config()?)
                        .https_or_http()
                        .enable_http1()
                        .enable_http2()
                        .wrap_connector(connector)
                }
            }
        };
        let mut builder = Client::builder(TokioExecutor::new());
        if cfg.max_idle_conns_per_host > 0 {
            builder.pool_max_idle_per_host(cfg.max_idle_conns_per_host);
        }
        if !cfg.idle_conn_timeout.is_zero() {
            builder.pool_idle_timeout(cfg.idle_conn_timeout);
        }
        Ok(Self {
            client: builder.build(https),
            connect_timeout: (!cfg.connect_timeout.is_zero()).then_some(cfg.connect_timeout),
        })
    }

    /// One round trip. Hop-by-hop headers are stripped from both the request
    /// and the response.
    pub async fn round_trip(&self, req: &ParentRequest, proxy: Option<&Uri>) -> Result<Fetched> {
        let mut headers = req.headers.clone();
        strip_hop_by_hop(&mut headers);

        let mut builder = http::Request::builder().method(req.method.clone()).uri(req.uri.clone());
        if let Some(h) = builder.headers_mut() {
            *h = headers;
        }
        let outgoing = builder
            .body(Full::new(req.body.clone()))
            .context("build upstream request")?;

        let resp = match proxy.filter(|p| p.host().is_some()) {
            Some(proxy) => self.via_proxy(outgoing, proxy).await?,
            None => self.client.request(outgoing).await.context("upstream request")?,
        };
        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = collect_body(resp).await?;
        Ok(Fetched { status, headers, body })
    }

    async fn via_proxy(&self, req: http::Request<Full<Bytes>>, proxy: &Uri) -> Result<http::Response<Incoming>> {
        if req.uri().scheme_str() == Some("https") {
            bail!("https parents through a forward proxy are not supported");
        }
        let host = proxy.host().ok_or_else(|| anyhow!("proxy url {proxy} has no host"))?;
        let port = proxy.port_u16().unwrap_or(80);
        let connect = TcpStream::connect((host, port));
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| anyhow!("connect to proxy {host}:{port} timed out"))?,
            None => connect.await,
        }
        .with_context(|| format!("connect to proxy {host}:{port}"))?;
        let _ = stream.set_nodelay(true);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("proxy handshake")?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("proxy connection closed: {err}");
            }
        });

        let (mut parts, body) = req.into_parts();
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(v) = authority.as_str().parse() {
                    parts.headers.insert(HOST, v);
                }
            }
        }
        // http1 sends the uri as given, which keeps it in absolute form
        let req = http::Request::from_parts(parts, body);
        sender.send_request(req).await.context("upstream request via proxy")
    }
}

async fn collect_body(resp: http::Response<Incoming>) -> Result<Bytes> {
    let body = resp.into_body().collect().await.context("read upstream body")?;
    Ok(body.to_bytes())
}

fn empty_roots_tls_config() -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls versions")?;
    Ok(builder
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth())
}

fn insecure_tls_config() -> Result<rustls::ClientConfig> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .context("tls versions")?;
    Ok(builder
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth())
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
