use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use http::{HeaderValue, Request};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{self, Bootstrap};
use crate::constants;
use crate::handler::{self, ConnInfo, Snapshot, SnapshotCell};
use crate::logging;
use crate::metrics;

/// Shared by every connection. The snapshot is swapped on reload; the
/// bootstrap is kept to compare against the next one.
struct ServerState {
    snapshot: SnapshotCell,
    bootstrap: Mutex<Bootstrap>,
    config_path: PathBuf,
    verbose: bool,
}

impl ServerState {
    fn reload(&self) -> Result<()> {
        let (cfg, ignored) = config::load(&self.config_path)?;
        if cfg.strict && !ignored.is_empty() {
            return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
        }
        cfg.validate()?;

        let previous = self.snapshot.load();
        let next = Snapshot::build(&cfg, &cfg.rules_path(&self.config_path), Some(&previous))
            .context("build snapshot")?;
        {
            let mut current = self.bootstrap.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.server.addr != cfg.server.addr {
                log::warn!(
                    "server.addr changed from {} to {}, restart to apply",
                    current.server.addr,
                    cfg.server.addr
                );
            }
            if let Err(err) = logging::reload(&cfg.logger, self.verbose) {
                log::warn!("logger reload failed: {err:#}");
            }
            *current = cfg;
        }
        self.snapshot.store(next);
        log::info!("reloaded config {}", self.config_path.display());
        Ok(())
    }
}

/// Cloneable handle that reloads the server's config and rules.
#[derive(Clone)]
pub struct ReloadHandle {
    state: Arc<ServerState>,
}

impl ReloadHandle {
    /// On failure the running snapshot stays in place.
    pub fn reload(&self) -> Result<()> {
        self.state.reload()
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Builds the first snapshot and binds `server.addr`.
    pub async fn bind(cfg: Bootstrap, config_path: &Path, verbose: bool) -> Result<Self> {
        let snapshot = Snapshot::build(&cfg, &cfg.rules_path(config_path), None)?;
        let listener = TcpListener::bind(&cfg.server.addr)
            .await
            .with_context(|| format!("bind {}", cfg.server.addr))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                snapshot: SnapshotCell::new(snapshot),
                bootstrap: Mutex::new(cfg),
                config_path: config_path.to_path_buf(),
                verbose,
            }),
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().context("listener address")
    }

    /// Sending `true` stops the accept loop.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accepts until shutdown. Connections already accepted run to completion
    /// on their own tasks.
    pub async fn serve(self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let header_read_timeout = {
            let cfg = self.state.bootstrap.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            cfg.server.header_read_timeout
        };
        log::info!("listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            log::error!("accept tcp: {err}");
                            continue;
                        }
                    };
                    let mut conn = ConnInfo::new(peer);
                    conn.local = stream.local_addr().ok();
                    conn.socket = stream.as_fd().try_clone_to_owned().ok();
                    let conn = Arc::new(conn);
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);

                    tokio::spawn(async move {
                        let service = service_fn(move |mut req: Request<Incoming>| {
                            let snapshot = state.snapshot.load();
                            let conn = Arc::clone(&conn);
                            let request_id = metrics::request_id_from_headers(req.headers());
                            // the generated id travels on to the parent
                            if let Ok(v) = HeaderValue::from_str(&request_id) {
                                req.headers_mut().insert(constants::PROTOCOL_REQUEST_ID_KEY, v);
                            }
                            async move {
                                let resp = logging::with_trace_id(request_id, handler::serve(snapshot, req, conn)).await;
                                Ok::<_, hyper::Error>(resp)
                            }
                        });
                        let mut builder = ConnBuilder::new(TokioExecutor::new());
                        if !header_read_timeout.is_zero() {
                            builder
                                .http1()
                                .timer(TokioTimer::new())
                                .header_read_timeout(header_read_timeout);
                        }
                        if let Err(err) = builder.serve_connection(io, service).await {
                            log::debug!("http connection from {peer} closed: {err}");
                        }
                    });
                }
            }
        }
        log::info!("stopped accepting connections");
        Ok(())
    }
}

/// SIGTERM and SIGINT stop the server; SIGHUP reloads it.
pub fn spawn_signal_handlers(reload: ReloadHandle, shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
            log::warn!("could not install SIGHUP handler");
            return;
        };
        while sig.recv().await.is_some() {
            log::info!("SIGHUP received, reloading");
            if let Err(err) = reload.reload() {
                log::error!("reload failed, keeping the running config: {err:#}");
            }
        }
    });

    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
        log::info!("shutting down");
        let _ = shutdown.send(true);
    });
}

/// Binds, installs the signal handlers and serves until told to stop.
pub async fn run(cfg: Bootstrap, config_path: PathBuf, verbose: bool) -> Result<()> {
    let server = Server::bind(cfg, &config_path, verbose).await?;
    spawn_signal_handlers(server.reload_handle(), server.shutdown_handle());
    server.serve().await
}
