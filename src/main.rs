use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use grove::config;
use grove::logging;
use grove::server;

#[derive(Parser, Debug)]
#[command(name = "grove", about = "HTTP caching reverse proxy", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut cfg, ignored) = config::load(&cli.config)?;

    if cfg.hostname.is_none() {
        cfg.hostname = std::env::var("HOSTNAME").ok();
    }

    logging::init(&cfg.logger, cli.verbose)?;

    if cfg.strict && !ignored.is_empty() {
        return Err(anyhow!("unknown config fields: {}", ignored.join(", ")));
    }

    if !ignored.is_empty() {
        log::warn!("ignoring unknown config fields: {}", ignored.join(", "));
    }

    if let Some(pidfile) = &cfg.pidfile {
        write_pid(pidfile)?;
    }

    cfg.validate()?;

    log::info!("grove starting with config {}", cli.config.display());
    let rules_path = cfg.rules_path(&cli.config);
    start_config_watcher(vec![cli.config.clone(), rules_path]);

    server::run(cfg, cli.config, cli.verbose).await
}

fn write_pid(path: &str) -> Result<()> {
    let pid = std::process::id();
    let path = PathBuf::from(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create pid dir {}", parent.display()))?;
    }
    std::fs::write(&path, pid.to_string()).with_context(|| format!("write pid file {}", path.display()))?;
    Ok(())
}

/// Sends ourselves SIGHUP whenever the config or the rules file changes.
fn start_config_watcher(paths: Vec<PathBuf>) {
    use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use std::collections::HashSet;
    use std::sync::mpsc::channel;

    let dirs: HashSet<PathBuf> = paths
        .iter()
        .map(|p| p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new(".")).to_path_buf())
        .collect();
    let names: HashSet<_> = paths.iter().filter_map(|p| p.file_name().map(|s| s.to_os_string())).collect();
    std::thread::spawn(move || {
        let (tx, rx) = channel();
        let mut watcher = match RecommendedWatcher::new(tx, notify::Config::default()) {
            Ok(watcher) => watcher,
            Err(err) => {
                log::warn!("config watcher init failed: {err}");
                return;
            }
        };
        for dir in &dirs {
            if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                log::warn!("config watcher start failed for {}: {err}", dir.display());
                return;
            }
        }
        let mut last = Instant::now() - Duration::from_secs(1);
        for res in rx {
            let event = match res {
                Ok(event) => event,
                Err(err) => {
                    log::warn!("config watcher error: {err}");
                    continue;
                }
            };
            if !event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| names.contains(n)).unwrap_or(false))
            {
                continue;
            }
            match event.kind {
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
                _ => continue,
            }
            if last.elapsed() < Duration::from_millis(300) {
                continue;
            }
            last = Instant::now();
            log::info!("config changed, triggering reload");
            let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGHUP);
        }
    });
}
