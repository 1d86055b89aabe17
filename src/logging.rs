use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, LogSpecification, Logger as FlexiLogger, LoggerHandle, Naming, WriteMode,
};
use log::LevelFilter;
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Clone, Copy)]
struct FormatConfig {
    include_pid: bool,
    include_caller: bool,
    include_trace_id: bool,
}

static FORMAT_CONFIG: OnceLock<FormatConfig> = OnceLock::new();
static HANDLE: OnceLock<LoggerHandle> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = effective_level(config, verbose);

    FORMAT_CONFIG.get_or_init(|| FormatConfig {
        include_pid: !config.nopid,
        include_caller: config.caller,
        include_trace_id: config.traceid,
    });

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(log_format);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path))?;
        let mut file_logger = logger.log_to_file(spec).format(log_format);
        if config.max_size > 0 {
            let cleanup = if config.max_backups > 0 {
                Cleanup::KeepLogFiles(config.max_backups as usize)
            } else {
                Cleanup::Never
            };
            file_logger = file_logger.rotate(Criterion::Size(config.max_size * 1024 * 1024), Naming::Numbers, cleanup);
        }
        logger = file_logger.write_mode(WriteMode::BufferAndFlush);
    }

    let handle = logger.start()?;
    let _ = HANDLE.set(handle);
    Ok(())
}

/// Applies the level from a reloaded config. Output targets and format stay
/// as they were at startup.
pub fn reload(config: &Logger, verbose: bool) -> Result<()> {
    let Some(handle) = HANDLE.get() else {
        return Ok(());
    };
    let level = effective_level(config, verbose);
    let spec = LogSpecification::parse(level.as_str()).context("parse log level")?;
    handle.set_new_spec(spec);
    log::info!("log level set to {level}");
    Ok(())
}

fn effective_level(config: &Logger, verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    }
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

fn log_format(
    writer: &mut dyn Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    let cfg = FORMAT_CONFIG.get().copied().unwrap_or(FormatConfig {
        include_pid: true,
        include_caller: false,
        include_trace_id: false,
    });
    let ts = now.now_utc_owned().format(TIMESTAMP_FORMAT);
    write!(writer, "{} [{}]", ts, record.level())?;
    if cfg.include_pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if cfg.include_trace_id {
        let trace_id = current_trace_id().unwrap_or_else(|| "-".to_string());
        write!(writer, " trace_id={}", trace_id)?;
    }
    if cfg.include_caller {
        let file = record.file().unwrap_or("-");
        let line = record.line().unwrap_or(0);
        write!(writer, " {}:{}", file, line)?;
    }
    writeln!(writer, " {}", record.args())
}

/// Runs `fut` with `trace_id` attached to every log line it emits.
pub async fn with_trace_id<T>(trace_id: String, fut: impl std::future::Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|val| val.clone()).ok()
}
