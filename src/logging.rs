use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt as _;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Builds the stdout+file subscriber shared by [`init`] and [`init_child`].
///
/// Each call spawns its own `tracing-appender` background flusher thread
/// (inside `tracing_appender::non_blocking`), which is exactly why this is a
/// function and not a value computed once: a forked child has no thread but
/// the one that called `fork`, so it must run this again to get a flusher
/// thread that actually exists in its own process.
fn build_subscriber(
    log_file_path: impl AsRef<Path>,
    log_level: &str,
) -> Result<(impl Subscriber + Send + Sync + 'static, WorkerGuard)> {
    let filter = EnvFilter::from_str(log_level).map_err(|e| Error::Config(format!("invalid log level: {e}")))?;

    let log_file_path: PathBuf = log_file_path.as_ref().to_path_buf();
    let dir = log_file_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_file_path
        .file_name()
        .ok_or_else(|| Error::Config(format!("invalid log file path: {}", log_file_path.display())))?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let writer = std::io::stdout.and(non_blocking);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .finish();

    Ok((subscriber, guard))
}

/// Installs the crate's process-global `tracing` subscriber: one stream to
/// stdout, one to a non-blocking, append-only file at `log_file_path`, both
/// filtered at `log_level`.
///
/// This is the direct equivalent of the reference deployment's
/// `logging.FileHandler` + `logging.StreamHandler` pair, substituting
/// `tracing` so the supervisor's structured fields (child name, restart
/// count) survive into the log record instead of being flattened into a
/// single message string.
///
/// Meant for the parent process only. Returns the file appender's guard; the
/// caller must keep it alive for the lifetime of the process, or buffered
/// log lines are dropped on exit. Use [`init_child`] inside a forked child's
/// own routine instead of calling this a second time.
pub fn init(log_file_path: impl AsRef<Path>, log_level: &str) -> Result<WorkerGuard> {
    let (subscriber, guard) = build_subscriber(log_file_path, log_level)?;
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to install global logger: {e}")))?;
    Ok(guard)
}

/// Installs a process-local `tracing` subscriber for a forked child.
///
/// `fork` duplicates only the calling thread, so the parent's non-blocking
/// file writer, and the background thread draining it, do not exist in the
/// child; the global subscriber static is itself copy-on-write-inherited
/// from the parent, already pointing at that dead writer, so it can neither
/// be reused nor replaced with another `set_global_default` call. Each child
/// instead builds its own writer (spawning its own flusher thread) and
/// installs it as this thread's default, which shadows the stale global
/// default for every `tracing` call the child makes. The caller must hold
/// both returned guards for as long as it wants to keep logging.
pub fn init_child(
    log_file_path: impl AsRef<Path>,
    log_level: &str,
) -> Result<(tracing::subscriber::DefaultGuard, WorkerGuard)> {
    let (subscriber, guard) = build_subscriber(log_file_path, log_level)?;
    let default_guard = tracing::subscriber::set_default(subscriber);
    Ok((default_guard, guard))
}
