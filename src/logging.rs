//! Structured logging: console plus a daily rolling file.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "nexus-stock";
const DEFAULT_FILTER: &str = "info,nexus_stock_lib=debug";

/// Install the global subscriber. The returned guard flushes the file
/// writer when dropped, so the caller keeps it for the life of the process.
pub fn init(log_dir: &Path, retention_days: u64) -> anyhow::Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fs::create_dir_all(log_dir)?;
    let pruned = prune_old_logs(log_dir, retention_days);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if pruned > 0 {
        tracing::info!(pruned, retention_days, "Pruned old log files");
    }
    Ok(guard)
}

/// Delete rolled log files last modified more than `retention_days` ago.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, retention_days: u64) -> usize {
    let Some(cutoff) =
        SystemTime::now().checked_sub(Duration::from_secs(retention_days * 24 * 60 * 60))
    else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if !is_log || !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if modified < cutoff {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_keeps_recent_and_foreign_files() {
        let dir = std::env::temp_dir().join(format!("nexus-stock-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let recent = dir.join(format!("{LOG_FILE_PREFIX}.2024-06-01"));
        let foreign = dir.join("other.log");
        fs::write(&recent, "x").unwrap();
        fs::write(&foreign, "x").unwrap();

        assert_eq!(prune_old_logs(&dir, 14), 0);
        assert!(recent.exists());

        // Zero days of retention treats every rolled file as old.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(prune_old_logs(&dir, 0), 1);
        assert!(!recent.exists());
        assert!(foreign.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_directory_prunes_nothing() {
        let dir = std::env::temp_dir().join(format!("nexus-stock-none-{}", uuid::Uuid::new_v4()));
        assert_eq!(prune_old_logs(&dir, 1), 0);
    }
}
