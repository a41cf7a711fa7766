use std::path::Path;

use anyhow::Context;
use file_rotate::{compression::Compression, suffix::AppendCount, ContentLimit, FileRotate};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, fmt::time::UtcTime, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LogConfig;

pub const LOG_FILE_NAME: &str = "hearthkeep.log";

/// Size-capped log file with numbered rotations (`hearthkeep.log.1`, ...).
pub fn rotating_writer(dir: &Path, config: &LogConfig) -> anyhow::Result<FileRotate<AppendCount>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create log directory {}", dir.display()))?;
    Ok(FileRotate::new(
        dir.join(LOG_FILE_NAME),
        AppendCount::new(config.file_max_files.max(1)),
        ContentLimit::Bytes(config.file_max_bytes.max(1024)),
        Compression::None,
        #[cfg(unix)]
        None,
    ))
}

/// Install the global subscriber: JSON lines on stderr (stdout carries
/// command output) and, when `log_dir` is given, the same lines in a
/// rotating file. Keep the returned guard
/// alive until exit so buffered lines reach the file.
pub fn init(config: &LogConfig, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let _ = tracing_log::LogTracer::init();

    let filter = EnvFilter::try_new(&config.filter)
        .or_else(|_| EnvFilter::try_new(LogConfig::default().filter))
        .context("build log filter")?;

    let console = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .boxed();

    let (file, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(rotating_writer(dir, config)?);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_timer(UtcTime::rfc_3339())
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(filter).with(console).with(file);
    // A subscriber installed earlier (tests) stays in place.
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rotating_writer_caps_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file_max_bytes: 1024,
            file_max_files: 2,
            ..LogConfig::default()
        };
        let mut writer = rotating_writer(dir.path(), &config).unwrap();
        let line = vec![b'x'; 200];
        for _ in 0..40 {
            writer.write_all(&line).unwrap();
            writer.write_all(b"\n").unwrap();
        }
        writer.flush().unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert!(dir.path().join(LOG_FILE_NAME).exists());
        assert!(files.len() <= 3, "found {} files", files.len());
        assert!(dir.path().join(format!("{LOG_FILE_NAME}.1")).exists());
    }
}
