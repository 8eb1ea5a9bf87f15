//! Structured logging setup: a terminal layer plus an optional hourly-rotating file layer.

use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub debug: bool,
    pub logger_name: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            logger_name: "tunnelproxy".to_string(),
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Installs the global subscriber. Call once at process start.
    pub fn init(&self) {
        let default_directive = if self.debug { "debug" } else { "info" };
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(default_directive.parse().unwrap())
            .from_env_lossy();

        let terminal_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_writer(std::io::stderr);

        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(terminal_layer);

        match self.file_appender() {
            Some(appender) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender);
                registry.with(file_layer).init();
            }
            None => registry.init(),
        }
    }

    fn file_appender(&self) -> Option<tracing_appender::rolling::RollingFileAppender> {
        let log_dir = self.log_dir.clone()?;
        if !Path::new(&log_dir).exists() {
            create_dir_all(&log_dir).ok()?;
        }
        tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::HOURLY)
            .max_log_files(6)
            .filename_prefix(&self.logger_name)
            .filename_suffix("log")
            .build(log_dir)
            .ok()
    }
}
