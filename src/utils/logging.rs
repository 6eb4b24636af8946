//! Logging Module
//!
//! Structured logging via the `tracing` crate, plus a small epoch logger used
//! by the stage trainer.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging a single group
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse a level name, falling back to `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Per-epoch progress logger for one stage run
pub struct EpochLogger {
    label: String,
    total_epochs: usize,
    epoch: usize,
    epoch_start: Instant,
    run_start: Instant,
}

impl EpochLogger {
    pub fn new(label: &str, total_epochs: usize) -> Self {
        Self {
            label: label.to_string(),
            total_epochs,
            epoch: 0,
            epoch_start: Instant::now(),
            run_start: Instant::now(),
        }
    }

    pub fn start_epoch(&mut self, epoch: usize, frozen: bool) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();
        tracing::debug!(
            "[{}] epoch {}/{} started ({})",
            self.label,
            epoch + 1,
            self.total_epochs,
            if frozen { "head only" } else { "all parameters" }
        );
    }

    pub fn end_epoch(&self, train_loss: f64, val_loss: f64, val_accuracy: f64, improved: bool) {
        let elapsed = self.epoch_start.elapsed().as_secs_f64();
        let remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let avg = self.run_start.elapsed().as_secs_f64() / (self.epoch + 1) as f64;

        tracing::info!(
            "[{}] epoch {}/{} in {:.1}s | train loss {:.4} | val loss {:.4} | val acc {:.2}%{} | ETA {:.0}s",
            self.label,
            self.epoch + 1,
            self.total_epochs,
            elapsed,
            train_loss,
            val_loss,
            val_accuracy * 100.0,
            if improved { " (best)" } else { "" },
            remaining as f64 * avg
        );
    }

    pub fn log_unfreeze(&self, epoch: usize) {
        tracing::info!("[{}] unfreezing all parameters at epoch {}", self.label, epoch);
    }

    pub fn log_complete(&self, best_epoch: usize, best_loss: f64) {
        tracing::info!(
            "[{}] finished {} epochs in {:.1}s | best val loss {:.4} at epoch {}",
            self.label,
            self.total_epochs,
            self.run_start.elapsed().as_secs_f64(),
            best_loss,
            best_epoch + 1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::parse("Warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::default().level, LogLevel::Info);
        assert_eq!(LogConfig::verbose().level, LogLevel::Debug);
    }

    #[test]
    fn test_epoch_logger_tracks_epoch() {
        let mut logger = EpochLogger::new("binary", 3);
        logger.start_epoch(2, true);
        assert_eq!(logger.epoch, 2);
        logger.end_epoch(0.5, 0.4, 0.9, true);
    }
}
