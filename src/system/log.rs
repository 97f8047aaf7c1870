#[cfg(feature = "log")]
use tracing_appender::rolling;
#[cfg(feature = "log")]
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Enum for configuring log filtering levels.
#[derive(Debug, Clone, Copy)]
pub enum LogFilterLevel {
    TRACE,
    DEBUG,
    INFO,
    WARN,
    ERROR,
    OFF,
}

impl From<LogFilterLevel> for tracing::level_filters::LevelFilter {
    fn from(level: LogFilterLevel) -> Self {
        match level {
            LogFilterLevel::TRACE => Self::TRACE,
            LogFilterLevel::DEBUG => Self::DEBUG,
            LogFilterLevel::INFO => Self::INFO,
            LogFilterLevel::WARN => Self::WARN,
            LogFilterLevel::ERROR => Self::ERROR,
            LogFilterLevel::OFF => Self::OFF,
        }
    }
}

/// Enum for configuring how logs are rotated on disk when using a file logger.
#[derive(Clone, Debug)]
pub enum LogRolling {
    NEVER,
    MINUTELY,
    HOURLY,
    DAILY,
}

/// Configuration for writing logs to files when using a file logger.
#[derive(Clone, Debug)]
pub struct LogFileConfig {
    pub roller: LogRolling,
    pub dir: String,
    pub file_name: String,
    pub ansi: bool,
}

#[cfg(feature = "log")]
fn env_filter(filter_level: LogFilterLevel) -> EnvFilter {
    let level: tracing::level_filters::LevelFilter = filter_level.into();
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(format!("{level},may=warn"))
}

#[cfg(feature = "log")]
/// Installs the global subscriber: console output plus an optional rolling file.
///
/// Returns an error if a global subscriber was already set.
pub fn init_log(
    filter_level: LogFilterLevel,
    file_config: Option<LogFileConfig>,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_filter(env_filter(filter_level));

    if let Some(file) = file_config {
        let file_appender = match file.roller {
            LogRolling::NEVER => rolling::never(file.dir, file.file_name),
            LogRolling::MINUTELY => rolling::minutely(file.dir, file.file_name),
            LogRolling::HOURLY => rolling::hourly(file.dir, file.file_name),
            LogRolling::DAILY => rolling::daily(file.dir, file.file_name),
        };

        let file_layer = fmt::layer()
            .with_writer(file_appender)
            .with_ansi(file.ansi)
            .with_filter(env_filter(filter_level));
        tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry().with(console_layer).try_init()
    }
}

/// Emits a debug-level log.
#[macro_export]
macro_rules! s_debug {
    ($($arg:tt)*) => {{
        $crate::tracing::debug!("{}", format!($($arg)*));
    }};
}

/// Emits an info-level log.
#[macro_export]
macro_rules! s_info {
    ($($arg:tt)*) => {{
        $crate::tracing::info!("{}", format!($($arg)*));
    }};
}

/// Emits a warning-level log.
#[macro_export]
macro_rules! s_warn {
    ($($arg:tt)*) => {{
        $crate::tracing::warn!("{}", format!($($arg)*));
    }};
}

/// Emits an error-level log.
#[macro_export]
macro_rules! s_error {
    ($($arg:tt)*) => {{
        $crate::tracing::error!("{}", format!($($arg)*));
    }};
}

/// Emits a trace-level log tagged with the call site.
#[macro_export]
macro_rules! s_trace {
    ($($arg:tt)*) => {{
        $crate::tracing::trace!("{} [{}:{}]", format!($($arg)*), file!(), line!());
    }};
}
