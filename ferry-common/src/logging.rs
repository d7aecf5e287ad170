use std::str::FromStr;

use serde::Deserialize;
use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Traffic leaving the relay: store reads, SMTP commands, webhook posts
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Traffic arriving at the relay: triggers, SMTP replies, store payloads
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Output format for log lines
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum LogFormat {
    /// Compact human-readable lines
    #[default]
    Text,
    /// One JSON object per line, for log collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "compact" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown log format '{other}'")),
        }
    }
}

fn level_from_env() -> LevelFilter {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    })
}

fn format_from_env(fallback: LogFormat) -> LogFormat {
    std::env::var("LOG_FORMAT").map_or(fallback, |format| {
        format.parse().unwrap_or_else(|err| {
            eprintln!("{err}, defaulting to {fallback:?}");
            fallback
        })
    })
}

/// Install the global subscriber.
///
/// The level comes from `LOG_LEVEL` and the format from `LOG_FORMAT`,
/// falling back to `format`. Log output goes to stderr so that serve mode can
/// keep stdout for reports. Only events from the relay's own crates are kept.
pub fn init(format: LogFormat) {
    let level = level_from_env();
    let filter = FilterFn::new(|metadata| metadata.target().starts_with("ferry"));

    let layer = match format_from_env(format) {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(filter)
            .boxed(),
    };

    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::Registry::default().with(layer).try_init();
}
