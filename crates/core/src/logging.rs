//! Tracing subscriber setup for binaries and tests embedding the backend.
//!
//! Set `BATCH_ATTN_LOG_FORMAT=json` for JSON lines, anything else for
//! human-readable output. `RUST_LOG` controls levels (default: info).
//! Initialization is a no-op when a global subscriber is already set.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "BATCH_ATTN_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

/// Install the global subscriber using `RUST_LOG` and the format from env.
///
/// Returns `false` if a subscriber was already installed.
pub fn init() -> bool {
    init_with_level_and_format(None, LogFormat::from_env())
}

/// `level` is used when `RUST_LOG` is unset (e.g. `"debug"`).
pub fn init_with_level(level: &str) -> bool {
    init_with_level_and_format(Some(level), LogFormat::from_env())
}

pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    let result = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    result.is_ok()
}
