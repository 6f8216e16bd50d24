//! Structured logging setup.
//!
//! `RUST_LOG` takes precedence over `[logging]` in the config file:
//!
//! ```bash
//! RUST_LOG=knowledge_base::worker=debug kb serve
//! ```
//!
//! ```toml
//! [logging]
//! level = "info"
//! format = "json"        # or "pretty"
//!
//! [logging.modules]
//! "knowledge_base::pipeline" = "debug"
//! ```

use std::sync::Once;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// HH:MM:SS.mmm in local time, for the human-readable format.
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let mut directives = config.level.clone();
    let mut modules: Vec<_> = config.modules.iter().collect();
    modules.sort();
    for (module, level) in modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    EnvFilter::new(directives)
}

/// Install the global subscriber. Only the first call has any effect.
///
/// Logs go to stderr so that CLI output on stdout stays machine-readable.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(config);

        if config.format == "json" {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_timer(CompactTime)
                .with_level(true)
                .with_writer(std::io::stderr)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).init();
        }
    });
}

/// Initialize with `LoggingConfig::default()` (info, pretty).
pub fn init() {
    init_with_config(&LoggingConfig::default());
}
