//! tracing-subscriber setup for the server binary and demos.

use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

const QUIET_TARGETS: [&str; 4] = ["tungstenite", "tokio_tungstenite", "reqwest", "hyper"];

pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "WARN" | "WARNING" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global subscriber. `RUST_LOG` directives are honoured on top
/// of `level`; later calls are no-ops.
pub fn init(level: &str) {
    INIT.call_once(|| {
        let mut filter = EnvFilter::from_default_env().add_directive(parse_level(level).into());
        for target in QUIET_TARGETS {
            if let Ok(directive) = format!("{target}=warn").parse() {
                filter = filter.add_directive(directive);
            }
        }

        if tracing_subscriber::fmt()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            return;
        }

        tracing::info!(log_level = %level, "logging initialized");
    });
}
