//! Logging setup
//!
//! One call at process start. `LOG_FORMAT=json` emits newline-delimited JSON
//! for log shippers; anything else prints human-readable lines. `RUST_LOG`
//! filters as usual (default `info`, e.g. `RUST_LOG=lc_scheduler=debug`).

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber for this service.
pub fn init_logging(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match LogFormat::from_env() {
        LogFormat::Json => builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Text => builder.with_ansi(true).init(),
    }

    tracing::debug!(service = service_name, "Logging initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_detection() {
        std::env::remove_var("LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);

        std::env::set_var("LOG_FORMAT", "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var("LOG_FORMAT", "pretty");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);

        std::env::remove_var("LOG_FORMAT");
    }
}
