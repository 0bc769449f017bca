//! Tracing setup for the command-line driver.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Install the global subscriber, writing to stderr so stdout stays pure JSON.
///
/// `RUST_LOG` wins when set; otherwise `BROWSEWIRE_LOG` picks the level for
/// browsewire's own targets. `verbose` forces debug. `LOG_FORMAT=json`
/// switches to JSON lines.
pub fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = if verbose {
            "debug"
        } else {
            base_level(std::env::var("BROWSEWIRE_LOG").ok().as_deref())
        };
        EnvFilter::new(filter_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    // Server stderr is chatty; it only shows up when debugging.
    let server = if matches!(level, "debug" | "trace") {
        level
    } else {
        "off"
    };
    format!(
        "browsewire={level},browsewire_cli={level},{target}={server}",
        target = browsewire::SERVER_LOG_TARGET
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_fall_back_to_info() {
        assert_eq!(base_level(None), "info");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("nonsense")), "info");
    }

    #[test]
    fn server_output_hidden_unless_debugging() {
        assert_eq!(
            filter_directives("info"),
            "browsewire=info,browsewire_cli=info,browsewire::server=off"
        );
        assert!(filter_directives("debug").ends_with("browsewire::server=debug"));
    }
}
