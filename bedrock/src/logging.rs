pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build the process root logger from the embedded terminal config.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Embedded logger config must parse");

    config.build_logger().expect("Failed to construct the root logger")
}

/// Logger that swallows every record. Components fall back to this when no
/// parent logger is supplied.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_is_silent() {
        let log = discard();
        debug!(log, "swallowed"; "key" => 1);
    }

    #[test]
    fn test_init_builds() {
        let _ = init();
    }
}
