use serdeconv;
use sloggers::{Config, LoggerConfig};
use std::io;
use std::path::Path;

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Build a logger from a `sloggers` TOML config file. Falls back to a terminal/stderr
/// logger at debug level if no path is given.
pub fn init<P: AsRef<Path>>(config_path: Option<P>) -> io::Result<Logger> {
    let raw = match config_path {
        Some(path) => serdeconv::from_toml_file(path.as_ref())
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?,
        None => parse_default(),
    };

    build(raw)
}

fn parse_default() -> LoggerConfig {
    serdeconv::from_toml_str(DEFAULT_CONFIG).expect("default logging config is malformed")
}

fn build(config: LoggerConfig) -> io::Result<Logger> {
    config
        .build_logger()
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
}
