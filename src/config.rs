//! Configuration for the store and the TCP server

use crate::error::{MiniKvError, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a single store instance
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Interval between background sweeps, `None` disables the sweep task
    pub sweep_interval: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl StoreConfig {
    /// Sets the interval between background sweeps
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Disables the background sweep, leaving only lazy expiry
    pub fn without_sweep(mut self) -> Self {
        self.sweep_interval = None;
        self
    }
}

/// How stores are laid out across client connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreTopology {
    /// Every connection gets its own isolated store
    #[default]
    PerSession,
    /// All connections share one store
    Shared,
}

impl FromStr for StoreTopology {
    type Err = MiniKvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "session" | "per-session" => Ok(StoreTopology::PerSession),
            "shared" | "process" => Ok(StoreTopology::Shared),
            other => Err(MiniKvError::InvalidArgument(format!(
                "unknown topology '{}', expected 'session' or 'shared'",
                other
            ))),
        }
    }
}

/// Default cap on a single command line (64 MiB)
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// minikv server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Root directory for session snapshots
    pub data_dir: PathBuf,
    pub topology: StoreTopology,
    pub store: StoreConfig,
    pub max_connections: usize,
    /// Longest command line accepted, in bytes, before the connection is dropped
    pub max_line_bytes: usize,
    /// Restore `autosave.json` on start and write it back on teardown
    pub autosave: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6379".to_string(),
            data_dir: PathBuf::from("data"),
            topology: StoreTopology::default(),
            store: StoreConfig::default(),
            max_connections: 1000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            autosave: true,
        }
    }
}

/// Outcome of parsing command-line arguments
#[derive(Debug)]
pub enum CliAction {
    Run(ServerConfig),
    Help,
}

impl ServerConfig {
    /// Parse configuration from command-line arguments (without the program name)
    pub fn from_args<I>(args: I) -> Result<CliAction>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = ServerConfig::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--bind" | "-b" => config.bind_addr = required(&arg, args.next())?,
                "--data-dir" | "-d" => config.data_dir = PathBuf::from(required(&arg, args.next())?),
                "--topology" | "-t" => config.topology = required(&arg, args.next())?.parse()?,
                "--sweep-interval-ms" => {
                    let millis: u64 = parse_number(&arg, &required(&arg, args.next())?)?;
                    config.store.sweep_interval = match millis {
                        0 => None,
                        n => Some(Duration::from_millis(n)),
                    };
                }
                "--max-connections" => {
                    config.max_connections = parse_number(&arg, &required(&arg, args.next())?)?;
                    if config.max_connections == 0 {
                        return Err(MiniKvError::InvalidArgument(
                            "--max-connections must be at least 1".to_string(),
                        ));
                    }
                }
                "--max-line-bytes" => {
                    config.max_line_bytes = parse_number(&arg, &required(&arg, args.next())?)?;
                    if config.max_line_bytes == 0 {
                        return Err(MiniKvError::InvalidArgument(
                            "--max-line-bytes must be at least 1".to_string(),
                        ));
                    }
                }
                "--no-autosave" => config.autosave = false,
                "--help" | "-h" => return Ok(CliAction::Help),
                other => {
                    return Err(MiniKvError::InvalidArgument(format!(
                        "unknown argument: {}",
                        other
                    )))
                }
            }
        }

        Ok(CliAction::Run(config))
    }
}

fn required(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| MiniKvError::InvalidArgument(format!("{} requires a value", flag)))
}

fn parse_number<T: FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| MiniKvError::InvalidArgument(format!("invalid value for {}: {}", flag, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.topology, StoreTopology::PerSession);
        assert_eq!(config.store.sweep_interval, Some(Duration::from_secs(1)));
        assert!(config.autosave);
        assert_eq!(config.max_line_bytes, DEFAULT_MAX_LINE_BYTES);
    }

    #[test]
    fn test_parse_args() {
        let action = ServerConfig::from_args(args(&[
            "--bind",
            "0.0.0.0:7000",
            "--topology",
            "shared",
            "--sweep-interval-ms",
            "250",
            "--max-line-bytes",
            "4096",
            "--no-autosave",
        ]))
        .unwrap();

        match action {
            CliAction::Run(config) => {
                assert_eq!(config.bind_addr, "0.0.0.0:7000");
                assert_eq!(config.topology, StoreTopology::Shared);
                assert_eq!(config.store.sweep_interval, Some(Duration::from_millis(250)));
                assert_eq!(config.max_line_bytes, 4096);
                assert!(!config.autosave);
            }
            CliAction::Help => panic!("expected a run configuration"),
        }
    }

    #[test]
    fn test_zero_sweep_interval_disables_sweep() {
        match ServerConfig::from_args(args(&["--sweep-interval-ms", "0"])).unwrap() {
            CliAction::Run(config) => assert_eq!(config.store.sweep_interval, None),
            CliAction::Help => panic!("expected a run configuration"),
        }
    }

    #[test]
    fn test_parse_args_errors() {
        assert!(ServerConfig::from_args(args(&["--bind"])).is_err());
        assert!(ServerConfig::from_args(args(&["--topology", "cluster"])).is_err());
        assert!(ServerConfig::from_args(args(&["--max-connections", "many"])).is_err());
        assert!(ServerConfig::from_args(args(&["--max-connections", "0"])).is_err());
        assert!(ServerConfig::from_args(args(&["--max-line-bytes", "0"])).is_err());
        assert!(ServerConfig::from_args(args(&["--verbose"])).is_err());
        assert!(matches!(
            ServerConfig::from_args(args(&["--help"])).unwrap(),
            CliAction::Help
        ));
    }
}
