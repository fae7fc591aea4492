use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod broker;
pub mod recv;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker: accept child processes and match up their pipes.
    Broker(BrokerArgs),
    /// Join a broker, open a pipe, and send payloads on it.
    Send(SendArgs),
    /// Join a broker, open a pipe, and print what arrives on it.
    Recv(RecvArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Broker(args) => broker::run(args),
        Command::Send(args) => send::run(args),
        Command::Recv(args) => recv::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Socket path to bind.
    pub path: PathBuf,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Broker socket path to connect to.
    pub path: PathBuf,
    /// Pipe id to open (the receiver must open the same id).
    #[arg(long, short = 'p')]
    pub pipe: u64,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Send the payload this many times.
    #[arg(long, default_value = "1")]
    pub count: usize,
    /// Timeout for broker matchmaking and delivery (e.g. 5s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct RecvArgs {
    /// Broker socket path to connect to.
    pub path: PathBuf,
    /// Pipe id to open (the sender must open the same id).
    #[arg(long, short = 'p')]
    pub pipe: u64,
    /// Exit after receiving N messages (default: until the sender closes).
    #[arg(long)]
    pub count: Option<usize>,
    /// Timeout for broker matchmaking (e.g. 5s, 500ms).
    #[arg(long, default_value = "30s")]
    pub timeout: String,
}

#[derive(Args, Debug, Default)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse a human duration like `5s`, `500ms`, or `2m`.
pub fn parse_duration(raw: &str) -> Option<std::time::Duration> {
    let raw = raw.trim();
    let (value, unit) = raw.split_at(raw.find(|c: char| c.is_alphabetic())?);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(std::time::Duration::from_millis(value)),
        "s" => Some(std::time::Duration::from_secs(value)),
        "m" => Some(std::time::Duration::from_secs(value * 60)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(
            parse_duration("500ms"),
            Some(std::time::Duration::from_millis(500))
        );
        assert_eq!(parse_duration("5s"), Some(std::time::Duration::from_secs(5)));
        assert_eq!(
            parse_duration("2m"),
            Some(std::time::Duration::from_secs(120))
        );
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration("10"), None);
    }
}
