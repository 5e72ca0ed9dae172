use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

pub use callprof_trace::config::parse_duration;

#[derive(Parser, Debug)]
#[command(name = "callprof")]
#[command(about = "Function call profiler: records per-function call statistics from instrumented processes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept a profiled process and record its statistics
    Record(RecordArgs),

    /// Execute raw SQL query on a profile database
    Query {
        /// Profile database file
        file: PathBuf,

        /// SQL query to execute
        sql: String,
    },

    /// List saved profile databases
    List {
        /// Directory to search (defaults to current directory)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Write a recording's totals as a snapshot payload
    Export {
        /// Profile database file (defaults to most recent)
        file: Option<PathBuf>,

        /// Output file
        #[arg(long, short = 'o', default_value = "callprof.snapshot")]
        output: PathBuf,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    /// Socket to listen on; start the target with CALLPROF_SOCKET set to it
    #[arg(long, short = 's', default_value = "callprof.sock")]
    pub socket: PathBuf,

    /// Output database path
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Snapshot request interval
    #[arg(long, short = 'i', default_value = "1s", value_parser = parse_duration)]
    pub interval: Duration,

    /// Recording duration (default: until Ctrl-C or the target exits)
    #[arg(long, short = 'd', value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// How long to wait for a target to connect
    #[arg(long, default_value = "60s", value_parser = parse_duration)]
    pub accept_timeout: Duration,

    /// How long a connected target has to complete the handshake
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub handshake_timeout: Duration,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if let Command::Record(args) = &self.command {
            if args.interval.is_zero() {
                return Err("Interval must be greater than zero".to_string());
            }
            if args.handshake_timeout.is_zero() {
                return Err("Handshake timeout must be greater than zero".to_string());
            }
            if let Some(duration) = args.duration
                && duration.is_zero()
            {
                return Err("Duration must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_record_defaults() {
        let cli = Cli::parse_from(["callprof", "record"]);
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.socket, PathBuf::from("callprof.sock"));
        assert_eq!(args.interval, Duration::from_secs(1));
        assert_eq!(args.duration, None);
    }

    #[test]
    fn test_durations_accept_bare_seconds() {
        let cli = Cli::parse_from(["callprof", "record", "-i", "250ms", "-d", "90"]);
        let Command::Record(args) = &cli.command else {
            panic!("expected record");
        };
        assert_eq!(args.interval, Duration::from_millis(250));
        assert_eq!(args.duration, Some(Duration::from_secs(90)));
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_is_invalid() {
        let cli = Cli::parse_from(["callprof", "record", "--interval", "0s"]);
        assert!(cli.validate().is_err());
    }
}
