//! Command-line interface definitions.
//!
//! Defines the CLI structure for botfleet using `clap`: run the control
//! plane, inspect a running one through its status file, send it operator
//! commands over the broker, and validate configuration.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::domain::BotName;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG: &str = "botfleet.toml";

/// Default status file, matching the `status_file` config default.
pub const DEFAULT_STATUS_FILE: &str = "botfleet.status.json";

/// Trading-bot fleet control plane
#[derive(Parser, Debug)]
#[command(name = "botfleet")]
#[command(version)]
pub struct Cli {
    /// Color output mode [auto, always, never]
    #[arg(
        long,
        global = true,
        default_value = "auto",
        hide_possible_values = true
    )]
    pub color: ColorChoice,

    /// JSON output for scripting
    #[arg(long, global = true)]
    pub json: bool,

    /// Decrease output verbosity
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Increase output verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Color output mode for terminal rendering.
#[derive(Clone, Debug, Default, clap::ValueEnum)]
pub enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane in the foreground until Ctrl-C
    Run(RunArgs),

    /// Show bots and feeds from the status file of a running control plane
    Status(StatusArgs),

    /// Stop a bot on a running control plane, archiving its data
    Stop(StopArgs),

    /// Archive the data of a stopped bot
    Archive(ArchiveArgs),

    /// Remove a stopped or archived bot and its sandbox
    Remove(BotTarget),

    /// Clear a bot's error state and deploy it again
    Retry(BotTarget),

    /// Run diagnostic checks
    #[command(subcommand)]
    Check(CheckCommand),
}

/// Subcommands for `botfleet check`.
#[derive(Subcommand, Debug)]
pub enum CheckCommand {
    /// Load and validate a configuration file.
    Config(ConfigPathArg),
}

#[derive(Parser, Debug)]
pub struct ConfigPathArg {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Override the configured log level (e.g. debug, info, warn).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Start without deploying the `[[bots]]` entries.
    #[arg(long)]
    pub no_deploy: bool,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Path to the status file written by `botfleet run`.
    #[arg(long, default_value = DEFAULT_STATUS_FILE)]
    pub status_file: PathBuf,
}

/// The bot an operator command acts on, and how to reach the control plane.
#[derive(Args, Debug)]
pub struct BotTarget {
    /// Bot instance name.
    pub name: BotName,

    /// Path to the configuration file of the running control plane.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Seconds to wait for the control plane to answer.
    #[arg(long, default_value_t = 120)]
    pub timeout_secs: u64,
}

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub target: BotTarget,

    /// Stop without archiving.
    #[arg(long, conflicts_with = "bucket")]
    pub no_archive: bool,

    /// Archive to this remote bucket instead of the local archive.
    #[arg(long)]
    pub bucket: Option<String>,
}

#[derive(Args, Debug)]
pub struct ArchiveArgs {
    #[command(flatten)]
    pub target: BotTarget,

    /// Archive to this remote bucket instead of the local archive.
    #[arg(long)]
    pub bucket: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults_to_local_config() {
        let cli = Cli::try_parse_from(["botfleet", "run"]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG));
        assert!(!args.no_deploy);
    }

    #[test]
    fn json_flag_is_global() {
        let cli = Cli::try_parse_from(["botfleet", "status", "--json"]).unwrap();
        assert!(cli.json);
        let Commands::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert_eq!(args.status_file, PathBuf::from(DEFAULT_STATUS_FILE));
    }

    #[test]
    fn check_config_takes_path() {
        let cli =
            Cli::try_parse_from(["botfleet", "check", "config", "--config", "/etc/botfleet.toml"]).unwrap();
        let Commands::Check(CheckCommand::Config(args)) = cli.command else {
            panic!("expected check config");
        };
        assert_eq!(args.config, PathBuf::from("/etc/botfleet.toml"));
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["botfleet", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn stop_takes_bot_name_and_archive_flags() {
        let cli = Cli::try_parse_from(["botfleet", "stop", "bot1", "--no-archive"]).unwrap();
        let Commands::Stop(args) = cli.command else {
            panic!("expected stop");
        };
        assert_eq!(args.target.name.as_str(), "bot1");
        assert_eq!(args.target.config, PathBuf::from(DEFAULT_CONFIG));
        assert_eq!(args.target.timeout_secs, 120);
        assert!(args.no_archive);
        assert!(args.bucket.is_none());
    }

    #[test]
    fn stop_rejects_bucket_with_no_archive() {
        let result = Cli::try_parse_from(["botfleet", "stop", "bot1", "--no-archive", "--bucket", "cold"]);
        assert!(result.is_err());
    }

    #[test]
    fn archive_accepts_bucket() {
        let cli = Cli::try_parse_from(["botfleet", "archive", "bot1", "--bucket", "cold"]).unwrap();
        let Commands::Archive(args) = cli.command else {
            panic!("expected archive");
        };
        assert_eq!(args.bucket.as_deref(), Some("cold"));
    }

    #[test]
    fn invalid_bot_name_is_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["botfleet", "remove", "no/slashes"]).is_err());
        assert!(Cli::try_parse_from(["botfleet", "retry", "bot1"]).is_ok());
    }
}
