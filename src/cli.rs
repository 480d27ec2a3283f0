use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "conductor",
    about = "Bridges locally-hosted terminal sessions to a single authorized chat",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon: load configuration, open the store, and run the
    /// event pipeline until shutdown.
    Run,

    /// Validate configuration and connectivity without starting the
    /// daemon: secrets file present and well-formed, preferences parse,
    /// tmux binary reachable, Telegram and Anthropic credentials usable.
    Doctor,

    /// Print a snapshot of persisted sessions.
    Status {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_subcommand_parses() {
        let cli = Cli::parse_from(["conductor", "run"]);
        assert!(matches!(cli.command, Command::Run));
    }

    #[test]
    fn status_subcommand_parses_json_flag() {
        let cli = Cli::parse_from(["conductor", "status", "--json"]);
        match cli.command {
            Command::Status { json } => assert!(json),
            other => panic!("expected status command, got {other:?}"),
        }
    }

    #[test]
    fn doctor_subcommand_parses() {
        let cli = Cli::parse_from(["conductor", "doctor"]);
        assert!(matches!(cli.command, Command::Doctor));
    }
}
