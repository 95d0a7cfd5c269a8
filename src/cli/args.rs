use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "pbx-monitor")]
#[command(about = "Records answered PBX calls through a silent spy call", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the feed monitor and the task worker together (default)
    Run,
    /// Run only the PBX feed monitor
    Monitor,
    /// Run only the HTTP task worker and provider webhooks
    Worker,
    /// List recent spy sessions
    Sessions(SessionsCliArgs),
    /// Hang up and harvest the recording for one PBX call
    Cleanup(CleanupCliArgs),
    /// Print version information
    Version,
}

#[derive(ClapArgs, Debug)]
pub struct SessionsCliArgs {
    /// Maximum number of sessions to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
}

#[derive(ClapArgs, Debug)]
pub struct CleanupCliArgs {
    /// PBX call id (the callid from the event feed)
    pub call_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_none() {
        let cli = Cli::parse_from(["pbx-monitor"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn test_sessions_limit() {
        let cli = Cli::parse_from(["pbx-monitor", "-v", "sessions", "--limit", "5"]);
        assert!(cli.verbose);
        match cli.command {
            Some(CliCommand::Sessions(args)) => assert_eq!(args.limit, 5),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cleanup_takes_call_id() {
        let cli = Cli::parse_from(["pbx-monitor", "cleanup", "1700000000.42"]);
        match cli.command {
            Some(CliCommand::Cleanup(args)) => assert_eq!(args.call_id, "1700000000.42"),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
