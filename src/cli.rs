use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Expenseflow CLI definition.
#[derive(Debug, Parser)]
#[command(name = "expenseflow")]
#[command(about = "Durable expense approval workflow service", version)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON on stdout")]
    pub log_json: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = LogJsonFormat::Compact,
        help = "Layout for --log-json output"
    )]
    pub log_json_format: LogJsonFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the expense service, the workflow engine and the deadline sweeper.
    Serve(ServeArgs),
    /// Ask a running server to start a new expense workflow.
    Start(StartArgs),
    /// Inspect recorded workflow runs.
    Status(StatusArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct ServeArgs {
    #[arg(long, help = "Path to an optional YAML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Override the bind address from the config")]
    pub bind: Option<String>,

    #[arg(long, help = "Override the listen port from the config")]
    pub port: Option<u16>,
}

#[derive(Debug, Args, Clone)]
pub struct StartArgs {
    #[arg(
        long,
        default_value = "http://127.0.0.1:4000",
        help = "Base URL of a running expenseflow server"
    )]
    pub server_url: String,
}

#[derive(Debug, Args, Clone)]
pub struct StatusArgs {
    #[arg(long, help = "Optional workflow identifier to inspect")]
    pub workflow_id: Option<String>,

    #[arg(long, help = "Emit JSON instead of human-readable text")]
    pub json: bool,

    #[arg(long, default_value_t = 20, help = "Maximum runs to list")]
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "lower")]
pub enum LogJsonFormat {
    Pretty,
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_serve_command_with_global_flags() {
        let cli = Cli::parse_from([
            "expenseflow",
            "serve",
            "--port",
            "4100",
            "-v",
            "--log-json",
            "--log-json-format",
            "pretty",
        ]);

        assert!(cli.verbose);
        assert!(cli.log_json);
        assert_eq!(cli.log_json_format, LogJsonFormat::Pretty);
        match cli.command {
            Commands::Serve(serve) => {
                assert_eq!(serve.port, Some(4100));
                assert!(serve.bind.is_none());
                assert!(serve.config.is_none());
            }
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn status_defaults() {
        let cli = Cli::parse_from(["expenseflow", "status"]);
        match cli.command {
            Commands::Status(status) => {
                assert_eq!(status.limit, 20);
                assert!(!status.json);
                assert!(status.workflow_id.is_none());
            }
            _ => panic!("expected status command"),
        }
    }
}
