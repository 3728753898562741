use crate::stop;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "pmo", about = "A lightweight YAML-driven process supervisor", version)]
pub struct Cli {
    /// Path to the service descriptor
    #[arg(short = 'f', long = "config", global = true, default_value = "pmo.yml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start services ("all", names, or numeric ids)
    Start { services: Vec<String> },
    /// Gracefully stop running services
    Stop {
        services: Vec<String>,
        /// Seconds to wait before escalating to SIGKILL
        #[arg(long, default_value_t = stop::DEFAULT_STOP_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// Restart services (stop, then start)
    Restart {
        services: Vec<String>,
        #[arg(long, default_value_t = stop::DEFAULT_STOP_TIMEOUT.as_secs())]
        timeout: u64,
    },
    /// View service logs
    #[command(alias = "logs")]
    Log {
        services: Vec<String>,
        /// Number of lines to show initially
        #[arg(short = 'n', long = "lines")]
        lines: Option<usize>,
        /// Print the backlog without following
        #[arg(long)]
        no_follow: bool,
    },
    /// Clear service logs
    Flush { services: Vec<String> },
    /// Print resolved commands without spawning anything
    DryRun { services: Vec<String> },
    /// List services and their status
    #[command(alias = "ps")]
    Ls,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Core subcommand parsing

    #[test]
    fn test_start_no_args() {
        let cli = Cli::try_parse_from(["pmo", "start"]).unwrap();
        match cli.command.unwrap() {
            Command::Start { services } => assert!(services.is_empty()),
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn test_start_with_names() {
        let cli = Cli::try_parse_from(["pmo", "start", "web", "api"]).unwrap();
        match cli.command.unwrap() {
            Command::Start { services } => assert_eq!(services, vec!["web", "api"]),
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn test_stop_default_timeout() {
        let cli = Cli::try_parse_from(["pmo", "stop", "web"]).unwrap();
        match cli.command.unwrap() {
            Command::Stop { services, timeout } => {
                assert_eq!(services, vec!["web"]);
                assert_eq!(timeout, 10);
            }
            _ => panic!("expected Stop"),
        }
    }

    #[test]
    fn test_stop_custom_timeout() {
        let cli = Cli::try_parse_from(["pmo", "stop", "web", "--timeout", "3"]).unwrap();
        match cli.command.unwrap() {
            Command::Stop { timeout, .. } => assert_eq!(timeout, 3),
            _ => panic!("expected Stop"),
        }
    }

    #[test]
    fn test_restart() {
        let cli = Cli::try_parse_from(["pmo", "restart", "all"]).unwrap();
        match cli.command.unwrap() {
            Command::Restart { services, timeout } => {
                assert_eq!(services, vec!["all"]);
                assert_eq!(timeout, 10);
            }
            _ => panic!("expected Restart"),
        }
    }

    #[test]
    fn test_ls() {
        let cli = Cli::try_parse_from(["pmo", "ls"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Ls));
    }

    #[test]
    fn test_ps_alias() {
        let cli = Cli::try_parse_from(["pmo", "ps"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Ls));
    }

    #[test]
    fn test_log_defaults() {
        let cli = Cli::try_parse_from(["pmo", "log"]).unwrap();
        match cli.command.unwrap() {
            Command::Log {
                services,
                lines,
                no_follow,
            } => {
                assert!(services.is_empty());
                assert!(lines.is_none());
                assert!(!no_follow);
            }
            _ => panic!("expected Log"),
        }
    }

    #[test]
    fn test_log_with_options() {
        let cli =
            Cli::try_parse_from(["pmo", "log", "web", "-n", "50", "--no-follow"]).unwrap();
        match cli.command.unwrap() {
            Command::Log {
                services,
                lines,
                no_follow,
            } => {
                assert_eq!(services, vec!["web"]);
                assert_eq!(lines, Some(50));
                assert!(no_follow);
            }
            _ => panic!("expected Log"),
        }
    }

    #[test]
    fn test_logs_alias() {
        let cli = Cli::try_parse_from(["pmo", "logs", "web"]).unwrap();
        assert!(matches!(cli.command.unwrap(), Command::Log { .. }));
    }

    #[test]
    fn test_flush() {
        let cli = Cli::try_parse_from(["pmo", "flush", "web"]).unwrap();
        match cli.command.unwrap() {
            Command::Flush { services } => assert_eq!(services, vec!["web"]),
            _ => panic!("expected Flush"),
        }
    }

    #[test]
    fn test_dry_run() {
        let cli = Cli::try_parse_from(["pmo", "dry-run", "all"]).unwrap();
        match cli.command.unwrap() {
            Command::DryRun { services } => assert_eq!(services, vec!["all"]),
            _ => panic!("expected DryRun"),
        }
    }

    // Config flag

    #[test]
    fn test_default_config_path() {
        let cli = Cli::try_parse_from(["pmo", "ls"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("pmo.yml"));
    }

    #[test]
    fn test_config_flag_before_subcommand() {
        let cli = Cli::try_parse_from(["pmo", "-f", "other.yml", "ls"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yml"));
    }

    #[test]
    fn test_config_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["pmo", "ls", "--config", "other.yml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yml"));
    }

    // Error cases

    #[test]
    fn test_unknown_subcommand() {
        assert!(Cli::try_parse_from(["pmo", "bogus"]).is_err());
    }

    #[test]
    fn test_no_args_no_command() {
        let cli = Cli::try_parse_from(["pmo"]).unwrap();
        assert!(cli.command.is_none());
    }
}
