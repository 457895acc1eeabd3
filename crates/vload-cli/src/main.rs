//! vload CLI - batch loading of object-store files into analytical databases.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vload_core::config::LogFormat;
use vload_core::Config;

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// State store error (connection, query, missing record)
    StoreError = 2,
    /// Event payload rejected
    EventError = 3,
    /// A batch closed in error or a target could not be loaded
    LoadError = 4,
    /// Notification could not be published
    NotificationError = 5,
    /// Health check failure
    HealthCheckError = 6,
    /// Operator action refused (unlocking the current batch)
    Refused = 7,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Convert an error to an exit code.
    ///
    /// Library errors are matched by variant; anything else falls back to
    /// inspecting the error message.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<vload_core::Error>() {
            return match e {
                vload_core::Error::Config(_) => ExitCode::ConfigError,
                vload_core::Error::Store(_) | vload_core::Error::RetryCeilingExceeded { .. } => {
                    ExitCode::StoreError
                }
                vload_core::Error::Event(_) => ExitCode::EventError,
                vload_core::Error::Load(_) | vload_core::Error::Secret(_) => ExitCode::LoadError,
                vload_core::Error::Notify(_) => ExitCode::NotificationError,
                vload_core::Error::Io(_) | vload_core::Error::Serialization(_) => {
                    ExitCode::RuntimeError
                }
            };
        }
        if error.downcast_ref::<commands::Refused>().is_some() {
            return ExitCode::Refused;
        }
        if error.downcast_ref::<commands::BatchFailed>().is_some() {
            return ExitCode::LoadError;
        }

        let error_str = error.to_string().to_lowercase();
        if error_str.contains("config") || error_str.contains("toml") || error_str.contains("parse")
        {
            ExitCode::ConfigError
        } else if error_str.contains("health") {
            ExitCode::HealthCheckError
        } else if error_str.contains("interrupted") {
            ExitCode::SignalInterrupt
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "vload")]
#[command(about = "Batch loader from object-store events into analytical databases", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one object-created event
    Process {
        /// Event payload file (reads stdin when omitted)
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run the HTTP service accepting events on POST /events
    Serve {
        /// Override the events and health port
        #[arg(long)]
        listen_port: Option<u16>,

        /// Override the metrics port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Run the flush check for a prefix's current batch, or reprocess a batch
    Flush {
        /// Watched prefix (`bucket[/path]`)
        #[arg(long)]
        prefix: String,

        /// Batch to check instead of the current one
        #[arg(long)]
        batch_id: Option<String>,
    },

    /// Move a locked or failed batch back to open
    Unlock {
        /// Watched prefix (`bucket[/path]`)
        #[arg(long)]
        prefix: String,

        /// Batch to unlock
        #[arg(long)]
        batch_id: String,
    },

    /// Inspect batches
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },

    /// Manage per-prefix load configurations
    Prefix {
        #[command(subcommand)]
        action: PrefixAction,
    },

    /// Create the state store tables
    InitSchema {
        /// Print the DDL instead of applying it
        #[arg(long)]
        print: bool,
    },

    /// Show status and health of a running service
    Status {
        /// Service URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics URL (defaults to the service host on the metrics port)
        #[arg(long)]
        metrics_url: Option<String>,
    },

    /// Validate configuration file
    Validate,
}

#[derive(Subcommand)]
enum BatchAction {
    /// Show a batch record
    Show {
        #[arg(long)]
        prefix: String,

        #[arg(long)]
        batch_id: String,
    },
}

#[derive(Subcommand)]
enum PrefixAction {
    /// Create or update a prefix configuration from a TOML or JSON file
    Apply {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show a prefix configuration
    Show {
        #[arg(long)]
        prefix: String,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Try to load config for log settings (optional - falls back to JSON at info)
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    // Initialize logging
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_directive()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // Logs go to stderr so command output on stdout stays parseable
    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    let result = execute_command(cli).await;

    match result {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Process { file } => {
            let config = load_config(&cli.config)?;
            commands::process::run(config, file).await?;
        }

        Commands::Serve {
            listen_port,
            metrics_port,
        } => {
            let config = load_config(&cli.config)?;
            commands::serve::run(config, listen_port, metrics_port).await?;
        }

        Commands::Flush { prefix, batch_id } => {
            let config = load_config(&cli.config)?;
            commands::batch::flush(config, &prefix, batch_id).await?;
        }

        Commands::Unlock { prefix, batch_id } => {
            let config = load_config(&cli.config)?;
            commands::batch::unlock(config, &prefix, &batch_id).await?;
        }

        Commands::Batch { action } => {
            let config = load_config(&cli.config)?;
            match action {
                BatchAction::Show { prefix, batch_id } => {
                    commands::batch::show(config, &prefix, &batch_id).await?;
                }
            }
        }

        Commands::Prefix { action } => {
            let config = load_config(&cli.config)?;
            match action {
                PrefixAction::Apply { file } => {
                    commands::prefix::apply(config, &file).await?;
                }
                PrefixAction::Show { prefix } => {
                    commands::prefix::show(config, &prefix).await?;
                }
            }
        }

        Commands::InitSchema { print } => {
            if print {
                commands::prefix::print_schema();
            } else {
                let config = load_config(&cli.config)?;
                commands::prefix::init_schema(config).await?;
            }
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, metrics_url.as_deref()).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config.validate()?;
            println!("Configuration is valid");
        }
    }

    Ok(())
}

fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Ok(Config::from_file(&path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_from_library_errors() {
        let err = anyhow::Error::new(vload_core::Error::Config("bad".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);

        let err = anyhow::Error::new(vload_core::Error::Store(
            vload_core::StoreError::NotFound("configuration for b".into()),
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::StoreError);

        let err = anyhow::Error::new(vload_core::Error::Event(
            vload_core::EventError::MultiRecord(2),
        ));
        assert_eq!(ExitCode::from_error(&err), ExitCode::EventError);
    }

    #[test]
    fn test_exit_code_from_command_errors() {
        let err = anyhow::Error::new(commands::Refused("current batch".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::Refused);

        let err = anyhow::anyhow!("health endpoint unreachable");
        assert_eq!(ExitCode::from_error(&err), ExitCode::HealthCheckError);

        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_reprocess_flush() {
        let cli = Cli::try_parse_from([
            "vload", "flush", "--prefix", "bucket/input", "--batch-id", "b-1",
        ])
        .unwrap();
        match cli.command {
            Commands::Flush { prefix, batch_id } => {
                assert_eq!(prefix, "bucket/input");
                assert_eq!(batch_id.as_deref(), Some("b-1"));
            }
            _ => panic!("expected flush"),
        }
    }
}
