//! Binary entry point for deskbase.
//!
//! Operator CLI for the feedback desk's storage core.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use deskbase::cli::{
    AuditCommand, CliContext, ConfigureCommand, QueryCommand, RateLimitCommand, StatusCommand,
    parse_param,
};
use deskbase::config::{ConfigLoader, DEFAULT_RELATIONAL_PORT, ENV_HOME, EnvSource};
use deskbase::observability::{self, LoggingConfig};
use deskbase::storage::migrations;
use deskbase::{ConfigDescriptor, Result};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;

/// Deskbase - storage and side-effect core for a library feedback desk.
#[derive(Parser)]
#[command(name = "deskbase")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding `config/database.json` and `data/`.
    #[arg(long, global = true, env = ENV_HOME)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show configuration and backend status.
    Status,

    /// Validate, save and activate a database configuration.
    Configure {
        /// Target backend.
        #[command(subcommand)]
        target: ConfigureTarget,
    },

    /// Apply pending schema migrations.
    Migrate,

    /// Run one SQL statement with `?` placeholders.
    Query {
        /// The statement.
        sql: String,

        /// Positional parameter (repeatable). JSON scalars bind as their type.
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// List recent audit entries.
    Audit {
        /// Maximum number of entries.
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Maintain rate-limit counters.
    RateLimit {
        /// Rate-limit subcommand.
        #[command(subcommand)]
        action: RateLimitAction,
    },
}

/// Configure targets.
#[derive(Subcommand)]
enum ConfigureTarget {
    /// Local `SQLite` file under the data directory.
    Embedded,

    /// PostgreSQL server.
    Relational {
        /// Server host.
        #[arg(long)]
        host: String,

        /// Server port.
        #[arg(long, default_value_t = DEFAULT_RELATIONAL_PORT)]
        port: u16,

        /// User name.
        #[arg(short, long)]
        user: String,

        /// Password.
        #[arg(long, env = "DB_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,

        /// Database name; created if missing.
        #[arg(short, long)]
        database: String,
    },
}

/// Rate-limit subcommands.
#[derive(Subcommand)]
enum RateLimitAction {
    /// Clear one client's counter.
    Reset {
        /// Client key, e.g. `ip:192.0.2.1`.
        key: String,
    },

    /// Delete counters whose window has ended.
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Err(e) = observability::init(LoggingConfig::from_env(&EnvSource::process(), cli.verbose))
    {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let home = cli.home.clone().unwrap_or_else(|| PathBuf::from("."));
    let ctx = CliContext::new(ConfigLoader::from_env(home));

    let result = run_command(cli.command, &ctx).await;
    ctx.shutdown().await;

    match result {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            },
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            },
        },
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
async fn run_command(command: Commands, ctx: &CliContext) -> Result<Value> {
    match command {
        Commands::Status => StatusCommand::new().run(ctx).await,

        Commands::Configure { target } => {
            ConfigureCommand::new(descriptor_for(target))
                .run(ctx)
                .await
        },

        Commands::Migrate => cmd_migrate(ctx).await,

        Commands::Query { sql, params } => {
            let params = params.iter().map(|p| parse_param(p)).collect();
            QueryCommand::new(sql, params).run(ctx).await
        },

        Commands::Audit { limit } => AuditCommand::new(limit).run(ctx).await,

        Commands::RateLimit { action } => {
            let command = match action {
                RateLimitAction::Reset { key } => RateLimitCommand::Reset { key },
                RateLimitAction::Purge => RateLimitCommand::Purge,
            };
            command.run(ctx).await
        },
    }
}

fn descriptor_for(target: ConfigureTarget) -> ConfigDescriptor {
    match target {
        ConfigureTarget::Embedded => ConfigDescriptor::embedded(),
        ConfigureTarget::Relational {
            host,
            port,
            user,
            password,
            database,
        } => ConfigDescriptor::relational(host, user, database)
            .with_port(port)
            .with_password(password),
    }
}

/// Connecting applies pending migrations; a second pass reports nothing new.
async fn cmd_migrate(ctx: &CliContext) -> Result<Value> {
    let backend = ctx.connect().await?;
    let applied = migrations::run(&backend).await?;
    let version = migrations::current_version(&backend).await?;
    Ok(json!({
        "applied": applied,
        "version": version,
        "kind": backend.kind().as_str(),
    }))
}
