#![deny(unsafe_code)]

mod commands;
mod exit_code;
mod output;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use filegate_core::authz::{Account, Identity, Role, StaticPolicy, StaticRoles};
use filegate_core::{Config, FileService, VirtualFs};

use crate::commands::{config, index, link, ls, search, unarchive, vpath, watch};

/// Operator tooling for a filegate root
#[derive(Parser)]
#[command(name = "filegate")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Rebuild the path index
    filegate --root /srv/files index

    # Find files below a directory
    filegate --root /srv/files search report --dir finance

    # Encode a directory as a virtual root name
    filegate vpath encode team/photos

    # Extract an archive and stream progress
    filegate --root /srv/files unarchive drop/bundle.zip
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file (default: platform config dir)
    #[arg(long, env = "FILEGATE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Served root, overriding the configuration
    #[arg(long, env = "FILEGATE_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Token signing secret, overriding the configuration
    #[arg(long, env = "FILEGATE_JWT_SECRET", hide_env_values = true, global = true)]
    jwt_secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the path index from disk
    Index(index::Args),

    /// Search the index
    Search(search::Args),

    /// List a directory
    Ls(ls::Args),

    /// Follow index changes until interrupted
    Watch(watch::Args),

    /// Extract an archive next to itself
    Unarchive(unarchive::Args),

    /// Mint a download link
    Link(link::Args),

    /// Encode or decode virtual path names
    Vpath(vpath::Args),

    /// Print the effective configuration
    Config(config::Args),
}

/// The operator's view: a service plus a privileged filesystem.
pub struct App {
    pub service: FileService,
    pub fs: VirtualFs,
    pub operator: Identity,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = exit_code::categorize(&e);
            let is_quiet = std::env::args().any(|a| a == "-q" || a == "--quiet");
            if !is_quiet {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    // Commands that never touch the served root
    match &cli.command {
        Commands::Vpath(args) => return vpath::execute(args),
        Commands::Config(args) => return config::execute(&load_config(&cli)?, args),
        _ => {}
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(async {
        let mut app = build_app(&cli)?;
        match &cli.command {
            Commands::Index(args) => index::execute(&app, args).await,
            Commands::Search(args) => search::execute(&mut app, args).await,
            Commands::Ls(args) => ls::execute(&app, args).await,
            Commands::Watch(args) => watch::execute(&mut app, args).await,
            Commands::Unarchive(args) => unarchive::execute(&mut app, args).await,
            Commands::Link(args) => link::execute(&app, args).await,
            Commands::Vpath(_) | Commands::Config(_) => Ok(()),
        }
    })
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(root) = &cli.root {
        config.root.clone_from(root);
    }
    if let Some(secret) = &cli.jwt_secret {
        config.session.jwt_secret.clone_from(secret);
    }
    if config.session.jwt_secret.is_empty() {
        // Links minted by this process only need to verify within it.
        config.session.jwt_secret = process_secret();
    }
    Ok(config)
}

fn build_app(cli: &Cli) -> Result<App> {
    let config = load_config(cli)?;
    let root = config.root.clone();
    if !root.is_dir() {
        anyhow::bail!("root is not a directory: {}", root.display());
    }
    let operator = Identity::new(
        &Account {
            id: 0,
            name: "operator".to_string(),
        },
        &Role {
            key: config.admin_role.clone(),
            name: "Operator".to_string(),
        },
        &config.admin_role,
    );
    let service = FileService::new(config, Arc::new(StaticPolicy::new()), Arc::new(StaticRoles::new()))
        .with_context(|| format!("failed to open {}", root.display()))?;
    let fs = service.vfs(operator.clone());
    Ok(App {
        service,
        fs,
        operator,
    })
}

fn process_secret() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("filegate-local-{}-{nanos}", std::process::id())
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}
