//! `fibrelay`: the operator-facing binary. Mirrors `dxid-cli`'s
//! `Init`/`Node`/`Wallet` subcommand shape, narrowed to this
//! system's three concerns: writing a starter config, running the engine +
//! HTTP control surface, and managing the vault password verifier.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fibrelay_app::App;
use fibrelay_config::FibrelayConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fibrelay", version, about = "Bitcoin fund-relay orchestrator")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "fibrelay.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config.toml to disk, pointing at the public
    /// Blockstream/mempool.space endpoints.
    InitConfig,
    /// Run the relay engine and the HTTP control surface until killed.
    Serve,
    /// Vault password-verifier management.
    Vault {
        #[command(subcommand)]
        cmd: VaultCmd,
    },
}

#[derive(Subcommand)]
enum VaultCmd {
    /// Store a password verifier for the configured vault master password.
    /// Refuses to overwrite an existing verifier.
    SetPassword {
        #[arg(long)]
        password: String,
    },
    /// Check a candidate password against the stored verifier.
    Verify {
        #[arg(long)]
        password: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::InitConfig => {
            init_config(&cli.config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let config = FibrelayConfig::load(&cli.config)
                .with_context(|| format!("loading config from {:?}", cli.config))?;
            let bind_addr = config.http.bind_addr.clone();
            let app = Arc::new(App::new(config).await?);
            fibrelay_server::serve(app, &bind_addr).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Vault { cmd } => {
            let config = FibrelayConfig::load(&cli.config)
                .with_context(|| format!("loading config from {:?}", cli.config))?;
            vault_command(config, cmd).await
        }
    }
}

fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        println!("config already exists at {path:?}, leaving it untouched");
        return Ok(());
    }
    let cfg = FibrelayConfig::example();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, toml::to_string_pretty(&cfg)?)?;
    println!("wrote starter config to {path:?}");
    println!("set FIBRELAY__VAULT__PASSWORD before running `fibrelay serve`");
    Ok(())
}

async fn vault_command(config: FibrelayConfig, cmd: VaultCmd) -> Result<ExitCode> {
    // Vault commands only need the Store and the master password, not a
    // running engine or live chain/fee adapters, but `App::new` wires all
    // of them up uniformly; that's one extra reqwest::Client construction
    // (no network calls) and is not worth a second code path.
    let app = App::new(config).await?;
    match cmd {
        VaultCmd::SetPassword { password } => {
            app.vault_set_password(&password).await?;
            println!("vault password verifier stored");
            Ok(ExitCode::SUCCESS)
        }
        VaultCmd::Verify { password } => {
            if app.vault_verify(&password).await? {
                println!("password verified");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("password does not match");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
