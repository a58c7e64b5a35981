//! hostprep - origin host provisioning
//!
//! # Usage
//!
//! ```bash
//! sudo hostprep                       # Full seven-step setup (same as `setup`)
//! sudo PORT=8443 hostprep setup       # Different service port
//! sudo hostprep firewall              # Only reconcile the proxy allow rules
//! sudo hostprep check                 # Report allow rules that are missing
//! hostprep rules                      # Print the iptables commands that would run
//! hostprep unit                       # Print the rendered systemd unit
//! sudo hostprep unit --install        # Write the unit and reload systemd
//! sudo hostprep --config host.json    # Override defaults from a JSON file
//! ```

use clap::{Parser, Subcommand};
use hostprep::audit::AuditLog;
use hostprep::config::{SetupConfig, resolve_config};
use hostprep::core::error::{CommandErrorPattern, Error, Result};
use hostprep::core::firewall::INPUT_CHAIN;
use hostprep::core::{reconcile, unit};
use hostprep::privilege;
use hostprep::setup;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hostprep", version)]
#[command(about = "Provision an origin host behind Cloudflare", long_about = None)]
struct Cli {
    /// JSON file overriding the built-in defaults
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all provisioning steps
    Setup,
    /// Add missing proxy allow rules and save the ruleset
    Firewall,
    /// List allow rules missing from the running firewall
    Check,
    /// Print the iptables commands for the allow list
    Rules,
    /// Print the systemd unit
    Unit {
        /// Write the unit file and reload systemd instead of printing
        #[arg(long)]
        install: bool,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Commands::Setup);
    match runtime.block_on(handle_cli(command, cli.config)) {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn report_error(err: &Error) {
    eprintln!("✗ {err}");
    if let Error::Command {
        program, message, ..
    } = err
    {
        let translation = CommandErrorPattern::match_error(program, message);
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
    if let Some(stderr) = err.stderr() {
        tracing::debug!("Full stderr:\n{stderr}");
    }
}

async fn handle_cli(command: Commands, config_path: Option<PathBuf>) -> Result<ExitCode> {
    let config = resolve_config(config_path.as_deref()).await?;

    match command {
        Commands::Setup => {
            setup::provision(
                &config,
                privilege::is_root(),
                &mut std::io::stdout(),
                AuditLog::new,
            )
            .await?;
        }
        Commands::Firewall => {
            privilege::ensure_root(privilege::is_root())?;
            let report = reconcile::reconcile(&config.firewall(), &config.allow_list()?).await?;
            println!(
                "✓ {} rule(s) added, {} already present",
                report.inserted_count(),
                report.present_count()
            );
            match report.persisted {
                Some(path) => println!("✓ Rules saved to {}", path.display()),
                None => println!("⚠ Rules not saved; they will be lost on reboot"),
            }
        }
        Commands::Check => {
            privilege::ensure_root(privilege::is_root())?;
            let missing = reconcile::plan(&config.firewall(), &config.allow_list()?).await;
            if missing.is_empty() {
                println!("✓ All allow rules for port {} are present", config.port);
            } else {
                println!("Missing {} rule(s):", missing.len());
                for rule in &missing {
                    println!("  {rule}");
                }
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Rules => {
            print_rules(&config)?;
        }
        Commands::Unit { install } => {
            let spec = config.unit_spec()?;
            if install {
                privilege::ensure_root(privilege::is_root())?;
                let installed =
                    unit::install(&spec, &config.unit_path()?, &config.service_manager()).await?;
                println!("✓ Installed {}", installed.path.display());
            } else {
                print!("{}", unit::render(&spec));
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_rules(config: &SetupConfig) -> Result<()> {
    let list = config.allow_list()?;
    for rule in list.rules() {
        let position = if rule.is_loopback() {
            format!("-I {INPUT_CHAIN} 1")
        } else {
            format!("-A {INPUT_CHAIN}")
        };
        println!(
            "{} {position} {}",
            config.tools.iptables,
            rule.to_iptables_spec().join(" ")
        );
    }
    Ok(())
}
