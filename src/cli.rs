// CLI module - command-line argument parsing and handlers
//
// Running with no subcommand starts the server. The config subcommand
// inspects the layered configuration without starting anything.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// Parley - experiment orchestration server
#[derive(Parser)]
#[command(name = "parley")]
#[command(version = VERSION)]
#[command(about = "Experiment orchestration server for multi-stage studies", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration (secrets masked)
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle CLI commands. Returns true if a command was handled (exit after).
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { show, path }) => {
            if path {
                handle_config_path();
            } else if show {
                handle_config_show();
            } else {
                println!("Usage: parley config [--show|--path]");
                println!();
                println!("Options:");
                println!("  --show    Display effective configuration (secrets masked)");
                println!("  --path    Show config file path");
            }
            true
        }
        None => false, // No subcommand, run the server
    }
}

fn handle_config_path() {
    match Config::config_path() {
        Some(path) => println!("{}", path.display()),
        None => {
            eprintln!("Error: Could not determine config path");
            std::process::exit(1);
        }
    }
}

fn handle_config_show() {
    let config = Config::from_env();
    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("{}", config.display());
}
