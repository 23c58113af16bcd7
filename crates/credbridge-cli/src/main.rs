//! credbridge - relays registry credentials from a VM to the host's native store

use clap::{Parser, Subcommand};
use credbridge_cli::commands::{self, LoginArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "credbridge")]
#[command(author, version, about = "Registry credential bridge between a VM and the host keychain", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/credbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State root holding the socket and helper config
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the credential bridge until interrupted
    Serve {
        /// Endpoint type (default from config)
        #[arg(long, value_parser = ["unix", "pipe", "tcp"])]
        transport: Option<String>,
    },

    /// Serve a single request on the connection inherited as stdin
    Inetd,

    /// Verify and store credentials for a registry
    Login {
        /// Registry (default: Docker Hub)
        server: Option<String>,
        /// Username
        #[arg(short, long)]
        username: Option<String>,
        /// Password
        #[arg(short, long, conflicts_with = "password_stdin")]
        password: Option<String>,
        /// Read the password from stdin
        #[arg(long)]
        password_stdin: bool,
    },

    /// Remove stored credentials for a registry
    Logout {
        /// Registry (default: Docker Hub)
        server: Option<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    credbridge_cli::init_logging(if cli.verbose { "debug" } else { "info" });

    let config = commands::load_config(cli.config.as_deref())?;
    let root = commands::resolve_root(&config, cli.root)?;

    match cli.command {
        Commands::Serve { transport } => {
            let transport = transport
                .as_deref()
                .map(commands::parse_transport)
                .transpose()?;
            commands::serve(config, root, transport).await?;
        }
        Commands::Inetd => {
            commands::inetd(config, root).await?;
        }
        Commands::Login {
            server,
            username,
            password,
            password_stdin,
        } => {
            let args = LoginArgs {
                server,
                username,
                password,
                password_stdin,
            };
            commands::login(config, root, args).await?;
        }
        Commands::Logout { server } => {
            commands::logout(config, root, server).await?;
        }
        Commands::Config { init } => {
            commands::config(&config, cli.config.as_deref(), &root, init)?;
        }
    }

    Ok(())
}
