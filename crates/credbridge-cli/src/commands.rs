//! Host-side command implementations

use anyhow::{anyhow, bail, Context, Result};
use credbridge_config::{BridgeConfig, TransportKind};
use credbridge_core::{
    verify_login, CredentialBackend, CredentialBridge, CredentialRecord, HelperOutcome,
    NativeBackend, RegistryUrl,
};
use dialoguer::{theme::ColorfulTheme, Input, Password};
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};

/// Load bridge config from an explicit path or the default location
pub fn load_config(path: Option<&Path>) -> Result<BridgeConfig> {
    let config = match path {
        Some(path) => BridgeConfig::load_from(path)?,
        None => BridgeConfig::load()?,
    };
    Ok(config)
}

pub fn parse_transport(value: &str) -> Result<TransportKind> {
    match value {
        "unix" => Ok(TransportKind::Unix),
        "pipe" => Ok(TransportKind::Pipe),
        "tcp" => Ok(TransportKind::Tcp),
        other => Err(anyhow!("unknown transport: {}", other)),
    }
}

/// State root with `--root` taking precedence over config
pub fn resolve_root(config: &BridgeConfig, root: Option<PathBuf>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root),
        None => Ok(config.root_dir()?),
    }
}

/// Run the bridge until Ctrl-C
pub async fn serve(mut config: BridgeConfig, root: PathBuf, transport: Option<TransportKind>) -> Result<()> {
    if let Some(transport) = transport {
        config.bridge.transport = transport;
    }
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create state root {}", root.display()))?;

    let bridge = CredentialBridge::native(config, &root);
    bridge.start(&root).await?;
    if let Some(endpoint) = bridge.endpoint().await {
        eprintln!("Credential bridge listening on {}", endpoint);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    eprintln!("Shutting down");
    bridge.stop().await;
    Ok(())
}

/// Serve the one connection handed over on stdin
pub async fn inetd(config: BridgeConfig, root: PathBuf) -> Result<()> {
    let bridge = CredentialBridge::native(config, &root);
    bridge.serve_inherited().await?;
    Ok(())
}

/// Arguments of `credbridge login`
#[derive(Debug, Default)]
pub struct LoginArgs {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_stdin: bool,
}

pub async fn login(config: BridgeConfig, root: PathBuf, args: LoginArgs) -> Result<()> {
    let registry = RegistryUrl::parse(args.server.as_deref().unwrap_or_default())?;
    let server_url = registry.canonical_identifier();
    let interactive = std::io::stdin().is_terminal();

    let username = match args.username {
        Some(username) => username,
        None if interactive && !args.password_stdin => Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Username")
            .interact_text()?,
        None => bail!("Username is required (-u) when not running interactively"),
    };
    let username = username.trim().to_string();
    if username.is_empty() {
        bail!("Username cannot be empty");
    }
    if username.contains(':') {
        bail!("Username cannot contain ':'");
    }

    let password = if args.password_stdin {
        let mut input = String::new();
        std::io::stdin()
            .read_to_string(&mut input)
            .context("Failed to read password from stdin")?;
        input.trim_end_matches(['\n', '\r']).to_string()
    } else if let Some(password) = args.password {
        tracing::warn!("Using --password on the command line is insecure. Use --password-stdin.");
        password
    } else if interactive {
        Password::with_theme(&ColorfulTheme::default())
            .with_prompt("Password")
            .interact()?
    } else {
        bail!("Cannot prompt for a password from a non-TTY device; use --password-stdin");
    };
    if password.is_empty() {
        bail!("Password cannot be empty");
    }

    verify_login(&registry, &username, &password)
        .await
        .with_context(|| format!("Login to {} failed", server_url))?;

    let backend = NativeBackend::from_config(&config, &root);
    let record = CredentialRecord::new(server_url.clone(), username, password);
    backend
        .store(&registry, &record)
        .await
        .with_context(|| format!("Failed to store credentials for {}", server_url))?;

    println!("Login Succeeded");
    Ok(())
}

pub async fn logout(config: BridgeConfig, root: PathBuf, server: Option<String>) -> Result<()> {
    let registry = RegistryUrl::parse(server.as_deref().unwrap_or_default())?;
    let server_url = registry.canonical_identifier();

    let backend = NativeBackend::from_config(&config, &root);
    match backend.erase(&registry).await? {
        HelperOutcome::NotFound => println!("Not logged in to {}", server_url),
        _ => println!("Removing login credentials for {}", server_url),
    }
    Ok(())
}

/// Print the effective configuration, or write it out with `init`
pub fn config(
    config: &BridgeConfig,
    config_path: Option<&Path>,
    root: &Path,
    init: bool,
) -> Result<()> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => BridgeConfig::config_path()?,
    };

    if init {
        if path.exists() {
            bail!("Config file already exists at {}", path.display());
        }
        match config_path {
            Some(path) => config.save_to(path)?,
            None => config.save()?,
        }
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let note = if path.exists() { "" } else { " (not created yet)" };
    println!("# Config file: {}{}", path.display(), note);
    println!("# State root: {}", root.display());
    println!(
        "# Helper config: {}\n",
        config.docker_config_path(root).display()
    );
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
