//! Teraleech CLI
//!
//! Command-line interface for the Terabox leech bot

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use teraleech_config::Config;
use teraleech_core::log_buffer::LogBuffer;
use teraleech_core::orchestrator::{OrchestratorSettings, TransferOrchestrator};
use teraleech_core::progress::{ProgressReporter, ReporterSettings};
use teraleech_core::runtime::{AppContext, BotRuntime};
use teraleech_download::aria2::Aria2Client;
use teraleech_download::{format_size, select_backend};
use teraleech_ipc::EventBus;
use teraleech_resolver::HttpLinkResolver;
use teraleech_telegram::TelegramAdapter;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "teraleech")]
#[command(about = "Telegram bot that mirrors Terabox shares into chats", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides `core.log_level`)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Run,

    /// Validate the config file and probe the aria2 daemon
    CheckConfig,

    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.clone())?;
            let log_level = cli
                .log_level
                .clone()
                .or_else(|| config.core.log_level.clone())
                .unwrap_or_else(|| "info".to_string());
            let log_buffer = LogBuffer::default();
            let _logging_guard =
                logging::init_logging(&config.log_dir(), &log_level, log_buffer.layer())?;
            run_bot(config, log_buffer).await?;
        }

        Commands::CheckConfig => {
            let config = load_config(cli.config.clone())?;
            check_config(&config).await;
        }

        Commands::InitConfig { force } => {
            let path = config_path(cli.config.clone())?;
            init_config(&path, force)?;
            println!("Config written to {}", path.display());
            println!("Set telegram.bot_token (or BOT_TOKEN) and telegram.admins before running.");
        }
    }

    Ok(())
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().context("No config directory available, pass --config"),
    }
}

fn load_config(config_path: Option<String>) -> Result<Config> {
    let path = self::config_path(config_path)?;
    Config::load(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, rendered)?;
    Ok(())
}

async fn check_config(config: &Config) {
    println!("Config OK");
    println!("  Data dir:       {}", config.data_dir().display());
    println!("  Temp dir:       {}", config.temp_dir().display());
    println!("  Admins:         {}", config.telegram.admins.len());
    println!(
        "  Dump channel:   {}",
        config
            .telegram
            .dump_channel_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "not set".to_string())
    );
    println!("  Resolver APIs:  {}", config.resolver.api_templates.len());
    println!(
        "  Upload ceiling: {}",
        format_size(config.download.max_upload_bytes as i64)
    );

    let manager = logging::LogManager::new(config.log_dir());
    if let (Ok(files), Ok(size)) = (manager.log_files(), manager.total_size()) {
        println!(
            "  Logs:           {} file(s), {}",
            files.len(),
            format_size(size as i64)
        );
    }

    if !config.aria2.enabled {
        println!("  aria2:          disabled, streaming HTTP will be used");
        return;
    }
    let rpc_url = config.aria2.rpc_url();
    let probe = match Aria2Client::new(&rpc_url, &config.aria2.secret) {
        Ok(client) => client.get_version().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    match probe {
        Ok(version) => println!("  aria2:          {} reachable at {}", version, rpc_url),
        Err(e) => println!(
            "  aria2:          unreachable at {} ({}), streaming HTTP will be used",
            rpc_url, e
        ),
    }
}

async fn run_bot(config: Config, log_buffer: LogBuffer) -> Result<()> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(config.temp_dir())?;

    let event_bus = EventBus::new();
    let adapter = Arc::new(
        TelegramAdapter::new(&config.telegram, data_dir.clone())?
            .with_event_bus(event_bus.clone()),
    );
    let me = adapter
        .get_me()
        .await
        .context("Telegram getMe failed, check telegram.bot_token")?;
    info!(
        "Bot authorized as @{} ({})",
        me.username.as_deref().unwrap_or("unknown"),
        me.id
    );

    let backend = select_backend(&config.aria2, &config.download).await?;
    let engine = backend.kind().to_string();
    let resolver = Arc::new(HttpLinkResolver::new(&config.resolver)?);
    let reporter = Arc::new(ProgressReporter::new(
        adapter.clone(),
        ReporterSettings::from(&config.progress),
    ));
    let orchestrator = Arc::new(TransferOrchestrator::new(
        resolver,
        backend,
        adapter.clone(),
        reporter,
        OrchestratorSettings::from_config(&config, me.username.clone()),
    ));

    let ctx = Arc::new(AppContext::new(
        config,
        adapter.clone(),
        orchestrator,
        log_buffer,
        engine,
    ));
    let runtime = BotRuntime::new(ctx);

    let poller = Arc::clone(&adapter);
    let poll_handle = tokio::spawn(async move {
        if let Err(e) = poller.poll().await {
            error!("Telegram polling stopped: {:#}", e);
        }
    });

    info!("Starting Teraleech runtime...");
    let result = tokio::select! {
        result = runtime.run(&event_bus) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            Ok(())
        }
    };
    poll_handle.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_config_writes_loadable_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        init_config(&path, false).expect("init");

        let written = std::fs::read_to_string(&path).expect("read");
        let parsed: Config = toml::from_str(&written).expect("parse");
        assert_eq!(parsed.aria2.port, 6800);
        assert_eq!(parsed.download.max_upload_bytes, 2 * 1024 * 1024 * 1024);

        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }
}
