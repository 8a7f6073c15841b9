use clap::Parser;
use opflex_server::{
    config::Config,
    constants::*,
    events::{dispatcher, model::LogLevel},
    store::MemoryStore,
    PolicyServer,
};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about = "OpFlex-style policy repository")]
struct Args {
    /// Optional path to config file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Policy document (JSON array of objects) loaded before serving
    #[arg(short, long)]
    policy: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        let cfg = Config::load(&config_path)?;
        println!("{}Loaded config from: {}", ICON_PLACEHOLDER, config_path);
        cfg
    } else {
        println!(
            "⚠️ No config file found at '{}', falling back to default config.",
            config_path
        );
        Config::default()
    };

    // events first so the server's startup is logged
    opflex_server::events::init_events_from_config(config.logging.as_ref()).await;
    dispatcher::emit_system_event(
        "main",
        LogLevel::Info,
        "starting",
        Some(full_version()),
    );

    let store = Arc::new(MemoryStore::new());
    let mut server = PolicyServer::new(config, store);
    if let Some(policy) = args.policy.as_deref() {
        match server.read_policy(policy) {
            Ok(n) => println!("{}Loaded {} policy objects from {}", ICON_PLACEHOLDER, n, policy),
            Err(e) => {
                eprintln!("❌ Failed to read policy '{}': {}", policy, e);
                std::process::exit(1);
            }
        }
    }

    let addr = server.start()?;
    println!(
        "{}{} {} listening on {} (roles: {})",
        ICON_PLACEHOLDER,
        DEFAULT_APP_NAME,
        full_version(),
        addr,
        server.roles()
    );

    signal::ctrl_c().await?;
    println!("{}Shutting down...", ICON_PLACEHOLDER);
    let report = tokio::task::spawn_blocking(move || server.stop()).await??;
    println!(
        "{}Closed {} connection(s), {} flushed cleanly",
        ICON_PLACEHOLDER, report.closed, report.flushed
    );
    for (id, bytes) in &report.truncated {
        println!("⚠️ {} truncated: {} queued bytes discarded", id, bytes);
    }
    Ok(())
}
