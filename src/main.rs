use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wallet_tracker::chains::{BscScanAdapter, ChainAdapter, TronGridAdapter};
use wallet_tracker::config::{self, Settings, DEFAULT_CONFIG_FILE};
use wallet_tracker::metrics::{start_metrics_server, Metrics};
use wallet_tracker::models::Chain;
use wallet_tracker::monitor::{ChainWatch, Monitor};
use wallet_tracker::state::StateStore;
use wallet_tracker::telegram::TelegramNotifier;

mod notifier_builder;

#[derive(Parser)]
#[clap(author, version, about)]
struct Cli {
    /// TOML settings file. `TRACKER_*` environment variables override it.
    #[clap(env = "TRACKER_CONFIG", long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the wallets and notify on incoming transfers (default)
    Run,
    /// Print and reply with the id of every chat that messages the bot
    ChatId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let settings = config::load(&cli.config)?;
            init_tracing(&settings.log_level, settings.log_json);
            run(settings).await
        }
        Command::ChatId => {
            init_tracing("info", false);
            chat_id(&cli.config).await
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    log_banner(&settings);

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::new()?);
    if let Some(port) = settings.metrics_port {
        start_metrics_server(Arc::clone(&metrics), port, cancel.clone());
    }

    let notifier = notifier_builder::build_notifier(&settings)?;
    let watches = build_watches(&settings)?;
    let mut monitor = Monitor::new(
        watches,
        notifier,
        StateStore::new(settings.state_file.clone()),
        settings.min_amount,
        settings.schedule(),
        metrics,
    );

    spawn_stop_signal(cancel.clone());
    monitor.run(&cancel).await;
    cancel.cancel();
    info!("Stopped");
    Ok(())
}

fn build_watches(settings: &Settings) -> anyhow::Result<Vec<ChainWatch>> {
    let timeout = settings.request_timeout();
    settings
        .wallets()
        .into_iter()
        .map(|wallet| -> anyhow::Result<ChainWatch> {
            let adapter: Box<dyn ChainAdapter> = match wallet.chain {
                Chain::Tron => Box::new(TronGridAdapter::new(
                    settings.trongrid_url.as_str(),
                    settings.trongrid_api_key.clone(),
                    settings.trc20_page_limit,
                    timeout,
                )?),
                Chain::Bsc => Box::new(BscScanAdapter::new(
                    settings.bscscan_url.as_str(),
                    settings.bscscan_api_key.clone(),
                    settings.bep20_page_limit,
                    timeout,
                )?),
            };
            Ok(ChainWatch::new(adapter, wallet))
        })
        .collect()
}

fn log_banner(settings: &Settings) {
    let key_state = |key: &Option<String>| {
        if key.as_deref().is_some_and(|k| !k.trim().is_empty()) {
            "set"
        } else {
            "not set"
        }
    };

    info!("Wallet tracker {} starting", env!("CARGO_PKG_VERSION"));
    for wallet in settings.wallets() {
        let tokens: Vec<&str> = wallet.contracts.iter().map(|c| c.token.symbol()).collect();
        info!(
            "[{}] tracking {} for {}",
            wallet.chain,
            wallet.wallet,
            tokens.join(", ")
        );
    }
    info!(
        "Minimum amount {}, polling every {}s",
        settings.min_amount, settings.poll_interval_secs
    );
    info!(
        "TronGrid API key {}, BscScan API key {}",
        key_state(&settings.trongrid_api_key),
        key_state(&settings.bscscan_api_key)
    );
    info!("State file {}", settings.state_file.display());
}

fn spawn_stop_signal(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for the stop signal: {}", e);
            return;
        }
        info!("Stop signal received");
        cancel.cancel();
    });
}

/// Long-polls the bot so an operator can find the chat id to configure.
async fn chat_id(config_path: &Path) -> anyhow::Result<()> {
    let telegram = config::load_telegram(config_path)?;
    let bot = TelegramNotifier::new(telegram, Duration::from_secs(15))?;

    let cancel = CancellationToken::new();
    spawn_stop_signal(cancel.clone());

    println!("Send a message to the bot, or in the group or topic it should post to.");
    println!("Press Ctrl-C to stop.");

    let mut offset = 0;
    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            result = bot.poll_updates(offset) => result,
        };
        match updates {
            Ok(updates) => {
                for chat in &updates.chats {
                    let name = chat
                        .title
                        .as_deref()
                        .or(chat.username.as_deref())
                        .or(chat.first_name.as_deref())
                        .unwrap_or("unknown");
                    match chat.topic_id {
                        Some(topic) => println!(
                            "chat_id = {}, topic_id = {} ({})",
                            chat.chat_id, topic, name
                        ),
                        None => println!("chat_id = {} ({})", chat.chat_id, name),
                    }
                    if let Err(e) = bot.reply_with_chat_id(chat).await {
                        warn!("Could not reply to chat {}: {}", chat.chat_id, e);
                    }
                }
                if let Some(last) = updates.last_update_id {
                    offset = last + 1;
                }
            }
            Err(e) => {
                warn!("getUpdates failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                }
            }
        }
    }
    Ok(())
}
