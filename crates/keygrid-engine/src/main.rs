/*
[INPUT]:  CLI arguments, YAML configuration file, OS shutdown signals
[OUTPUT]: Grid run loop, one-shot migrations and operator maintenance commands
[POS]:    Binary entry point
[UPDATE]: When changing CLI subcommands, startup flow, or shutdown handling
*/

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use keygrid_engine::persistence::StateStore;
use keygrid_engine::rebuild::TxLogStore;
use keygrid_engine::trade_store::TradeStore;
use keygrid_engine::{
    run_grid, GridConfig, GridEngine, LogNotifier, RebuildTrigger, TargetPrices,
};
use keygrid_exchange::PaperExchange;

#[derive(Parser, Debug)]
#[command(name = "keygrid", version, about = "Slot grid reconciliation and migration engine")]
struct Cli {
    #[arg(long = "config", value_name = "PATH", global = true, default_value = "keygrid.yaml")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run Recon and fill polling against the paper venue
    Run {
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Print the persisted grid and any pending migration
    Status,
    /// Move the grid onto a new price list
    Migrate {
        /// Comma-separated prices, highest first
        #[arg(long, value_name = "P1,P2,...")]
        prices: String,
        /// Current market price
        #[arg(long, value_name = "CURRENT")]
        price: Decimal,
        #[arg(long, default_value = "manual_rebuild")]
        trigger: RebuildTrigger,
    },
    /// Remove an ALARM transaction log and resync slot orders
    ClearAlarm {
        #[arg(long)]
        yes: bool,
    },
    /// Clear inventory and fill counters
    ResetCounters {
        #[arg(long)]
        reason: String,
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let config = load_config(&args.config_path)?;
    let _guard = init_tracing(&args.log_level, config.log_dir.as_deref())?;

    info!(
        config_path = %args.config_path.display(),
        symbol = %config.symbol,
        "keygrid starting"
    );

    match args.command {
        Command::Run { dry_run } => run(config, dry_run).await,
        Command::Status => status(&config).await,
        Command::Migrate {
            prices,
            price,
            trigger,
        } => migrate(config, &prices, price, trigger).await,
        Command::ClearAlarm { yes } => clear_alarm(config, yes).await,
        Command::ResetCounters { reason, yes } => reset_counters(config, &reason, yes).await,
    }
}

async fn run(config: GridConfig, dry_run: bool) -> Result<()> {
    if dry_run {
        info!("dry-run requested; configuration validated");
        println!("{}", style("Configuration is valid.").green());
        return Ok(());
    }

    let engine = Arc::new(build_engine(config, None)?);
    engine.bootstrap().await.context("bootstrap grid")?;

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());
    run_grid(engine, shutdown).await.context("grid run loop")?;
    info!("keygrid stopped");
    Ok(())
}

async fn status(config: &GridConfig) -> Result<()> {
    let state = StateStore::new(&config.state_dir, &config.symbol);
    let logs = TxLogStore::new(&config.state_dir, &config.symbol);
    let trades = TradeStore::new(&config.state_dir, &config.symbol);

    println!("{}", style(format!("keygrid {}", config.symbol)).bold().cyan());
    match state.load().await? {
        Some(snapshot) => {
            println!("updated: {}", snapshot.updated_at);
            println!("{}", style("Active slots").bold());
            for slot in &snapshot.store.slots {
                println!(
                    "  #{:<4} {:>14} {:<4} fills={} order={}",
                    slot.id(),
                    slot.price(),
                    slot.direction(),
                    slot.fill_count(),
                    slot.active_order_id().unwrap_or("-")
                );
            }
            if !snapshot.store.retired_slots.is_empty() {
                println!("{}", style("Retired slots").bold());
                for slot in &snapshot.store.retired_slots {
                    println!("  #{:<4} {:>14} fills={}", slot.id(), slot.price(), slot.fill_count());
                }
            }
            println!("inventory records: {}", snapshot.store.inventory.len());
            if let Some(last) = snapshot.history.last() {
                println!(
                    "last rebuild: {} ({}) {} placed={} failed={}",
                    last.id, last.trigger, last.phase, last.placed, last.failed
                );
            }
        }
        None => println!("{}", style("No snapshot found.").yellow()),
    }

    match logs.load().await? {
        Some(log) if log.needs_intervention() => {
            println!(
                "{} rebuild {}: {}",
                style("ALARM").red().bold(),
                log.id,
                log.error_message.as_deref().unwrap_or("operator action required")
            );
        }
        Some(log) => println!(
            "{} rebuild {} in phase {}",
            style("Pending").yellow().bold(),
            log.id,
            log.phase
        ),
        None => println!("no pending migration"),
    }

    let recent = trades.load_recent(5).await?;
    if !recent.is_empty() {
        println!("{}", style("Recent fills").bold());
        for record in recent {
            println!(
                "  {} {} {} @ {} slot={}",
                record.timestamp,
                record.side,
                record.qty,
                record.price,
                record.slot_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }
    }
    Ok(())
}

async fn migrate(config: GridConfig, prices: &str, price: Decimal, trigger: RebuildTrigger) -> Result<()> {
    let prices = TargetPrices::parse(prices).context("parse target prices")?;
    let engine = build_engine(config, Some(price))?;
    engine.bootstrap().await.context("bootstrap grid")?;
    let record = engine
        .migrate(prices, price, trigger)
        .await
        .context("run migration")?;
    println!(
        "{} rebuild {} cancelled={} placed={} failed={}",
        style("Migrated").green().bold(),
        record.id,
        record.cancelled,
        record.placed,
        record.failed
    );
    Ok(())
}

async fn clear_alarm(config: GridConfig, yes: bool) -> Result<()> {
    if !yes && !confirm("Remove the ALARM transaction log and resync slots?")? {
        println!("{}", style("Aborted.").yellow());
        return Ok(());
    }
    let engine = build_engine(config, None)?;
    bootstrap_allowing_alarm(&engine).await?;
    if engine.clear_alarm().await.context("clear alarm")? {
        println!("{}", style("ALARM cleared.").green());
    } else {
        println!("{}", style("No ALARM pending.").yellow());
    }
    Ok(())
}

async fn reset_counters(config: GridConfig, reason: &str, yes: bool) -> Result<()> {
    if !yes && !confirm("Clear all inventory records and fill counters?")? {
        println!("{}", style("Aborted.").yellow());
        return Ok(());
    }
    let engine = build_engine(config, None)?;
    bootstrap_allowing_alarm(&engine).await?;
    engine
        .reset_fill_counters(reason)
        .await
        .context("reset fill counters")?;
    println!("{}", style("Fill counters reset.").green());
    Ok(())
}

fn build_engine(config: GridConfig, price: Option<Decimal>) -> Result<GridEngine<PaperExchange>> {
    let mark_price = price
        .or(config.paper.initial_price)
        .context("paper.initial_price must be set for the paper venue")?;
    let exchange = PaperExchange::new(config.contract.clone(), mark_price, config.paper.initial_holdings);
    Ok(GridEngine::new(config, Arc::new(exchange), Arc::new(LogNotifier)))
}

async fn bootstrap_allowing_alarm(engine: &GridEngine<PaperExchange>) -> Result<()> {
    match engine.bootstrap().await {
        Ok(_) => Ok(()),
        Err(err) if err.is_alarm() => {
            warn!(error = %err, "grid is in ALARM");
            Ok(())
        }
        Err(err) => Err(err).context("bootstrap grid"),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    let theme = ColorfulTheme::default();
    let confirmed = Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "keygrid.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(guard)
}

fn load_config(path: &Path) -> Result<GridConfig> {
    if !path.exists() {
        bail!("config file not found: {}", path.display());
    }
    GridConfig::from_file(path).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
