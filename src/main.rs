use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

use edgebot::api::{Exchange, ExchangeClient, Gateway};
use edgebot::config::BotConfig;
use edgebot::discovery::MarketScanner;
use edgebot::execution::{
    ExitEngine, FillConsumer, Orchestrator, OrderTracker, PendingFill, PositionBook, TradeOutcome,
};
use edgebot::models::Position;
use edgebot::persistence::{kv_keys, SqlitePersistence};
use edgebot::risk::SafetyState;
use edgebot::strategy::{ConsensusModel, ManualModel, MomentumModel, ProbabilityModel};

const FILL_CHANNEL_CAPACITY: usize = 256;
const CONSENSUS_CALLS_PER_SECOND: f64 = 2.0;
const PRICE_HISTORY_KEEP_HOURS: i64 = 48;
const MAINTENANCE_INTERVAL_SECS: u64 = 3600;
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Parser)]
#[command(name = "edgebot")]
#[command(about = "Automated trading bot for binary outcome markets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all trading loops (the default)
    Run,
    /// Run a single dry scan cycle (scores markets, places nothing)
    Scan,
    /// Print portfolio and store counters
    Status,
    /// Cancel every tracked open order
    CancelAll,
    /// Clear a persisted kill switch so entries can resume
    Resume,
}

// ============================================================================
// Shared State
// ============================================================================

struct BotContext {
    config: BotConfig,
    store: Arc<SqlitePersistence>,
    exchange: Arc<dyn Exchange>,
    book: Arc<Mutex<PositionBook>>,
    safety: Arc<SafetyState>,
    exits: Arc<Mutex<ExitEngine>>,
    tracker: Arc<OrderTracker>,
    consumer: Arc<FillConsumer>,
    scanner: Arc<MarketScanner>,
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = BotConfig::from_env();
    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!("Config: {issue}");
        }
        anyhow::bail!("{} configuration problem(s), not starting", issues.len());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Scan => scan(config).await,
        Commands::Status => status(config).await,
        Commands::CancelAll => cancel_all(config).await,
        Commands::Resume => resume(config).await,
    }
}

async fn run(config: BotConfig) -> Result<()> {
    tracing::info!("🚀 EdgeBot starting - Multi-Loop Architecture");

    let (ctx, fills_rx) = build_context(config).await?;
    let ctx = Arc::new(ctx);

    if ctx.config.cancel_on_start {
        let cancelled = ctx.tracker.cancel_all().await?;
        if cancelled > 0 {
            tracing::info!("🧹 Start-up cancel: {} open orders", cancelled);
        }
    }

    tracing::info!("📊 Configuration:");
    tracing::info!("  Bankroll:        ${:.2}", ctx.config.bankroll);
    tracing::info!(
        "  Take Profit:     {:.0}%",
        ctx.config.exits.take_profit_pct * 100.0
    );
    tracing::info!(
        "  Stop Loss:       {:.0}%",
        ctx.config.exits.stop_loss_pct * 100.0
    );
    if let Some(trailing) = ctx.config.exits.trailing_stop_pct {
        tracing::info!("  Trailing Stop:   {:.0}%", trailing * 100.0);
    }
    tracing::info!("  Exit Priority:   {:?}", ctx.config.exits.priority);
    tracing::info!("  Max Daily Loss:  ${:.2}", ctx.config.breakers.max_daily_loss);
    tracing::info!(
        "  Max Drawdown:    {:.0}%",
        ctx.config.breakers.max_drawdown_pct * 100.0
    );
    tracing::info!("  Min Edge:        {:.3}", ctx.config.scan.min_edge);

    tracing::info!("🔄 Spawning independent loops...");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Loop 1: poll tracked orders for fills
    let poll_task = {
        let tracker = ctx.tracker.clone();
        let shutdown = shutdown_rx.clone();
        let interval_secs = ctx.config.poll_interval_secs;
        tokio::spawn(async move {
            order_poll_loop(tracker, interval_secs, shutdown).await;
        })
    };

    // Loop 2: apply fills to the position book
    let consumer_task = {
        let consumer = ctx.consumer.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            consumer.run(fills_rx, shutdown).await;
        })
    };

    // Loop 3: watch prices and fire exit directives
    let exit_task = {
        let ctx = ctx.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            exit_monitor_loop(ctx, shutdown).await;
        })
    };

    // Loop 4: scan for new entries
    let scan_task = {
        let scanner = ctx.scanner.clone();
        let shutdown = shutdown_rx.clone();
        let interval_secs = ctx.config.scan_interval_secs;
        tokio::spawn(async move {
            scanner.run(interval_secs, shutdown).await;
        })
    };

    // Loop 5: housekeeping
    let maintenance_task = {
        let store = ctx.store.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            maintenance_loop(store, shutdown).await;
        })
    };

    tracing::info!("✅ All loops spawned");
    tracing::info!("  🔄 Order Poll: every {} sec", ctx.config.poll_interval_secs);
    tracing::info!("  📈 Exit Monitor: every {} sec", ctx.config.tick_interval_secs);
    tracing::info!("  🔍 Market Scan: every {} sec", ctx.config.scan_interval_secs);
    tracing::info!("Press Ctrl+C to stop...");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("⚠️  Received Ctrl+C, shutting down...");

    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    for (name, task) in [
        ("order-poll", poll_task),
        ("fill-consumer", consumer_task),
        ("exit-monitor", exit_task),
        ("market-scan", scan_task),
        ("maintenance", maintenance_task),
    ] {
        match tokio::time::timeout(grace, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("{name} loop panicked: {e}"),
            Err(_) => tracing::warn!("{name} loop did not stop within {SHUTDOWN_GRACE_SECS}s"),
        }
    }

    tracing::info!("👋 EdgeBot stopped");
    Ok(())
}

// ============================================================================
// Initialization
// ============================================================================

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("edgebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wire every component against the store, replaying anything the last
/// run left behind. The returned receiver is the fill channel's read
/// end, consumed by the fill consumer loop.
async fn build_context(config: BotConfig) -> Result<(BotContext, mpsc::Receiver<PendingFill>)> {
    let store = Arc::new(
        SqlitePersistence::new(&config.database_url)
            .await
            .context("Failed to open state store")?,
    );

    let gateway = Gateway::new(config.exchange_calls_per_second);
    let exchange: Arc<dyn Exchange> = Arc::new(ExchangeClient::new(
        config.exchange_base_url.clone(),
        gateway,
    )?);

    // Restore the position book; the kv total is authoritative for
    // realized P&L because closed re-entries replace their row
    let realized_kv = store.get_state_f64(kv_keys::REALIZED_TOTAL).await?;
    let positions = store.load_positions().await?;
    let book = PositionBook::with_positions(positions, realized_kv);
    let realized = book.realized_total();
    let book = Arc::new(Mutex::new(book));

    let kill_switch = store.get_state_bool(kv_keys::KILL_SWITCH).await?;
    let peak_equity = store
        .get_state_f64(kv_keys::PEAK_EQUITY)
        .await?
        .unwrap_or(config.bankroll);
    let day = store
        .get_state(kv_keys::DAY_STAMP)
        .await?
        .and_then(|s| s.parse::<chrono::NaiveDate>().ok())
        .unwrap_or_else(|| Utc::now().date_naive());
    let day_start_realized = store
        .get_state_f64(kv_keys::DAY_START_REALIZED)
        .await?
        .unwrap_or(realized);
    let safety = Arc::new(SafetyState::restore(
        config.bankroll,
        kill_switch,
        realized,
        peak_equity,
        day,
        day_start_realized,
    ));
    if kill_switch {
        tracing::warn!("🛑 Kill switch was engaged on last shutdown; entries stay blocked");
    }

    let directives = store.load_active_auto_orders().await?;
    let exits = Arc::new(Mutex::new(ExitEngine::with_directives(
        directives,
        config.exits.priority,
    )));
    // Directives whose position closed while we were down are dead
    let swept = {
        let open_keys: HashSet<String> = book.lock().unwrap().open_keys().into_iter().collect();
        exits.lock().unwrap().retain_for(&open_keys)
    };
    for directive in &swept {
        store.upsert_auto_order(directive).await?;
    }
    if !swept.is_empty() {
        tracing::info!("Cancelled {} exit directives with no open position", swept.len());
    }

    let (fills_tx, fills_rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
    let tracker = Arc::new(OrderTracker::new(
        exchange.clone(),
        store.clone(),
        fills_tx,
        config.stale_order_secs,
    ));
    let tracked = tracker.restore().await?;
    if tracked > 0 {
        tracing::info!("📋 Resumed tracking {} open orders", tracked);
    }

    let consumer = Arc::new(FillConsumer::new(
        store.clone(),
        book.clone(),
        exits.clone(),
        config.exits.clone(),
        safety.clone(),
    ));
    let replayed = consumer.replay_unapplied().await?;
    if replayed > 0 {
        tracing::info!("♻️  Replayed {} unapplied fills from the store", replayed);
    }

    let orchestrator = Arc::new(Orchestrator::new(
        exchange.clone(),
        store.clone(),
        tracker.clone(),
        book.clone(),
        safety.clone(),
        config.guards.clone(),
        config.breakers.clone(),
        config.intent_ttl_secs,
    ));

    let mut models: Vec<Arc<dyn ProbabilityModel>> = Vec::new();
    if let Some(path) = &config.manual_estimates_path {
        match ManualModel::from_file(path) {
            Ok(model) => {
                tracing::info!("📝 Manual estimates loaded from {path}");
                models.push(Arc::new(model));
            }
            Err(e) => tracing::warn!("Manual estimates not loaded: {e:#}"),
        }
    }
    let consensus = match &config.consensus_base_url {
        Some(base) => {
            let model = Arc::new(
                ConsensusModel::new(base.clone(), Gateway::new(CONSENSUS_CALLS_PER_SECOND))?
                    .with_ttl(Duration::from_secs(config.consensus_ttl_secs)),
            );
            models.push(model.clone() as Arc<dyn ProbabilityModel>);
            Some(model)
        }
        None => None,
    };
    models.push(Arc::new(MomentumModel::default()));
    tracing::info!(
        "🧠 Models: {}",
        models
            .iter()
            .map(|m| m.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let scanner = Arc::new(MarketScanner::new(
        exchange.clone(),
        store.clone(),
        book.clone(),
        safety.clone(),
        orchestrator.clone(),
        models,
        consensus,
        config.scan.clone(),
    ));

    Ok((
        BotContext {
            config,
            store,
            exchange,
            book,
            safety,
            exits,
            tracker,
            consumer,
            scanner,
            orchestrator,
        },
        fills_rx,
    ))
}

// ============================================================================
// Worker Loops
// ============================================================================

async fn order_poll_loop(
    tracker: Arc<OrderTracker>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = tracker.poll_once().await;
                if summary.errors > 0 {
                    tracing::debug!(
                        "Order poll: {} polled, {} errors",
                        summary.polled,
                        summary.errors
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Order poll loop stopped");
}

async fn exit_monitor_loop(ctx: Arc<BotContext>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(ctx.config.tick_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = exit_monitor_tick(&ctx).await {
                    tracing::error!("Exit monitor tick failed: {e:#}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Exit monitor stopped");
}

/// One pass over the open book: refresh quotes, ratchet directives and
/// submit any exit they fire. Sells are priced at the bid so a trigger
/// crosses immediately.
async fn exit_monitor_tick(ctx: &BotContext) -> Result<()> {
    let positions: Vec<Position> = {
        let book = ctx.book.lock().unwrap();
        book.open_positions().into_iter().cloned().collect()
    };
    if positions.is_empty() {
        ctx.safety.set_unrealized(0.0);
        return Ok(());
    }

    let mut marks = HashMap::new();
    for position in &positions {
        let quote = match ctx.exchange.get_price(&position.market).await {
            Ok(quote) => quote,
            Err(e) => {
                tracing::warn!("Price fetch failed for {}: {e:#}", position.market);
                continue;
            }
        };

        ctx.store.save_price_point(&position.market, quote.mid).await?;
        marks.insert(position.key.clone(), quote.mid);

        let outcome = {
            let mut exits = ctx.exits.lock().unwrap();
            exits.on_tick(position, quote.bid)
        };
        if let Some(updated) = &outcome.updated {
            ctx.store.upsert_auto_order(updated).await?;
        }

        if let Some(trigger) = outcome.trigger {
            tracing::info!(
                "🔔 {} hit on {} at {:.3}, selling {:.1}",
                trigger.reason.as_str(),
                trigger.position_key,
                trigger.trigger_price,
                trigger.size
            );
            match ctx
                .orchestrator
                .submit_exit(
                    &trigger.position_key,
                    trigger.size,
                    trigger.trigger_price,
                    trigger.reason.as_str(),
                )
                .await
            {
                Ok(TradeOutcome::Placed { order_id }) => {
                    tracing::info!("Exit order {} placed", order_id);
                }
                Ok(TradeOutcome::Rejected { reason }) => {
                    tracing::warn!("Exit for {} rejected: {}", trigger.position_key, reason);
                }
                Err(e) => {
                    tracing::error!("Exit submit for {} failed: {e:#}", trigger.position_key);
                }
            }
        }
    }

    let unrealized = {
        let book = ctx.book.lock().unwrap();
        book.unrealized_pnl(&marks)
    };
    ctx.safety.set_unrealized(unrealized);
    Ok(())
}

async fn maintenance_loop(store: Arc<SqlitePersistence>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.prune_price_history(PRICE_HISTORY_KEEP_HOURS).await {
                    Ok(pruned) if pruned > 0 => {
                        tracing::debug!("Pruned {pruned} stale price points");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Price history prune failed: {e:#}"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Maintenance loop stopped");
}

// ============================================================================
// One-Shot Commands
// ============================================================================

async fn scan(mut config: BotConfig) -> Result<()> {
    // A zero entry budget turns the cycle into a dry run
    config.scan.max_entries_per_scan = 0;
    let (ctx, _fills_rx) = build_context(config).await?;
    let summary = ctx.scanner.scan_once().await?;
    println!(
        "Scanned {} markets: {} screened out, {} scored (dry run, nothing placed)",
        summary.scanned, summary.screened_out, summary.scored
    );
    Ok(())
}

async fn status(config: BotConfig) -> Result<()> {
    let store = SqlitePersistence::new(&config.database_url)
        .await
        .context("Failed to open state store")?;

    let stats = store.stats().await?;
    let realized_kv = store.get_state_f64(kv_keys::REALIZED_TOTAL).await?;
    let positions = store.load_positions().await?;
    let pending = store.load_open_orders().await?;
    let book = PositionBook::with_positions(positions, realized_kv);
    let book_stats = book.stats();
    // No live quotes here, so the snapshot carries no unrealized P&L
    let snapshot = book.snapshot(pending, &HashMap::new());
    let kill_switch = store.get_state_bool(kv_keys::KILL_SWITCH).await?;
    let last_scan = store.get_state(kv_keys::LAST_SCAN_AT).await?;

    println!("EdgeBot status");
    println!(
        "  Kill switch:     {}",
        if kill_switch { "ENGAGED" } else { "off" }
    );
    println!("  Open positions:  {}", snapshot.open_positions.len());
    for position in &snapshot.open_positions {
        println!(
            "    {} {:.1} @ {:.3}",
            position.key, position.size, position.avg_entry_price
        );
    }
    println!("  Realized P&L:    ${:+.2}", snapshot.realized_pnl);
    println!(
        "  Closed trades:   {} ({} wins, {} losses)",
        book_stats.closed_trades, book_stats.wins, book_stats.losses
    );
    println!("  Pending orders:  {}", snapshot.pending_orders.len());
    for order in &snapshot.pending_orders {
        println!(
            "    {} {:?} {:.1} @ {:.3} ({:?})",
            order.market, order.side, order.size, order.price, order.status
        );
    }
    println!("  Unapplied fills: {}", stats.unapplied_fills);
    println!("  Price points:    {}", stats.price_points);
    if let Some(at) = last_scan {
        println!("  Last scan:       {at}");
    }
    Ok(())
}

async fn cancel_all(config: BotConfig) -> Result<()> {
    let (ctx, _fills_rx) = build_context(config).await?;
    let cancelled = ctx.tracker.cancel_all().await?;
    println!("Cancelled {cancelled} open orders");
    Ok(())
}

async fn resume(config: BotConfig) -> Result<()> {
    let store = SqlitePersistence::new(&config.database_url)
        .await
        .context("Failed to open state store")?;

    if !store.get_state_bool(kv_keys::KILL_SWITCH).await? {
        println!("Kill switch is not engaged");
        return Ok(());
    }
    store.set_state(kv_keys::KILL_SWITCH, "false").await?;
    println!("Kill switch cleared; restart the bot to resume entries");
    Ok(())
}
