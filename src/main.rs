// =============================================================================
// Kestrel Trade Engine — Main Entry Point
// =============================================================================
//
// Wires the core subsystems together and runs them until Ctrl+C:
//   - per-symbol ingestion tasks feeding the timeframe aggregator
//   - a price fanout task driving the position book and trailing controller
//   - a 60-second trailing sweep that catches positions between bar closes
//
// On shutdown, completed real-time aggregates are flushed to the bar store
// and the runtime config is saved atomically.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod broker;
mod config;
mod engine;
mod error;
mod indicators;
mod journal;
mod market_data;
mod position_book;
mod price_bus;
mod trailing;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::BrokerSession;
use crate::config::EngineConfig;
use crate::engine::EngineState;
use crate::price_bus::PriceBus;

/// Cadence of the trailing-stop sweep.
const TRAILING_TICK_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kestrel trade engine starting up");

    let config_path =
        std::env::var("KESTREL_CONFIG").unwrap_or_else(|_| "engine_config.json".into());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("KESTREL_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(symbols = ?config.symbols, "configured symbols");

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(EngineState::new(config)?);

    // In-flight trades reappear as open positions after a restart.
    match state.book.restore_from_journal() {
        Ok(0) => {}
        Ok(n) => info!(count = n, "restored open positions from journal"),
        Err(e) => error!(error = %e, "failed to restore positions from journal"),
    }

    // Arm trailing for restored positions if the defaults say so.
    if state.trailing.defaults_enabled() {
        for symbol in state.book.open_symbols() {
            state.trailing.enable_with_defaults(&symbol);
        }
    }

    // ── 3. Broker session ────────────────────────────────────────────────
    let api_key = std::env::var("KESTREL_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("KESTREL_API_SECRET").unwrap_or_default();
    let (base_url, feed_url) = {
        let cfg = state.config.read();
        (cfg.broker.base_url.clone(), cfg.broker.feed_url.clone())
    };
    let session = Arc::new(BrokerSession::new(api_key, api_secret, base_url, feed_url));

    if let Err(e) = session.connect().await {
        warn!(error = %e, "broker connect failed; live ingestion will retry via the feed");
    }

    // Seed ATR history so trailing has volatility data before the live
    // aggregates catch up.
    if session.is_healthy() {
        let (atr_tf, source_tf, symbols) = {
            let cfg = state.config.read();
            (
                cfg.trailing.atr_timeframe,
                cfg.aggregator.source_timeframe,
                cfg.symbols.clone(),
            )
        };
        let per_bar_sources = (atr_tf.seconds() / source_tf.seconds()).max(1) as u32;

        for symbol in &symbols {
            match session
                .fetch_historical_bars(symbol, atr_tf, chrono::Duration::hours(30))
                .await
            {
                Ok(bars) => {
                    let seeded: Vec<market_data::AggregatedBar> = bars
                        .iter()
                        .map(|b| market_data::AggregatedBar {
                            timestamp: atr_tf.bar_start(b.timestamp),
                            open: b.open,
                            high: b.high,
                            low: b.low,
                            close: b.close,
                            volume: b.volume,
                            source_bar_count: per_bar_sources,
                            complete: true,
                        })
                        .collect();
                    state.aggregator.seed_history(symbol, atr_tf, seeded);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "historical seed failed");
                }
            }
        }
    }

    // ── 4. Price bus: completed smallest-timeframe bars -> book -> trailing
    let (bus, fanout) = PriceBus::new(state.aggregator.smallest_target());
    {
        let callback_bus = bus.clone();
        state
            .aggregator
            .set_on_bar_complete(Box::new(move |symbol, tf, bar| {
                callback_bus.publish(symbol, tf, bar);
                Ok(())
            }));
    }

    let fanout_book = state.book.clone();
    let fanout_trailing = state.trailing.clone();
    tokio::spawn(fanout.run(fanout_book, fanout_trailing));

    // ── 5. Cooperative shutdown signal ───────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // ── 6. Per-symbol ingestion tasks ────────────────────────────────────
    let symbols = state.config.read().symbols.clone();
    for symbol in &symbols {
        let mut bars = session.subscribe_bars(symbol);
        let ingest_state = state.clone();
        let sym = symbol.clone();
        let mut shutdown = shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(symbol = %sym, "ingestion task stopping");
                        return;
                    }
                    bar = bars.recv() => {
                        let Some(bar) = bar else {
                            warn!(symbol = %sym, "bar subscription closed");
                            return;
                        };
                        match ingest_state.aggregator.add_bar(&sym, &bar) {
                            Ok(_completions) => {}
                            Err(e) => {
                                // Out-of-order bars are dropped, not fatal.
                                warn!(symbol = %sym, error = %e, "source bar rejected");
                                ingest_state.push_error(e.to_string());
                            }
                        }
                    }
                }
            }
        });
    }
    info!(count = symbols.len(), "ingestion tasks launched");

    // ── 7. Trailing sweep tick ───────────────────────────────────────────
    {
        let sweep_state = state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(TRAILING_TICK_SECS));
            // A late cycle is skipped rather than accumulating backlog.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("trailing sweep stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let adjustments = sweep_state.trailing.check_and_update_all();
                        if !adjustments.is_empty() {
                            info!(count = adjustments.len(), "trailing sweep adjusted stops");
                        }
                    }
                }
            }
        });
    }

    info!("all subsystems running; press Ctrl+C to stop");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);
    session.disconnect();

    // Persist real-time aggregates and the runtime config.
    state.flush_aggregates_to_store();
    if let Err(e) = state.config.read().save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    let portfolio = state.portfolio();
    info!(
        open_positions = portfolio.positions_count,
        realized_pnl = portfolio.realized_pnl,
        unrealized_pnl = portfolio.unrealized_pnl,
        "Kestrel trade engine shut down complete"
    );
    Ok(())
}
