//! Entry point. Wires Console -> Reducer -> Streams / Timers / Backend.

mod backend;
mod config;
mod console;
mod controller;
mod driver;
mod error;
mod parser;
mod projector;
mod reconcile;
mod risk;
mod scheduler;
mod state;
mod stream;
mod types;
mod utils;

use std::time::Duration;

use anyhow::Context;
use dotenvy::dotenv;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};
use tracing_subscriber::EnvFilter;

use crate::controller::{AppState, Event};
use crate::parser::Command;
use crate::projector::{describe, project, PlotGeometry};
use crate::scheduler::{RefreshPlan, Scheduler};
use crate::stream::{StreamManager, WsConnector};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    // Load config
    let cfg_path = std::env::var("TRADE_BOARD_CONFIG").unwrap_or_else(|_| "config.yaml".into());
    let cfg = config::AppConfig::load(&cfg_path)?;
    let state_path = cfg.state_path();

    // Local open-position cache; server truth corrects it on every selection
    let positions = state::OpenPositionSet::load(&state_path);
    info!(
        "open-position cache {} ({} legs)",
        state_path.display(),
        positions.len()
    );
    let mut state = AppState::new(&cfg.session.default_ticker, positions);

    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let streams = StreamManager::new(
        WsConnector::new(&cfg.backend.ws_url),
        stream_tx,
        Duration::from_millis(cfg.streams.teardown_timeout_ms),
    );
    let scheduler = Scheduler::new(
        RefreshPlan {
            fast: Duration::from_secs(cfg.refresh.fast_interval_sec),
            slow: Duration::from_secs(cfg.refresh.slow_interval_sec),
            market_open: cfg.market_open()?,
        },
        timer_tx,
    );
    let backend = backend::Backend::new(&cfg.backend)?;
    let mut driver = driver::Driver::new(streams, scheduler, backend, event_tx.clone(), state_path);

    let parser = parser::CommandParser::new().context("compile command patterns")?;
    console::spawn(parser, event_tx.clone()).context("start console")?;

    info!(
        "trade-board started. backend={} ws={} ticker={} fast={}s slow={}s open={}",
        cfg.backend.http_url,
        cfg.backend.ws_url,
        state.ticker,
        cfg.refresh.fast_interval_sec,
        cfg.refresh.slow_interval_sec,
        cfg.refresh.market_open
    );

    let geo = PlotGeometry {
        len: cfg.view.plot_len,
        scale: cfg.view.scale,
    };
    let mut render = tokio::time::interval(Duration::from_millis(cfg.view.render_interval_ms));
    let mut last_frame = String::new();

    let initial = Command::Select(state.ticker.clone());
    let effects = state.apply(Event::User(initial));
    let mut running = driver.execute(effects, &state).await;

    while running {
        let effects = tokio::select! {
            Some(ev) = stream_rx.recv() => {
                if !driver.accepts(&ev) {
                    debug!("stale stream event dropped: {:?}", ev);
                    continue;
                }
                state.apply(Event::Stream(ev))
            }
            Some(ev) = timer_rx.recv() => state.apply(Event::Timer(ev)),
            Some(ev) = event_rx.recv() => state.apply(ev),
            _ = render.tick() => {
                let line = describe(&project(&state, geo));
                if !line.is_empty() && line != last_frame {
                    info!("{}", line);
                    last_frame = line;
                }
                continue;
            }
        };
        running = driver.execute(effects, &state).await;
    }

    info!("shutting down");
    driver.shutdown().await;
    Ok(())
}
