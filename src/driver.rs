//! Executes reducer effects against streams, timers, the backend and the cache.

use std::{path::PathBuf, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::backend::Backend;
use crate::controller::{AppState, Effect, Event, Request, Response};
use crate::scheduler::Scheduler;
use crate::stream::{Connector, StreamEvent, StreamManager};

pub struct Driver<C: Connector> {
    streams: StreamManager<C>,
    scheduler: Scheduler,
    backend: Arc<Backend>,
    events: mpsc::UnboundedSender<Event>,
    state_path: PathBuf,
}

impl<C: Connector> Driver<C> {
    pub fn new(
        streams: StreamManager<C>,
        scheduler: Scheduler,
        backend: Backend,
        events: mpsc::UnboundedSender<Event>,
        state_path: PathBuf,
    ) -> Self {
        Self {
            streams,
            scheduler,
            backend: Arc::new(backend),
            events,
            state_path,
        }
    }

    /// Stream events from a handle that is no longer current are dropped here.
    pub fn accepts(&self, ev: &StreamEvent) -> bool {
        self.streams.is_current(ev.handle())
    }

    /// Run effects in order. Returns false once a quit was requested.
    pub async fn execute(&mut self, effects: Vec<Effect>, state: &AppState) -> bool {
        for effect in effects {
            match effect {
                Effect::Subscribe { channel, hello } => {
                    self.streams.subscribe(channel, hello).await;
                }
                Effect::Unsubscribe(channel) => {
                    if let Some(handle) = self.streams.current(channel) {
                        self.streams.unsubscribe(handle).await;
                    }
                }
                Effect::Fetch(req) => self.spawn_fetch(req),
                Effect::Schedule(ctx) => {
                    self.scheduler.activate(ctx);
                    if let Some(armed) = self.scheduler.context() {
                        debug!(
                            "{} refresh timers armed for {} (gen {})",
                            self.scheduler.armed_count(),
                            armed.ticker,
                            armed.generation
                        );
                    }
                }
                Effect::Persist => {
                    if let Err(e) = state.positions.save(&self.state_path) {
                        error!("open-position cache write failed: {:#}", e);
                    } else {
                        debug!("open-position cache saved ({} legs)", state.positions.len());
                    }
                }
                Effect::Quit => return false,
            }
        }
        true
    }

    fn spawn_fetch(&self, req: Request) {
        let backend = Arc::clone(&self.backend);
        let tx = self.events.clone();
        tokio::spawn(async move {
            let resp = perform(&backend, req).await;
            let _ = tx.send(Event::Response(resp));
        });
    }

    pub async fn shutdown(&mut self) {
        self.scheduler.cancel();
        self.streams.shutdown().await;
    }
}

async fn perform(backend: &Backend, req: Request) -> Response {
    match req {
        Request::Stat { ticker } => {
            let result = backend.stat(&ticker).await;
            Response::Stat { ticker, result }
        }
        Request::Factors { ticker } => {
            let result = backend.factors(&ticker).await;
            Response::Factors { ticker, result }
        }
        Request::Capflow { ctx } => {
            let result = backend.capflow(&ctx.ticker).await;
            Response::Capflow { ctx, result }
        }
        Request::Corr { ctx } => {
            let result = backend.corr(&ctx.ticker).await;
            Response::Corr { ctx, result }
        }
        Request::Position { ticker, seq } => {
            let result = backend.position(&ticker).await;
            Response::Position { ticker, seq, result }
        }
        Request::Order(request) => {
            let result = backend.order(&request).await;
            Response::Order { request, result }
        }
        Request::Cancel(id) => {
            let result = backend.cancel(&id).await;
            Response::Cancel { id, result }
        }
        Request::Preview { ticker, leg } => {
            let result = backend.preview(&ticker, leg).await;
            Response::Preview { ticker, leg, result }
        }
        Request::Pricing(query) => {
            let result = backend.pricing(&query).await;
            Response::Pricing { query, result }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendCfg;
    use crate::parser::Command;
    use crate::scheduler::RefreshPlan;
    use crate::state::OpenPositionSet;
    use crate::stream::mock::MockConnector;
    use crate::types::{Channel, Leg, OptionContract};
    use chrono::NaiveTime;
    use std::time::Duration;

    fn driver(dir: &std::path::Path) -> (Driver<MockConnector>, MockConnector) {
        let (stream_tx, _stream_rx) = mpsc::unbounded_channel();
        let (timer_tx, _timer_rx) = mpsc::unbounded_channel();
        let (event_tx, _event_rx) = mpsc::unbounded_channel();
        let conn = MockConnector::default();
        let streams = StreamManager::new(conn.clone(), stream_tx, Duration::from_millis(200));
        let scheduler = Scheduler::new(
            RefreshPlan {
                fast: Duration::from_secs(60),
                slow: Duration::from_secs(300),
                market_open: NaiveTime::from_hms_opt(21, 30, 5).unwrap(),
            },
            timer_tx,
        );
        let backend = Backend::new(&BackendCfg {
            http_url: "http://127.0.0.1:9".into(),
            ws_url: "ws://127.0.0.1:9".into(),
            timeout_sec: 1,
        })
        .unwrap();
        (
            Driver::new(streams, scheduler, backend, event_tx, dir.join("open.json")),
            conn,
        )
    }

    #[tokio::test]
    async fn repeated_ticker_switches_keep_one_transport_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, conn) = driver(dir.path());
        let mut st = AppState::new("tsla", OpenPositionSet::default());

        for (i, tk) in ["tsla", "aapl", "meta", "tsla"].iter().enumerate() {
            let mut fx = st.apply(Event::User(Command::Select(tk.to_string())));
            fx.retain(|e| !matches!(e, Effect::Fetch(_)));
            assert!(d.execute(fx, &st).await);
            st.board_live = true;

            // Simulate a filled put discovered for this ticker.
            let symbol = format!("{}{}P.US", tk.to_uppercase(), i);
            st.contracts.put = Some(OptionContract::new(symbol.clone(), Leg::Put));
            let fx = vec![Effect::Subscribe { channel: Channel::Option(Leg::Put), hello: Some(symbol) }];
            assert!(d.execute(fx, &st).await);

            tokio::task::yield_now().await;
            for c in Channel::ALL {
                assert!(conn.shared.live(c) <= 1);
            }
        }
        d.shutdown().await;
        assert_eq!(conn.shared.total_live(), 0);
    }

    #[tokio::test]
    async fn persist_writes_cache_and_quit_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (mut d, _) = driver(dir.path());
        let mut st = AppState::new("net", OpenPositionSet::default());
        st.positions.add("net");

        assert!(!d.execute(vec![Effect::Persist, Effect::Quit], &st).await);
        let back = OpenPositionSet::load(&dir.path().join("open.json"));
        assert_eq!(back.count("net"), 1);
    }
}
