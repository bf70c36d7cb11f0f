//! Periodic refresh scheduling bound to the selected ticker.
//!
//! Each activation owns a fresh `CancellationToken`; switching ticker cancels the
//! previous token before anything new is armed. Events also carry the ticker
//! context so the reducer can drop anything that slipped through.

use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, sleep, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickerContext {
    pub ticker: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Capital flow.
    Fast,
    /// Correlation.
    Slow,
    /// One-shot day-stat refresh at market open.
    MarketOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub ctx: TickerContext,
    pub kind: TimerKind,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshPlan {
    pub fast: Duration,
    pub slow: Duration,
    pub market_open: NaiveTime,
}

/// Delay from `now` to `target` today. `None` when the target is not in the future.
pub fn delay_until(target: NaiveTime, now: NaiveDateTime) -> Option<Duration> {
    let at = now.date().and_time(target);
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}

struct Armed {
    ctx: TickerContext,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Scheduler {
    plan: RefreshPlan,
    tx: mpsc::UnboundedSender<TimerEvent>,
    armed: Option<Armed>,
}

impl Scheduler {
    pub fn new(plan: RefreshPlan, tx: mpsc::UnboundedSender<TimerEvent>) -> Self {
        Self {
            plan,
            tx,
            armed: None,
        }
    }

    pub fn activate(&mut self, ctx: TickerContext) {
        self.activate_at(ctx, Local::now().naive_local());
    }

    /// Cancel everything armed for the previous ticker, then arm timers for `ctx`.
    pub fn activate_at(&mut self, ctx: TickerContext, now: NaiveDateTime) {
        self.cancel();

        let token = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(run_interval(
                ctx.clone(),
                TimerKind::Fast,
                self.plan.fast,
                token.clone(),
                self.tx.clone(),
            )),
            tokio::spawn(run_interval(
                ctx.clone(),
                TimerKind::Slow,
                self.plan.slow,
                token.clone(),
                self.tx.clone(),
            )),
        ];

        match delay_until(self.plan.market_open, now) {
            Some(delay) => {
                info!(
                    "market-open refresh for {} armed in {}s",
                    ctx.ticker,
                    delay.as_secs()
                );
                tasks.push(tokio::spawn(run_once(
                    ctx.clone(),
                    delay,
                    token.clone(),
                    self.tx.clone(),
                )));
            }
            None => debug!("market-open refresh for {} already past; not armed", ctx.ticker),
        }

        self.armed = Some(Armed { ctx, token, tasks });
    }

    pub fn cancel(&mut self) {
        if let Some(old) = self.armed.take() {
            debug!("cancel timers for {} (gen {})", old.ctx.ticker, old.ctx.generation);
            old.token.cancel();
            for t in old.tasks {
                t.abort();
            }
        }
    }

    /// Number of timers armed for the current context.
    pub fn armed_count(&self) -> usize {
        self.armed.as_ref().map_or(0, |a| a.tasks.len())
    }

    pub fn context(&self) -> Option<&TickerContext> {
        self.armed.as_ref().map(|a| &a.ctx)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_interval(
    ctx: TickerContext,
    kind: TimerKind,
    period: Duration,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TimerEvent>,
) {
    // First tick one full period out; arming does not fire immediately.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if token.is_cancelled() {
                    break;
                }
                if tx.send(TimerEvent { ctx: ctx.clone(), kind }).is_err() {
                    break;
                }
            }
        }
    }
}

async fn run_once(
    ctx: TickerContext,
    delay: Duration,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<TimerEvent>,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = sleep(delay) => {
            if !token.is_cancelled() {
                let _ = tx.send(TimerEvent { ctx, kind: TimerKind::MarketOpen });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tokio::time::timeout;

    fn plan(open: NaiveTime) -> RefreshPlan {
        RefreshPlan {
            fast: Duration::from_secs(60),
            slow: Duration::from_secs(300),
            market_open: open,
        }
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 17)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn ctx(tk: &str, generation: u64) -> TickerContext {
        TickerContext {
            ticker: tk.into(),
            generation,
        }
    }

    #[test]
    fn delay_is_none_once_target_passed() {
        let open = NaiveTime::from_hms_opt(21, 30, 5).unwrap();
        assert_eq!(delay_until(open, at(21, 30, 0)), Some(Duration::from_secs(5)));
        assert_eq!(delay_until(open, at(21, 30, 5)), None);
        assert_eq!(delay_until(open, at(23, 0, 0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn past_market_open_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Scheduler::new(plan(NaiveTime::from_hms_opt(9, 0, 0).unwrap()), tx);
        s.activate_at(ctx("tsla", 1), at(10, 0, 0));
        assert_eq!(s.armed_count(), 2);

        // Run for a day of virtual time; only interval events may arrive.
        let deadline = Instant::now() + Duration::from_secs(24 * 3600);
        while let Ok(Some(ev)) = timeout(deadline - Instant::now(), rx.recv()).await {
            assert_ne!(ev.kind, TimerKind::MarketOpen);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn future_market_open_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Scheduler::new(
            RefreshPlan {
                fast: Duration::from_secs(3600),
                slow: Duration::from_secs(7200),
                market_open: NaiveTime::from_hms_opt(21, 30, 5).unwrap(),
            },
            tx,
        );
        s.activate_at(ctx("aapl", 3), at(21, 30, 0));
        assert_eq!(s.armed_count(), 3);

        let ev = timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev, TimerEvent { ctx: ctx("aapl", 3), kind: TimerKind::MarketOpen });
    }

    #[tokio::test(start_paused = true)]
    async fn intervals_do_not_fire_on_arm_and_fast_precedes_slow() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Scheduler::new(plan(NaiveTime::from_hms_opt(0, 0, 1).unwrap()), tx);
        s.activate_at(ctx("meta", 1), at(12, 0, 0));

        assert!(timeout(Duration::from_secs(59), rx.recv()).await.is_err());
        let ev = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, TimerKind::Fast);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_ticker_silences_previous_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut s = Scheduler::new(plan(NaiveTime::from_hms_opt(0, 0, 1).unwrap()), tx);
        s.activate_at(ctx("tsla", 1), at(12, 0, 0));
        tokio::time::sleep(Duration::from_secs(30)).await;
        s.activate_at(ctx("net", 2), at(12, 0, 30));
        assert_eq!(s.context(), Some(&ctx("net", 2)));

        let deadline = Instant::now() + Duration::from_secs(900);
        let mut seen = 0;
        while let Ok(Some(ev)) = timeout(deadline - Instant::now(), rx.recv()).await {
            assert_eq!(ev.ctx, ctx("net", 2));
            seen += 1;
        }
        assert!(seen > 0);
    }
}
