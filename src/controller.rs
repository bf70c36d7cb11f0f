//! Application state and its reducer.
//!
//! Every transition comes through [`AppState::apply`]: stream messages, timer
//! events, user commands and HTTP responses. The reducer never performs I/O; it
//! returns [`Effect`]s that the driver executes.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, error, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::parser::Command;
use crate::reconcile::{apply_fill, reconcile, LegInstruction};
use crate::risk::OrderGuard;
use crate::scheduler::{TickerContext, TimerEvent, TimerKind};
use crate::state::OpenPositionSet;
use crate::stream::StreamEvent;
use crate::types::{
    BoardMessage, Channel, Factor, Instrument, Leg, Legs, Moneyness, Notice, NoticeLevel,
    OptionContract, OptionQuote, Order, OrderRequest, OrderResponse, OrderStatus,
    PositionReport, PricingQuery, PricingResult, QtySpec, Side, Stat,
};
use crate::utils::{leg_from_symbol, sanitize_ticker};

const MAX_NOTICES: usize = 20;
const MAX_ORDERS: usize = 50;
/// Factor slots refreshed by the fast and slow timers.
const CAPFLOW_SLOT: usize = 0;
const CORR_SLOT: usize = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Stat { ticker: String },
    Factors { ticker: String },
    Capflow { ctx: TickerContext },
    Corr { ctx: TickerContext },
    Position { ticker: String, seq: u64 },
    Order(OrderRequest),
    Cancel(String),
    Preview { ticker: String, leg: Leg },
    Pricing(PricingQuery),
}

#[derive(Debug)]
pub enum Response {
    Stat { ticker: String, result: ClientResult<Stat> },
    Factors { ticker: String, result: ClientResult<Vec<Factor>> },
    Capflow { ctx: TickerContext, result: ClientResult<Factor> },
    Corr { ctx: TickerContext, result: ClientResult<Factor> },
    Position { ticker: String, seq: u64, result: ClientResult<PositionReport> },
    Order { request: OrderRequest, result: ClientResult<OrderResponse> },
    Cancel { id: String, result: ClientResult<()> },
    Preview { ticker: String, leg: Leg, result: ClientResult<Vec<f64>> },
    Pricing { query: PricingQuery, result: ClientResult<PricingResult> },
}

#[derive(Debug)]
pub enum Event {
    /// Already filtered to the current handle of its channel.
    Stream(StreamEvent),
    Timer(TimerEvent),
    User(Command),
    /// Console input that failed to parse.
    Invalid(ClientError),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Subscribe { channel: Channel, hello: Option<String> },
    Unsubscribe(Channel),
    Fetch(Request),
    /// Re-arm refresh timers for a new ticker context.
    Schedule(TickerContext),
    /// Rewrite the open-position cache.
    Persist,
    Quit,
}

pub struct AppState {
    pub ticker: String,
    generation: u64,
    position_seq: u64,
    /// A position report for the current ticker is owed: requested and not yet
    /// applied, or dropped because an order went out after it was requested.
    position_pending: bool,
    pub instruments: BTreeMap<String, Instrument>,
    /// Board rows in the order of the latest push.
    pub board_order: Vec<String>,
    pub board_live: bool,
    pub factors: Vec<Factor>,
    pub contracts: Legs<Option<OptionContract>>,
    /// Leg status last learned for the current ticker; reset on selection.
    pub open_legs: Legs<bool>,
    pub positions: OpenPositionSet,
    /// Newest first.
    pub orders: VecDeque<Order>,
    pub notices: VecDeque<Notice>,
    pub loading: bool,
    pub preview: Option<(Leg, Vec<f64>)>,
    pub pricing: Option<(PricingQuery, PricingResult)>,
}

fn default_factors() -> Vec<Factor> {
    vec![Factor::placeholder("cap"), Factor::placeholder("corr")]
}

impl AppState {
    pub fn new(ticker: &str, positions: OpenPositionSet) -> Self {
        Self {
            ticker: sanitize_ticker(ticker),
            generation: 0,
            position_seq: 0,
            position_pending: false,
            instruments: BTreeMap::new(),
            board_order: Vec::new(),
            board_live: false,
            factors: default_factors(),
            contracts: Legs::default(),
            open_legs: Legs::default(),
            positions,
            orders: VecDeque::new(),
            notices: VecDeque::new(),
            loading: false,
            preview: None,
            pricing: None,
        }
    }

    pub fn context(&self) -> TickerContext {
        TickerContext {
            ticker: self.ticker.clone(),
            generation: self.generation,
        }
    }

    pub fn apply(&mut self, event: Event) -> Vec<Effect> {
        match event {
            Event::Stream(ev) => self.on_stream(ev),
            Event::Timer(ev) => self.on_timer(ev),
            Event::User(cmd) => self.on_command(cmd),
            Event::Invalid(err) => {
                self.notify(NoticeLevel::Error, err.to_string());
                Vec::new()
            }
            Event::Response(resp) => self.on_response(resp),
        }
    }

    fn notify(&mut self, level: NoticeLevel, text: impl Into<String>) {
        let n = Notice::new(level, text);
        match level {
            NoticeLevel::Error => error!("{}", n.text),
            _ => info!("{}", n.text),
        }
        if self.notices.len() == MAX_NOTICES {
            self.notices.pop_front();
        }
        self.notices.push_back(n);
    }

    // ---------- Streams ----------

    fn on_stream(&mut self, ev: StreamEvent) -> Vec<Effect> {
        match ev {
            StreamEvent::Opened { channel, .. } => {
                if channel == Channel::Board {
                    self.board_live = true;
                    self.notify(NoticeLevel::Success, "subscribed to board quotes");
                } else {
                    debug!("{} stream open", channel);
                }
            }
            StreamEvent::Message { channel, payload, .. } => match channel {
                Channel::Board => self.on_board(&payload),
                Channel::Option(leg) => self.on_option_quote(leg, &payload),
            },
            StreamEvent::Failed { channel, reason, .. } => {
                match channel {
                    Channel::Board => self.board_live = false,
                    // Forget the leg so the next reconcile re-opens it.
                    Channel::Option(leg) => {
                        *self.open_legs.get_mut(leg) = false;
                        *self.contracts.get_mut(leg) = None;
                    }
                }
                let err = ClientError::transport(channel, reason);
                self.notify(NoticeLevel::Error, err.to_string());
            }
            StreamEvent::Closed { channel, .. } => {
                if channel == Channel::Board {
                    self.board_live = false;
                }
                debug!("{} stream closed", channel);
            }
        }
        Vec::new()
    }

    fn on_board(&mut self, payload: &str) {
        let msg: BoardMessage = match serde_json::from_str(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("malformed board push ignored: {}", e);
                return;
            }
        };
        self.board_order.clear();
        for tick in &msg.data {
            let tk = sanitize_ticker(&tick.tk);
            self.instruments
                .entry(tk.clone())
                .or_insert_with(|| Instrument::new(tk.clone()))
                .apply_tick(tick);
            self.board_order.push(tk);
        }
    }

    fn on_option_quote(&mut self, leg: Leg, payload: &str) {
        let quote: OptionQuote = match serde_json::from_str(payload) {
            Ok(q) => q,
            Err(e) => {
                warn!("malformed {} quote ignored: {}", leg, e);
                return;
            }
        };
        match self.contracts.get_mut(leg) {
            Some(c) => c.apply_quote(&quote),
            None => debug!("{} quote without a contract dropped", leg),
        }
    }

    // ---------- Timers ----------

    fn on_timer(&mut self, ev: TimerEvent) -> Vec<Effect> {
        if ev.ctx != self.context() {
            debug!("stale {:?} timer for {} dropped", ev.kind, ev.ctx.ticker);
            return Vec::new();
        }
        let req = match ev.kind {
            TimerKind::Fast => Request::Capflow { ctx: ev.ctx },
            TimerKind::Slow => Request::Corr { ctx: ev.ctx },
            TimerKind::MarketOpen => Request::Stat { ticker: ev.ctx.ticker },
        };
        vec![Effect::Fetch(req)]
    }

    // ---------- Commands ----------

    fn on_command(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::Select(tk) => self.select(&tk),
            Command::Buy {
                leg,
                money,
                order_type,
                qty,
            } => self.place(OrderRequest {
                tk: self.ticker.clone(),
                option: leg,
                side: Side::Buy,
                order_type,
                qty,
                money,
            }),
            Command::Sell { leg, order_type } => self.place(OrderRequest {
                tk: self.ticker.clone(),
                option: leg,
                side: Side::Sell,
                order_type,
                qty: QtySpec::Min,
                money: Moneyness::Itm,
            }),
            Command::Cancel(id) => vec![Effect::Fetch(Request::Cancel(id))],
            Command::Preview(leg) => vec![Effect::Fetch(Request::Preview {
                ticker: self.ticker.clone(),
                leg,
            })],
            Command::Calc(q) => vec![Effect::Fetch(Request::Pricing(q))],
            Command::Refresh => {
                let mut out = Vec::new();
                if !self.board_live {
                    out.push(Effect::Subscribe {
                        channel: Channel::Board,
                        hello: None,
                    });
                }
                out.extend(self.fetch_ticker_data());
                out
            }
            Command::Quit => vec![Effect::Quit],
        }
    }

    /// Switch the active ticker: drop everything bound to the old one, then
    /// re-arm timers and fetch fresh truth for the new one.
    pub fn select(&mut self, ticker: &str) -> Vec<Effect> {
        let tk = sanitize_ticker(ticker);
        if tk.is_empty() {
            self.notify(NoticeLevel::Error, "empty ticker");
            return Vec::new();
        }
        let mut out = Vec::new();

        for leg in Leg::ALL {
            if self.contracts.get_mut(leg).take().is_some() {
                out.push(Effect::Unsubscribe(leg.channel()));
            }
        }
        self.open_legs = Legs::default();
        self.factors = default_factors();
        self.preview = None;

        self.ticker = tk;
        self.generation += 1;
        out.push(Effect::Schedule(self.context()));

        if !self.board_live {
            out.push(Effect::Subscribe {
                channel: Channel::Board,
                hello: None,
            });
        }
        out.extend(self.fetch_ticker_data());
        info!("selected {} (gen {})", self.ticker, self.generation);
        out
    }

    fn fetch_ticker_data(&mut self) -> Vec<Effect> {
        vec![
            self.request_position(),
            Effect::Fetch(Request::Stat {
                ticker: self.ticker.clone(),
            }),
            Effect::Fetch(Request::Factors {
                ticker: self.ticker.clone(),
            }),
        ]
    }

    /// Issue a position request that supersedes every earlier one.
    fn request_position(&mut self) -> Effect {
        self.position_seq += 1;
        self.position_pending = true;
        Effect::Fetch(Request::Position {
            ticker: self.ticker.clone(),
            seq: self.position_seq,
        })
    }

    fn place(&mut self, req: OrderRequest) -> Vec<Effect> {
        if let Err(e) = OrderGuard::pre_check(&req, self) {
            self.notify(NoticeLevel::Error, e.to_string());
            return Vec::new();
        }
        // A report requested before this order may predate its fill.
        if self.position_pending {
            self.position_seq += 1;
        }
        self.loading = true;
        self.notify(
            NoticeLevel::Info,
            format!("placing {} {} on {}", req.side, req.option, req.tk),
        );
        vec![Effect::Fetch(Request::Order(req))]
    }

    // ---------- Responses ----------

    fn on_response(&mut self, resp: Response) -> Vec<Effect> {
        match resp {
            Response::Stat { ticker, result } => {
                match result {
                    Ok(stat) => {
                        self.instruments
                            .entry(ticker.clone())
                            .or_insert_with(|| Instrument::new(ticker.clone()))
                            .apply_stat(stat);
                    }
                    Err(e) => self.notify(NoticeLevel::Error, format!("stat {}: {}", ticker, e)),
                }
                Vec::new()
            }
            Response::Factors { ticker, result } => {
                if ticker != self.ticker {
                    debug!("factors for {} arrived after switch; dropped", ticker);
                    return Vec::new();
                }
                match result {
                    Ok(f) => self.factors = f,
                    Err(e) => self.notify(NoticeLevel::Error, format!("factors {}: {}", ticker, e)),
                }
                Vec::new()
            }
            Response::Capflow { ctx, result } => {
                self.set_factor(ctx, CAPFLOW_SLOT, result);
                Vec::new()
            }
            Response::Corr { ctx, result } => {
                self.set_factor(ctx, CORR_SLOT, result);
                Vec::new()
            }
            Response::Position { ticker, seq, result } => self.on_position(ticker, seq, result),
            Response::Order { request, result } => self.on_order(request, result),
            Response::Cancel { id, result } => {
                match result {
                    Ok(()) => self.notify(NoticeLevel::Success, format!("order {} canceled", id)),
                    Err(e) => self.notify(NoticeLevel::Error, format!("cancel {}: {}", id, e)),
                }
                Vec::new()
            }
            Response::Preview { ticker, leg, result } => {
                match result {
                    Ok(prices) if ticker == self.ticker => {
                        let list: Vec<String> = prices.iter().map(|p| p.to_string()).collect();
                        self.notify(
                            NoticeLevel::Info,
                            format!("{} {} preview: {}", ticker, leg, list.join(" ")),
                        );
                        self.preview = Some((leg, prices));
                    }
                    Ok(_) => debug!("preview for {} arrived after switch; dropped", ticker),
                    Err(e) => self.notify(NoticeLevel::Error, format!("preview: {}", e)),
                }
                Vec::new()
            }
            Response::Pricing { query, result } => {
                match result {
                    Ok(r) => {
                        self.notify(
                            NoticeLevel::Info,
                            format!("{} @ {} strike {}: {}", query.leg, query.spot, query.strike, r.price),
                        );
                        self.pricing = Some((query, r));
                    }
                    Err(e) => self.notify(NoticeLevel::Error, format!("check your entry: {}", e)),
                }
                Vec::new()
            }
        }
    }

    fn set_factor(&mut self, ctx: TickerContext, slot: usize, result: ClientResult<Factor>) {
        if ctx != self.context() {
            debug!("factor refresh for {} (gen {}) dropped", ctx.ticker, ctx.generation);
            return;
        }
        match result {
            Ok(f) => {
                while self.factors.len() <= slot {
                    self.factors.push(Factor::placeholder(""));
                }
                self.factors[slot] = f;
            }
            Err(e) => warn!("factor refresh failed: {}", e),
        }
    }

    fn on_position(
        &mut self,
        ticker: String,
        seq: u64,
        result: ClientResult<PositionReport>,
    ) -> Vec<Effect> {
        if ticker != self.ticker || seq != self.position_seq {
            debug!("position report {} #{} superseded; dropped", ticker, seq);
            return Vec::new();
        }
        self.position_pending = false;
        let report = match result {
            Ok(r) => r,
            Err(e) => {
                self.notify(NoticeLevel::Error, format!("position {}: {}", ticker, e));
                return Vec::new();
            }
        };

        let r = reconcile(&ticker, &report, &mut self.open_legs, &mut self.positions);
        let changed = r.changed_set();
        let mut out = Vec::new();
        for instr in r.instructions {
            let cost = match &instr {
                LegInstruction::Subscribe { leg, .. } => report.leg(*leg).exec_price,
                LegInstruction::Unsubscribe { .. } => None,
            };
            out.extend(self.follow(instr, cost));
        }
        if changed {
            out.push(Effect::Persist);
        }
        out
    }

    /// Translate a leg instruction into contract bookkeeping plus a stream effect.
    fn follow(&mut self, instr: LegInstruction, cost: Option<f64>) -> Option<Effect> {
        match instr {
            LegInstruction::Subscribe { leg, symbol } => {
                let mut c = OptionContract::new(symbol.clone(), leg);
                c.cost = cost;
                *self.contracts.get_mut(leg) = Some(c);
                Some(Effect::Subscribe {
                    channel: leg.channel(),
                    hello: Some(symbol),
                })
            }
            LegInstruction::Unsubscribe { leg } => {
                *self.contracts.get_mut(leg) = None;
                Some(Effect::Unsubscribe(leg.channel()))
            }
        }
    }

    fn on_order(&mut self, req: OrderRequest, result: ClientResult<OrderResponse>) -> Vec<Effect> {
        self.loading = false;
        let req_tk = req.tk.clone();
        let mut out = self.settle_order(req, result);
        // Replace a report that was dropped while the order was in flight.
        if req_tk == self.ticker && self.position_pending {
            out.push(self.request_position());
        }
        out
    }

    fn settle_order(&mut self, req: OrderRequest, result: ClientResult<OrderResponse>) -> Vec<Effect> {
        let resp = match result {
            Ok(r) => r,
            Err(e) => {
                self.notify(NoticeLevel::Error, e.to_string());
                return Vec::new();
            }
        };

        let status = OrderStatus::from_wire(resp.status.as_deref().unwrap_or(""));
        let symbol = resp.symbol.clone().unwrap_or_default();
        let leg = resp
            .option
            .or_else(|| leg_from_symbol(&symbol))
            .unwrap_or(req.option);
        if leg != req.option {
            warn!("order {:?} filled {} but {} was requested", resp.id, leg, req.option);
        }
        let order = Order {
            id: resp.id.clone().unwrap_or_default(),
            side: resp.side.unwrap_or(req.side),
            ticker: req.tk.clone(),
            leg,
            symbol,
            name: resp.name.clone().unwrap_or_default(),
            order_type: req.order_type,
            qty: resp.qty.unwrap_or(0.0),
            status: status.clone(),
            exec_price: resp.exec_price.unwrap_or(0.0),
            profit: match req.side {
                Side::Sell => resp.profit,
                Side::Buy => None,
            },
            total_cost: resp.total_cost,
            time: resp.time.clone(),
        };
        if self.orders.len() == MAX_ORDERS {
            self.orders.pop_back();
        }
        self.orders.push_front(order.clone());

        match status {
            OrderStatus::Filled => self.on_fill(&req, &order),
            OrderStatus::Working | OrderStatus::PartiallyFilled => {
                // Subscription waits for the next position reconcile to confirm the fill.
                self.notify(
                    NoticeLevel::Success,
                    format!("{} {} order {} submitted ({})", req.side, req.option, order.id, status),
                );
                Vec::new()
            }
            OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Unknown(_) => {
                self.notify(
                    NoticeLevel::Error,
                    format!("{} {} order {}: {}", req.side, req.option, order.id, status),
                );
                Vec::new()
            }
        }
    }

    fn on_fill(&mut self, req: &OrderRequest, order: &Order) -> Vec<Effect> {
        let text = match (order.side, order.profit) {
            (Side::Sell, Some(p)) => format!(
                "sold {} {} @ {} (profit {})",
                order.qty, order.symbol, order.exec_price, p
            ),
            _ => match order.total_cost {
                Some(total) => format!(
                    "{} {} {} @ {} (total ${})",
                    order.side, order.qty, order.symbol, order.exec_price, total
                ),
                None => format!("{} {} {} @ {}", order.side, order.qty, order.symbol, order.exec_price),
            },
        };
        self.notify(NoticeLevel::Success, text);

        let before = self.positions.clone();
        let mut out = Vec::new();
        if req.tk == self.ticker {
            // Any report still in flight was computed before this fill.
            if self.position_pending {
                self.position_seq += 1;
            }
            let symbol = Some(order.symbol.as_str()).filter(|s| !s.is_empty());
            if let Some(instr) = apply_fill(
                &req.tk,
                order.leg,
                order.side,
                symbol,
                &mut self.open_legs,
                &mut self.positions,
            ) {
                let cost = Some(order.exec_price).filter(|_| order.side == Side::Buy);
                out.extend(self.follow(instr, cost));
            }
        } else {
            // Ticker changed while in flight: adjust the cache only; the next
            // selection of that ticker reconciles the legs.
            match order.side {
                Side::Buy => self.positions.add(&req.tk),
                Side::Sell => {
                    self.positions.remove_one(&req.tk);
                }
            }
        }
        if self.positions != before {
            out.push(Effect::Persist);
        }
        out
    }
}
