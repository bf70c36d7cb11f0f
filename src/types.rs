//! Core domain types: channels, legs, quotes, factors, orders and position reports.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ---------- Legs & channels ----------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    #[serde(alias = "Put", alias = "PUT")]
    Put,
    #[serde(alias = "Call", alias = "CALL")]
    Call,
}

impl Leg {
    pub const ALL: [Leg; 2] = [Leg::Put, Leg::Call];

    pub fn as_str(self) -> &'static str {
        match self {
            Leg::Put => "put",
            Leg::Call => "call",
        }
    }

    pub fn channel(self) -> Channel {
        Channel::Option(self)
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per option leg.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Legs<T> {
    pub put: T,
    pub call: T,
}

impl<T> Legs<T> {
    pub fn get(&self, leg: Leg) -> &T {
        match leg {
            Leg::Put => &self.put,
            Leg::Call => &self.call,
        }
    }

    pub fn get_mut(&mut self, leg: Leg) -> &mut T {
        match leg {
            Leg::Put => &mut self.put,
            Leg::Call => &mut self.call,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Leg, &T)> {
        [(Leg::Put, &self.put), (Leg::Call, &self.call)].into_iter()
    }
}

/// Logical live channel. At most one transport per channel at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Board,
    Option(Leg),
}

impl Channel {
    pub const ALL: [Channel; 3] = [
        Channel::Board,
        Channel::Option(Leg::Put),
        Channel::Option(Leg::Call),
    ];

    /// WebSocket path on the backend.
    pub fn path(self) -> &'static str {
        match self {
            Channel::Board => "/quote",
            Channel::Option(_) => "/quote-option",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Board => f.write_str("board"),
            Channel::Option(leg) => write!(f, "{}-option", leg),
        }
    }
}

// ---------- Order vocabulary ----------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OrderType {
    #[default]
    #[serde(rename = "MO")]
    Market,
    #[serde(rename = "LO")]
    Limit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Moneyness {
    #[default]
    Itm,
    Otm,
}

/// Quantity selector understood by the backend: `min | max | mmax | <n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QtySpec {
    #[default]
    Min,
    Max,
    MarginMax,
    Count(u32),
}

impl Serialize for QtySpec {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            QtySpec::Min => s.serialize_str("min"),
            QtySpec::Max => s.serialize_str("max"),
            QtySpec::MarginMax => s.serialize_str("mmax"),
            QtySpec::Count(n) => s.serialize_u32(*n),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OrderRequest {
    pub tk: String,
    pub option: Leg,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: QtySpec,
    pub money: Moneyness,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderStatus {
    Working,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Unknown(String),
}

impl OrderStatus {
    pub fn from_wire(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "filled" => OrderStatus::Filled,
            "partialfilled" | "partially_filled" | "partial" => OrderStatus::PartiallyFilled,
            "new" | "pending" | "working" | "notreported" | "waittonew" | "replaced"
            | "pendingreplace" | "protected" | "varietiesnotreported" => OrderStatus::Working,
            "canceled" | "cancelled" | "expired" | "pendingcancel" => OrderStatus::Canceled,
            "rejected" | "partialwithdrawal" => OrderStatus::Rejected,
            other => OrderStatus::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Working => f.write_str("pending"),
            OrderStatus::PartiallyFilled => f.write_str("partially filled"),
            OrderStatus::Filled => f.write_str("filled"),
            OrderStatus::Canceled => f.write_str("canceled"),
            OrderStatus::Rejected => f.write_str("rejected"),
            OrderStatus::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Raw `/order` response. A rejection may carry only `success` and `message`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrderResponse {
    pub success: bool,
    pub message: String,
    pub id: Option<String>,
    pub status: Option<String>,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub option: Option<Leg>,
    pub side: Option<Side>,
    #[serde(deserialize_with = "flex_opt_f64")]
    pub qty: Option<f64>,
    #[serde(deserialize_with = "flex_opt_f64")]
    pub exec_price: Option<f64>,
    #[serde(rename = "totalCost", deserialize_with = "flex_opt_f64")]
    pub total_cost: Option<f64>,
    #[serde(deserialize_with = "flex_opt_f64")]
    pub profit: Option<f64>,
    pub time: Option<String>,
}

/// Acknowledged order. Never mutated; a later order on the same leg supersedes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub ticker: String,
    pub leg: Leg,
    pub symbol: String,
    pub name: String,
    pub order_type: OrderType,
    pub qty: f64,
    pub status: OrderStatus,
    pub exec_price: f64,
    /// Realized profit, sell side only.
    pub profit: Option<f64>,
    pub total_cost: Option<f64>,
    pub time: Option<String>,
}

// ---------- Position report ----------

/// Last order the server tracks for one leg; `{}` when the leg has none.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PositionLeg {
    pub id: Option<String>,
    pub symbol: Option<String>,
    pub status: Option<String>,
    pub side: Option<Side>,
    #[serde(deserialize_with = "flex_opt_f64")]
    pub qty: Option<f64>,
    #[serde(deserialize_with = "flex_opt_f64")]
    pub exec_price: Option<f64>,
}

impl PositionLeg {
    /// Bought and filled, not yet sold.
    pub fn is_filled_open(&self) -> bool {
        self.side == Some(Side::Buy)
            && self
                .status
                .as_deref()
                .map(|s| OrderStatus::from_wire(s) == OrderStatus::Filled)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PositionReport {
    pub put: PositionLeg,
    pub call: PositionLeg,
}

impl PositionReport {
    pub fn leg(&self, leg: Leg) -> &PositionLeg {
        match leg {
            Leg::Put => &self.put,
            Leg::Call => &self.call,
        }
    }
}

// ---------- Quotes ----------

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NewExtremes {
    pub max: bool,
    pub min: bool,
}

/// One row of the board push.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BoardTick {
    pub tk: String,
    /// Change from previous close.
    #[serde(deserialize_with = "flex_f64")]
    pub p: f64,
    /// Resistance score.
    #[serde(default, deserialize_with = "flex_f64")]
    pub r: f64,
    #[serde(default, deserialize_with = "flex_f64")]
    pub vol: f64,
    #[serde(default, deserialize_with = "flex_f64")]
    pub diff: f64,
    #[serde(default)]
    pub mm: NewExtremes,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub full_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardMessage {
    pub data: Vec<BoardTick>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
pub struct Stat {
    #[serde(rename = "prevClose", deserialize_with = "flex_f64")]
    pub prev_close: f64,
    #[serde(deserialize_with = "flex_f64")]
    pub max: f64,
    #[serde(deserialize_with = "flex_f64")]
    pub min: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instrument {
    pub ticker: String,
    /// Full price when the board carries it.
    pub quoted_price: Option<f64>,
    pub change: f64,
    pub volume: f64,
    pub resistance: f64,
    pub trend: f64,
    pub extremes: NewExtremes,
    pub stat: Option<Stat>,
}

impl Instrument {
    pub fn new(ticker: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            ..Default::default()
        }
    }

    /// Last write wins on every field the tick carries.
    pub fn apply_tick(&mut self, t: &BoardTick) {
        self.change = t.p;
        self.resistance = t.r;
        self.volume = t.vol;
        self.trend = t.diff;
        self.extremes = t.mm;
        if t.full_price.is_some() {
            self.quoted_price = t.full_price;
        }
    }

    pub fn apply_stat(&mut self, stat: Stat) {
        self.stat = Some(stat);
    }

    pub fn price(&self) -> Option<f64> {
        self.quoted_price.or_else(|| {
            self.stat
                .filter(|s| s.prev_close > 0.0)
                .map(|s| s.prev_close + self.change)
        })
    }

    pub fn change_pct(&self) -> Option<f64> {
        self.stat
            .filter(|s| s.prev_close.abs() > f64::EPSILON)
            .map(|s| self.change / s.prev_close * 100.0)
    }
}

/// `/quote-option` push.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct OptionQuote {
    #[serde(deserialize_with = "flex_f64")]
    pub price: f64,
    #[serde(rename = "type")]
    pub leg: Option<Leg>,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub strike: Option<f64>,
    #[serde(default)]
    pub exp: Option<String>,
    #[serde(default, deserialize_with = "flex_opt_f64")]
    pub open: Option<f64>,
}

/// Live contract behind an open option subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionContract {
    pub symbol: String,
    pub leg: Leg,
    pub strike: Option<f64>,
    pub expiry: Option<String>,
    pub price: Option<f64>,
    pub open_interest: Option<f64>,
    /// Fill price of the opening buy.
    pub cost: Option<f64>,
    /// Observed price range since the stream opened.
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl OptionContract {
    pub fn new(symbol: impl Into<String>, leg: Leg) -> Self {
        Self {
            symbol: symbol.into(),
            leg,
            strike: None,
            expiry: None,
            price: None,
            open_interest: None,
            cost: None,
            low: None,
            high: None,
        }
    }

    pub fn apply_quote(&mut self, q: &OptionQuote) {
        self.price = Some(q.price);
        self.low = Some(self.low.map_or(q.price, |l| l.min(q.price)));
        self.high = Some(self.high.map_or(q.price, |h| h.max(q.price)));
        if q.strike.is_some() {
            self.strike = q.strike;
        }
        if q.exp.is_some() {
            self.expiry = q.exp.clone();
        }
        if q.open.is_some() {
            self.open_interest = q.open;
        }
    }
}

// ---------- Factors ----------

/// Traffic-light classification; the backend sends it as an emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactorClass {
    #[default]
    Neutral,
    Positive,
    Negative,
}

impl FactorClass {
    pub fn from_wire(s: &str) -> Self {
        match s.trim() {
            "🟢" | "green" | "positive" => FactorClass::Positive,
            "🔴" | "red" | "negative" => FactorClass::Negative,
            _ => FactorClass::Neutral,
        }
    }

    pub fn badge(self) -> char {
        match self {
            FactorClass::Neutral => 'o',
            FactorClass::Positive => '+',
            FactorClass::Negative => '-',
        }
    }
}

impl<'de> Deserialize<'de> for FactorClass {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(FactorClass::from_wire(&s))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FactorDetail {
    #[serde(default)]
    pub cls: FactorClass,
    pub val: Value,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Factor {
    pub title: String,
    #[serde(default)]
    pub cls: FactorClass,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub supp: Vec<FactorDetail>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl Factor {
    pub fn placeholder(title: &str) -> Self {
        Self {
            title: title.to_string(),
            cls: FactorClass::Neutral,
            value: Value::from(0),
            supp: Vec::new(),
            timestamp: None,
        }
    }

    pub fn display_value(&self) -> String {
        value_text(&self.value)
    }
}

pub fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "--".to_string(),
        other => other.to_string(),
    }
}

// ---------- Pricing ----------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingQuery {
    pub leg: Leg,
    pub spot: f64,
    pub days: f64,
    pub strike: f64,
    pub iv: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PricingResult {
    #[serde(deserialize_with = "flex_f64")]
    pub price: f64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ---------- Notices ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

// ---------- Decimal-tolerant number decoding ----------

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(f64),
    Str(String),
}

fn flex_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn flex_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    match Option::<NumOrStr>::deserialize(d)? {
        None => Ok(None),
        Some(NumOrStr::Num(n)) => Ok(Some(n)),
        Some(NumOrStr::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(NumOrStr::Str(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}
