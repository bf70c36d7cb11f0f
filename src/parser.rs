//! Parse console commands.
//! Supported: ticker selection, buy/sell/cancel, preview, pricing calc, refresh, quit.

use regex::Regex;

use crate::error::{ClientError, ClientResult};
use crate::types::{Leg, Moneyness, OrderType, PricingQuery, QtySpec};
use crate::utils::sanitize_ticker;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Select(String),
    Buy {
        leg: Leg,
        money: Moneyness,
        order_type: OrderType,
        qty: QtySpec,
    },
    Sell {
        leg: Leg,
        order_type: OrderType,
    },
    Cancel(String),
    Preview(Leg),
    Calc(PricingQuery),
    Refresh,
    Quit,
}

pub struct CommandParser {
    re_select: Regex,
    re_buy: Regex,
    re_sell: Regex,
    re_cancel: Regex,
    re_preview: Regex,
    re_calc: Regex,
    re_bare: Regex,
}

impl CommandParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // "tk TSLA" / "select aapl"
            re_select: Regex::new(r"(?i)^(?:tk|select)\s+([a-z0-9.\-]{1,10})$")?,
            // "buy put itm lo 3"; options after the leg in any order
            re_buy: Regex::new(r"(?i)^buy\s+(put|call)((?:\s+\S+)*)$")?,
            re_sell: Regex::new(r"(?i)^sell\s+(put|call)(?:\s+(mo|lo))?$")?,
            re_cancel: Regex::new(r"(?i)^cancel\s+(\S+)$")?,
            re_preview: Regex::new(r"(?i)^preview\s+(put|call)$")?,
            // "calc put <spot> <days> <strike> <iv> <rate>"
            re_calc: Regex::new(r"(?i)^calc\s+(put|call)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S+)$")?,
            re_bare: Regex::new(r"(?i)^(refresh|quit|exit|q)$")?,
        })
    }

    pub fn parse(&self, text: &str) -> ClientResult<Command> {
        let t = text.trim();

        if let Some(c) = self.re_select.captures(t) {
            return Ok(Command::Select(sanitize_ticker(&c[1])));
        }

        if let Some(c) = self.re_buy.captures(t) {
            let leg = parse_leg(&c[1])?;
            let mut money = Moneyness::default();
            let mut order_type = OrderType::default();
            let mut qty = QtySpec::default();
            for tok in c[2].split_whitespace() {
                match tok.to_ascii_lowercase().as_str() {
                    "itm" => money = Moneyness::Itm,
                    "otm" => money = Moneyness::Otm,
                    "mo" => order_type = OrderType::Market,
                    "lo" => order_type = OrderType::Limit,
                    "min" => qty = QtySpec::Min,
                    "max" => qty = QtySpec::Max,
                    "mmax" => qty = QtySpec::MarginMax,
                    other => {
                        let n: u32 = other.parse().map_err(|_| {
                            ClientError::validation(format!("unexpected buy option `{}`", tok))
                        })?;
                        qty = QtySpec::Count(n);
                    }
                }
            }
            return Ok(Command::Buy {
                leg,
                money,
                order_type,
                qty,
            });
        }

        if let Some(c) = self.re_sell.captures(t) {
            let order_type = match c.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(ref s) if s == "lo" => OrderType::Limit,
                _ => OrderType::Market,
            };
            return Ok(Command::Sell {
                leg: parse_leg(&c[1])?,
                order_type,
            });
        }

        if let Some(c) = self.re_cancel.captures(t) {
            return Ok(Command::Cancel(c[1].to_string()));
        }

        if let Some(c) = self.re_preview.captures(t) {
            return Ok(Command::Preview(parse_leg(&c[1])?));
        }

        if let Some(c) = self.re_calc.captures(t) {
            let q = PricingQuery {
                leg: parse_leg(&c[1])?,
                spot: parse_num("spot", &c[2])?,
                days: parse_num("days", &c[3])?,
                strike: parse_num("strike", &c[4])?,
                iv: parse_num("iv", &c[5])?,
                rate: parse_num("rate", &c[6])?,
            };
            if q.spot <= 0.0 || q.strike <= 0.0 {
                return Err(ClientError::validation("spot and strike must be positive"));
            }
            if q.days < 0.0 || q.iv < 0.0 {
                return Err(ClientError::validation("days and iv must not be negative"));
            }
            return Ok(Command::Calc(q));
        }

        if let Some(c) = self.re_bare.captures(t) {
            return Ok(match c[1].to_ascii_lowercase().as_str() {
                "refresh" => Command::Refresh,
                _ => Command::Quit,
            });
        }

        Err(ClientError::validation(format!("unrecognized command `{}`", t)))
    }
}

fn parse_leg(s: &str) -> ClientResult<Leg> {
    match s.to_ascii_lowercase().as_str() {
        "put" => Ok(Leg::Put),
        "call" => Ok(Leg::Call),
        other => Err(ClientError::validation(format!("unknown leg `{}`", other))),
    }
}

fn parse_num(field: &str, raw: &str) -> ClientResult<f64> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(ClientError::validation(format!("{} `{}` is not a number", field, raw))),
    }
}
