//! View state projection: pure mapping from session state to render primitives.

use std::fmt::Write as _;

use crate::controller::AppState;
use crate::types::{Factor, FactorClass, Leg, Moneyness, Stat};
use crate::utils::{compact_number, signed};

/// Below this observed range the position-within-range is pinned to the midpoint.
pub const MIN_RANGE: f64 = 0.4;
/// Gap between the plot bound and the half-length of the plot box.
const PLOT_MARGIN: f64 = 90.0;

/// Clamp into `[-bound, bound]`. Values never push past the plot edge.
pub fn clamp_to_bound(x: f64, bound: f64) -> f64 {
    x.min(bound).max(-bound)
}

/// Percent of `p` within `[min, max]`; exactly 50 when the range is narrower than 0.4.
pub fn percent_within_range(min: f64, max: f64, p: f64) -> f64 {
    if max - min < MIN_RANGE {
        return 50.0;
    }
    (p - min) / (max - min) * 100.0
}

/// Observed day range widened by the live value.
pub fn widen_range(stat: Stat, live: f64) -> Stat {
    Stat {
        prev_close: stat.prev_close,
        max: stat.max.max(live),
        min: stat.min.min(live),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResistTier {
    Calm,
    Mild,
    Elevated,
    High,
    Extreme,
}

impl ResistTier {
    pub fn of(r: f64) -> Self {
        if r <= 1.0 {
            ResistTier::Calm
        } else if r <= 5.0 {
            ResistTier::Mild
        } else if r <= 15.0 {
            ResistTier::Elevated
        } else if r <= 25.0 {
            ResistTier::High
        } else {
            ResistTier::Extreme
        }
    }

    /// Emphasis pulse period in seconds; shorter means more agitated.
    pub fn pulse_secs(self) -> f64 {
        match self {
            ResistTier::Calm | ResistTier::Mild => 1.5,
            ResistTier::Elevated => 1.1,
            ResistTier::High => 0.9,
            ResistTier::Extreme => 0.65,
        }
    }
}

pub fn moneyness(leg: Leg, strike: f64, spot: f64) -> Moneyness {
    let itm = match leg {
        Leg::Put => strike - spot >= 0.0,
        Leg::Call => strike - spot <= 0.0,
    };
    if itm {
        Moneyness::Itm
    } else {
        Moneyness::Otm
    }
}

/// Geometry of the live price plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlotGeometry {
    pub len: f64,
    pub scale: f64,
}

impl PlotGeometry {
    pub fn bound(&self) -> f64 {
        self.len / 2.0 - PLOT_MARGIN
    }

    /// Offset from the plot centre for a change value.
    pub fn offset(&self, value: f64) -> f64 {
        clamp_to_bound(value * self.scale, self.bound())
    }
}

const GAUGE_CELLS: usize = 21;

/// Text gauge of plot offsets in `[-bound, bound]`: `=` spans the day range,
/// `|` marks the centre and `*` the live value.
pub fn gauge(min_x: f64, value_x: f64, max_x: f64, bound: f64) -> String {
    let last = (GAUGE_CELLS - 1) as f64;
    let cell = |x: f64| -> usize {
        if bound <= 0.0 {
            return GAUGE_CELLS / 2;
        }
        let t = (clamp_to_bound(x, bound) + bound) / (2.0 * bound);
        (t * last).round() as usize
    };
    let (lo, hi, at) = (cell(min_x), cell(max_x), cell(value_x));
    let mut out = String::with_capacity(GAUGE_CELLS + 2);
    out.push('[');
    for i in 0..GAUGE_CELLS {
        out.push(if i == at {
            '*'
        } else if i == GAUGE_CELLS / 2 {
            '|'
        } else if (lo..=hi).contains(&i) {
            '='
        } else {
            ' '
        });
    }
    out.push(']');
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlotFrame {
    pub ticker: String,
    pub value: f64,
    pub value_x: f64,
    pub max: f64,
    pub max_x: f64,
    pub min: f64,
    pub min_x: f64,
    pub bound: f64,
    pub prev_close: f64,
    pub change_pct: Option<f64>,
    pub volume: String,
    pub tier: ResistTier,
    pub pulse_secs: f64,
    /// Set when the latest push made a new session high / low.
    pub new_max: bool,
    pub new_min: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoardRow {
    pub ticker: String,
    pub change: String,
    pub trend: f64,
    pub selected: bool,
    pub open_legs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactorBadge {
    pub title: String,
    pub class: FactorClass,
    pub value: String,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LegFrame {
    pub leg: Leg,
    pub symbol: String,
    pub price: Option<f64>,
    pub cost: Option<f64>,
    /// Live price minus fill price.
    pub pnl: Option<f64>,
    pub moneyness: Option<Moneyness>,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub board: Vec<BoardRow>,
    pub plot: Option<PlotFrame>,
    pub factors: Vec<FactorBadge>,
    pub legs: Vec<LegFrame>,
    pub loading: bool,
}

pub fn factor_badge(f: &Factor) -> FactorBadge {
    FactorBadge {
        title: f.title.clone(),
        class: f.cls,
        value: f.display_value(),
        details: f.supp.iter().map(|d| crate::types::value_text(&d.val)).collect(),
    }
}

pub fn project(state: &AppState, geo: PlotGeometry) -> Frame {
    let board = state
        .board_order
        .iter()
        .filter_map(|tk| state.instruments.get(tk))
        .map(|i| BoardRow {
            ticker: i.ticker.clone(),
            change: signed(i.change),
            trend: i.trend,
            selected: i.ticker == state.ticker,
            open_legs: state.positions.count(&i.ticker),
        })
        .collect();

    let plot = state.instruments.get(&state.ticker).map(|i| {
        let stat = widen_range(i.stat.unwrap_or_default(), i.change);
        PlotFrame {
            ticker: i.ticker.clone(),
            value: i.change,
            value_x: geo.offset(i.change),
            max: stat.max,
            max_x: geo.offset(stat.max),
            min: stat.min,
            min_x: geo.offset(stat.min),
            bound: geo.bound(),
            prev_close: stat.prev_close,
            change_pct: i.change_pct(),
            volume: compact_number(i.volume),
            tier: ResistTier::of(i.resistance),
            pulse_secs: ResistTier::of(i.resistance).pulse_secs(),
            new_max: i.extremes.max,
            new_min: i.extremes.min,
        }
    });

    let spot = state
        .instruments
        .get(&state.ticker)
        .and_then(|i| i.price());
    let legs = state
        .contracts
        .iter()
        .filter_map(|(leg, c)| c.as_ref().map(|c| (leg, c)))
        .map(|(leg, c)| {
            let percent = match (c.low, c.high, c.price) {
                (Some(lo), Some(hi), Some(p)) => percent_within_range(lo, hi, p),
                _ => 50.0,
            };
            LegFrame {
                leg,
                symbol: c.symbol.clone(),
                price: c.price,
                cost: c.cost,
                pnl: c.price.zip(c.cost).map(|(p, c)| p - c),
                moneyness: c.strike.zip(spot).map(|(x, s)| moneyness(leg, x, s)),
                percent,
            }
        })
        .collect();

    Frame {
        board,
        plot,
        factors: state.factors.iter().map(factor_badge).collect(),
        legs,
        loading: state.loading,
    }
}

/// One-line console rendering of a frame.
pub fn describe(frame: &Frame) -> String {
    let mut out = String::new();
    if let Some(p) = &frame.plot {
        let pct = p
            .change_pct
            .map(|v| format!(" ({}%)", signed((v * 100.0).round() / 100.0)))
            .unwrap_or_default();
        let _ = write!(
            out,
            "{} {}{} {} [{} .. {}] prev ${} vol {} {:?}/{}s",
            p.ticker,
            signed(p.value),
            pct,
            gauge(p.min_x, p.value_x, p.max_x, p.bound),
            signed(p.min),
            signed(p.max),
            p.prev_close,
            p.volume,
            p.tier,
            p.pulse_secs
        );
        if p.new_max {
            out.push_str(" NEW HIGH");
        }
        if p.new_min {
            out.push_str(" NEW LOW");
        }
    }
    for f in &frame.factors {
        let _ = write!(out, " | {}{} {}", f.class.badge(), f.title, f.value);
    }
    for l in &frame.legs {
        let _ = write!(
            out,
            " | {} {} {} ({:.0}%)",
            l.leg,
            l.symbol,
            l.price.map(|p| format!("${}", p)).unwrap_or_else(|| "--".into()),
            l.percent
        );
        if let Some(cost) = l.cost {
            let _ = write!(out, " cost ${}", cost);
        }
        if let Some(pnl) = l.pnl {
            let _ = write!(out, " P/L {}", signed((pnl * 100.0).round() / 100.0));
        }
    }
    let held: Vec<String> = frame
        .board
        .iter()
        .filter(|r| r.open_legs > 0)
        .map(|r| format!("{}x{}", r.ticker, r.open_legs))
        .collect();
    if !held.is_empty() {
        let _ = write!(out, " | open: {}", held.join(","));
    }
    if frame.loading {
        out.push_str(" | placing order...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoardTick, Instrument, OptionContract};

    #[test]
    fn clamp_holds_at_bound() {
        assert_eq!(clamp_to_bound(9999.0, 510.0), 510.0);
        assert_eq!(clamp_to_bound(-9999.0, 510.0), -510.0);
        assert_eq!(clamp_to_bound(12.5, 510.0), 12.5);
    }

    #[test]
    fn default_plot_bound_is_510() {
        let geo = PlotGeometry { len: 1200.0, scale: 30.0 };
        assert_eq!(geo.bound(), 510.0);
        assert_eq!(geo.offset(2.0), 60.0);
        assert_eq!(geo.offset(400.0), 510.0);
    }

    #[test]
    fn narrow_range_pins_midpoint() {
        for p in [-100.0, 0.0, 1.0, 1e9] {
            assert_eq!(percent_within_range(1.0, 1.39, p), 50.0);
        }
        assert_eq!(percent_within_range(2.0, 2.0, 7.0), 50.0);
        assert_eq!(percent_within_range(1.0, 2.0, 1.5), 50.0);
        assert_eq!(percent_within_range(0.0, 4.0, 1.0), 25.0);
    }

    #[test]
    fn range_widens_with_live_value() {
        let s = widen_range(Stat { prev_close: 100.0, max: 1.0, min: -1.0 }, 3.0);
        assert_eq!((s.max, s.min), (3.0, -1.0));
    }

    #[test]
    fn resistance_tiers() {
        assert_eq!(ResistTier::of(0.5), ResistTier::Calm);
        assert_eq!(ResistTier::of(5.0), ResistTier::Mild);
        assert_eq!(ResistTier::of(10.0), ResistTier::Elevated);
        assert_eq!(ResistTier::of(25.0), ResistTier::High);
        assert_eq!(ResistTier::of(30.0), ResistTier::Extreme);
        assert_eq!(ResistTier::Extreme.pulse_secs(), 0.65);
    }

    #[test]
    fn moneyness_by_leg() {
        assert_eq!(moneyness(Leg::Put, 260.0, 250.0), Moneyness::Itm);
        assert_eq!(moneyness(Leg::Put, 240.0, 250.0), Moneyness::Otm);
        assert_eq!(moneyness(Leg::Call, 250.0, 250.0), Moneyness::Itm);
        assert_eq!(moneyness(Leg::Call, 255.0, 250.0), Moneyness::Otm);
    }

    #[test]
    fn project_marks_positions_and_legs() {
        let mut st = AppState::new("tsla", Default::default());
        let mut i = Instrument::new("tsla");
        i.apply_stat(Stat { prev_close: 250.0, max: 1.0, min: -2.0 });
        i.apply_tick(&BoardTick {
            tk: "tsla".into(),
            p: 50.0,
            r: 30.0,
            vol: 1500.0,
            diff: 0.0,
            mm: Default::default(),
            full_price: None,
        });
        st.instruments.insert("tsla".into(), i);
        st.board_order.push("tsla".into());
        st.positions.add("tsla");
        let mut c = OptionContract::new("TSLA1P.US", Leg::Put);
        c.strike = Some(280.0);
        c.price = Some(3.0);
        c.cost = Some(2.5);
        st.contracts.put = Some(c);

        let f = project(&st, PlotGeometry { len: 1200.0, scale: 30.0 });
        let plot = f.plot.as_ref().unwrap();
        assert_eq!(plot.value_x, 510.0);
        assert_eq!(plot.max, 50.0);
        assert_eq!(plot.volume, "1.5K");
        assert_eq!(plot.tier, ResistTier::Extreme);
        assert_eq!(f.board[0].open_legs, 1);
        assert!(f.board[0].selected);
        assert_eq!(f.legs[0].moneyness, Some(Moneyness::Otm));
        assert_eq!(f.legs[0].percent, 50.0);
        assert_eq!(f.legs[0].pnl, Some(0.5));
        let line = describe(&f);
        assert!(line.contains("tslax1"));
        assert!(line.contains("cost $2.5 P/L +0.5"));
        assert!(line.contains("[         =|=========*]"), "{}", line);
    }

    #[test]
    fn gauge_marks_centre_range_and_value() {
        assert_eq!(gauge(-510.0, 0.0, 510.0, 510.0), "[==========*==========]");
        assert_eq!(gauge(0.0, 0.0, 0.0, 510.0), "[          *          ]");
        // Out-of-bound offsets stay on the edge cell.
        assert_eq!(gauge(-30.0, -9999.0, 60.0, 510.0), "[*        =|=         ]");
    }
}
