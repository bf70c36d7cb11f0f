//! Position reconciliation: correct the local open-position multiset from the
//! server's per-leg report and derive which option streams to open or close.

use tracing::{debug, warn};

use crate::state::OpenPositionSet;
use crate::types::{Leg, Legs, PositionReport, Side};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegInstruction {
    /// Leg newly filled: open its option stream.
    Subscribe { leg: Leg, symbol: String },
    /// Leg newly closed: close its option stream and drop the cached contract.
    Unsubscribe { leg: Leg },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: usize,
    pub removed: usize,
    pub instructions: Vec<LegInstruction>,
}

impl Reconciliation {
    pub fn changed_set(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// Bring `count(ticker)` to `filled(put) + filled(call)` and diff each leg
/// against `known`, which is reset to all-closed whenever a ticker is selected.
pub fn reconcile(
    ticker: &str,
    report: &PositionReport,
    known: &mut Legs<bool>,
    set: &mut OpenPositionSet,
) -> Reconciliation {
    let mut out = Reconciliation::default();

    let server_count = Leg::ALL
        .iter()
        .filter(|leg| report.leg(**leg).is_filled_open())
        .count();
    let local_count = set.count(ticker);

    if local_count > server_count {
        for _ in 0..(local_count - server_count) {
            if set.remove_one(ticker) {
                out.removed += 1;
            }
        }
    } else if local_count < server_count {
        for _ in 0..(server_count - local_count) {
            set.add(ticker);
            out.added += 1;
        }
    }

    for leg in Leg::ALL {
        let pos = report.leg(leg);
        let now_open = pos.is_filled_open();
        let was_open = *known.get(leg);
        match (was_open, now_open) {
            (false, true) => match pos.symbol.as_deref().filter(|s| !s.is_empty()) {
                Some(symbol) => out.instructions.push(LegInstruction::Subscribe {
                    leg,
                    symbol: symbol.to_string(),
                }),
                None => warn!("{} {} leg filled but report has no symbol", ticker, leg),
            },
            (true, false) => out.instructions.push(LegInstruction::Unsubscribe { leg }),
            _ => {}
        }
        *known.get_mut(leg) = now_open;
    }

    debug!(
        "reconciled {}: server={} local={} -> +{} -{}",
        ticker, server_count, local_count, out.added, out.removed
    );
    out
}

/// Apply a filled order on one leg. Returns the stream instruction, if any.
pub fn apply_fill(
    ticker: &str,
    leg: Leg,
    side: Side,
    symbol: Option<&str>,
    known: &mut Legs<bool>,
    set: &mut OpenPositionSet,
) -> Option<LegInstruction> {
    match side {
        Side::Buy => {
            // A second buy on an open leg supersedes the first; the leg still counts once.
            if !*known.get(leg) {
                set.add(ticker);
                *known.get_mut(leg) = true;
            }
            symbol
                .filter(|s| !s.is_empty())
                .map(|s| LegInstruction::Subscribe {
                    leg,
                    symbol: s.to_string(),
                })
        }
        Side::Sell => {
            if *known.get(leg) {
                set.remove_one(ticker);
                *known.get_mut(leg) = false;
            }
            Some(LegInstruction::Unsubscribe { leg })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionLeg;

    fn filled(symbol: &str) -> PositionLeg {
        PositionLeg {
            id: Some("1".into()),
            symbol: Some(symbol.into()),
            status: Some("filled".into()),
            side: Some(Side::Buy),
            qty: Some(1.0),
            exec_price: Some(1.2),
        }
    }

    fn report(put: PositionLeg, call: PositionLeg) -> PositionReport {
        PositionReport { put, call }
    }

    #[test]
    fn put_filled_call_empty_local_twice_removes_one_and_subscribes_put() {
        let mut set = OpenPositionSet::default();
        set.add("tsla");
        set.add("tsla");
        let mut known = Legs::default();

        let r = reconcile(
            "tsla",
            &report(filled("TSLA250321P210000.US"), PositionLeg::default()),
            &mut known,
            &mut set,
        );

        assert_eq!(set.count("tsla"), 1);
        assert_eq!(r.removed, 1);
        assert_eq!(r.added, 0);
        assert_eq!(
            r.instructions,
            vec![LegInstruction::Subscribe {
                leg: Leg::Put,
                symbol: "TSLA250321P210000.US".into()
            }]
        );
    }

    #[test]
    fn local_count_always_matches_server_count() {
        let legs = [PositionLeg::default(), filled("X250321C1.US")];
        for put in &legs {
            for call in &legs {
                for start in 0..4 {
                    let mut set = OpenPositionSet::default();
                    for _ in 0..start {
                        set.add("meta");
                    }
                    set.add("aapl");
                    let rep = report(put.clone(), call.clone());
                    let expected = [put, call].iter().filter(|l| l.is_filled_open()).count();
                    reconcile("meta", &rep, &mut Legs::default(), &mut set);
                    assert_eq!(set.count("meta"), expected);
                    assert_eq!(set.count("aapl"), 1, "other tickers untouched");
                }
            }
        }
    }

    #[test]
    fn newly_closed_leg_unsubscribes_and_unchanged_leg_is_silent() {
        let mut set = OpenPositionSet::default();
        set.add("net");
        set.add("net");
        let mut known = Legs { put: true, call: true };
        let sold = PositionLeg {
            side: Some(Side::Sell),
            status: Some("filled".into()),
            ..Default::default()
        };
        let r = reconcile("net", &report(filled("NET1P.US"), sold), &mut known, &mut set);
        assert_eq!(r.instructions, vec![LegInstruction::Unsubscribe { leg: Leg::Call }]);
        assert_eq!(known, Legs { put: true, call: false });
        assert_eq!(set.count("net"), 1);
    }

    #[test]
    fn pending_buy_is_not_open() {
        let mut set = OpenPositionSet::default();
        let pending = PositionLeg {
            status: Some("new".into()),
            ..filled("APP1C.US")
        };
        let r = reconcile("app", &report(PositionLeg::default(), pending), &mut Legs::default(), &mut set);
        assert!(r.instructions.is_empty());
        assert_eq!(set.count("app"), 0);
    }

    #[test]
    fn fills_open_and_close_legs() {
        let mut set = OpenPositionSet::default();
        let mut known = Legs::default();
        let i = apply_fill("pltr", Leg::Call, Side::Buy, Some("PLTR1C.US"), &mut known, &mut set);
        assert_eq!(
            i,
            Some(LegInstruction::Subscribe { leg: Leg::Call, symbol: "PLTR1C.US".into() })
        );
        // Re-buying the same open leg does not double count.
        apply_fill("pltr", Leg::Call, Side::Buy, Some("PLTR2C.US"), &mut known, &mut set);
        assert_eq!(set.count("pltr"), 1);

        let i = apply_fill("pltr", Leg::Call, Side::Sell, None, &mut known, &mut set);
        assert_eq!(i, Some(LegInstruction::Unsubscribe { leg: Leg::Call }));
        assert_eq!(set.count("pltr"), 0);
        assert!(!known.call);
    }
}
