//! Small helpers.

use crate::types::Leg;

/// Tickers are case-insensitive; the canonical form is lowercase.
pub fn sanitize_ticker(tk: &str) -> String {
    tk.trim().to_lowercase()
}

/// Infer the leg from an option symbol such as `TSLA250321P210000.US`:
/// the last `C` or `P` before the strike digits decides.
pub fn leg_from_symbol(symbol: &str) -> Option<Leg> {
    let body = symbol.split('.').next().unwrap_or(symbol);
    body.chars().rev().find_map(|c| match c {
        'C' | 'c' => Some(Leg::Call),
        'P' | 'p' => Some(Leg::Put),
        _ => None,
    })
}

/// Compact notation: 950 -> "950", 1234 -> "1.2K", 3_400_000 -> "3.4M".
pub fn compact_number(v: f64) -> String {
    let a = v.abs();
    let (scaled, suffix) = if a >= 1e12 {
        (v / 1e12, "T")
    } else if a >= 1e9 {
        (v / 1e9, "B")
    } else if a >= 1e6 {
        (v / 1e6, "M")
    } else if a >= 1e3 {
        (v / 1e3, "K")
    } else {
        (v, "")
    };
    let s = format!("{:.1}", scaled);
    let s = s.strip_suffix(".0").unwrap_or(&s).to_string();
    format!("{}{}", s, suffix)
}

/// "+1.25" / "-0.4" / "0".
pub fn signed(v: f64) -> String {
    if v > 0.0 {
        format!("+{}", trim_float(v))
    } else {
        trim_float(v)
    }
}

fn trim_float(v: f64) -> String {
    let s = format!("{:.3}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}
