//! Deterministic interest-rate pricing.
//!
//! The rate feeds recorded quotes, so the arithmetic here is frozen: changing
//! any weight silently invalidates every loan priced before the change.

/// Interest rate in percent for a prospective loan.
///
/// War risk carries 0.75 of the risk factor, reputation shortfall the
/// remaining 0.25. The factor scales a 0.9 spread over a 10% baseline; each
/// open loan adds 5 points, each settled loan refunds half a point, and the
/// result is rounded to two decimals with a 1% house minimum.
pub fn interest_rate(war_risk: f64, reputation: f64, open_loans: u32, closed_loans: u32) -> f64 {
    let risk_factor = 0.75 * war_risk + 0.25 * (1.0 - reputation);
    let base_rate = (0.9 * risk_factor + 0.1) * 100.0;
    let adjusted = base_rate + 5.0 * f64::from(open_loans) - 0.5 * f64::from(closed_loans);
    let rounded = (adjusted * 100.0).round() / 100.0;
    rounded.max(1.0)
}
