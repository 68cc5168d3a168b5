//! Relative price comparison used for every "is this the same price" question
//! in the engine. Order ids are venue-local and market fills carry no limit
//! price, so matching is always done by price within a tolerance.

use rust_decimal::Decimal;

/// `|price - target| / target`. Returns `None` for a non-positive target.
pub fn relative_diff(price: Decimal, target: Decimal) -> Option<Decimal> {
    if target <= Decimal::ZERO {
        return None;
    }
    Some((price - target).abs() / target)
}

/// True when `price` lies within `tolerance` (a fraction, e.g. 0.001 for 0.1%) of `target`.
pub fn within_tolerance(price: Decimal, target: Decimal, tolerance: Decimal) -> bool {
    match relative_diff(price, target) {
        Some(diff) => diff <= tolerance,
        None => false,
    }
}
