// ===============================
// src/convert.rs
// ===============================
//
// Quantity <-> weight conversion and the minimum order rule.
// Pure functions; rounding is fixed so redisplaying the same input always
// yields the same derived values.
//
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::DisplayMode;

/// Orders below this weight (kg) cannot be submitted. Boundary is inclusive.
pub const MIN_ORDER_KG: Decimal = Decimal::from_parts(30, 0, 0, false, 0);

const WEIGHT_DP: u32 = 4;
const PRICE_DP: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    /// Mode actually used; `Unit` whenever the factor is unusable.
    pub mode: DisplayMode,
    pub unit_counts: Vec<u64>,
    pub weights_kg: Vec<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinimumCheck {
    Pass,
    BelowMinimum { deficit_kg: Decimal },
}

pub fn usable_factor(factor: Option<Decimal>) -> Option<Decimal> {
    factor.filter(|f| *f > Decimal::ZERO)
}

pub fn weight_mode_available(factor: Option<Decimal>) -> bool {
    usable_factor(factor).is_some()
}

pub fn effective_mode(requested: DisplayMode, factor: Option<Decimal>) -> DisplayMode {
    if weight_mode_available(factor) {
        requested
    } else {
        DisplayMode::Unit
    }
}

/// Quantity too large to be held as a whole unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("quantity out of range")]
pub struct OutOfRange;

/// Blank, unparsable or non-positive input means "no slot".
pub fn parse_quantity(raw: &str) -> Option<Decimal> {
    let v = raw.trim().parse::<Decimal>().ok()?;
    (v > Decimal::ZERO).then_some(v)
}

fn whole_units(v: Decimal) -> Option<u64> {
    v.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
}

/// Derive unit count and weight for a single raw input. Empty input gives
/// `(0, 0)`; a quantity beyond `u64` units or decimal range is `OutOfRange`.
pub fn try_convert_one(
    raw: &str,
    mode: DisplayMode,
    factor: Option<Decimal>,
) -> Result<(u64, Decimal), OutOfRange> {
    let Some(qty) = parse_quantity(raw) else {
        return Ok((0, Decimal::ZERO));
    };
    let factor = usable_factor(factor);
    match (effective_mode(mode, factor), factor) {
        (DisplayMode::Weight, Some(f)) => {
            let units = qty.checked_mul(f).and_then(whole_units).ok_or(OutOfRange)?;
            Ok((units, qty))
        }
        (_, Some(f)) => {
            let units = whole_units(qty).ok_or(OutOfRange)?;
            let weight = Decimal::from(units)
                .checked_div(f)
                .ok_or(OutOfRange)?
                .round_dp_with_strategy(WEIGHT_DP, RoundingStrategy::MidpointAwayFromZero);
            Ok((units, weight))
        }
        (_, None) => Ok((whole_units(qty).ok_or(OutOfRange)?, Decimal::ZERO)),
    }
}

/// Like [`try_convert_one`], out-of-range quantities count as empty.
pub fn convert_one(raw: &str, mode: DisplayMode, factor: Option<Decimal>) -> (u64, Decimal) {
    try_convert_one(raw, mode, factor).unwrap_or((0, Decimal::ZERO))
}

pub fn convert<S: AsRef<str>>(
    raw_inputs: &[S],
    mode: DisplayMode,
    factor: Option<Decimal>,
) -> Conversion {
    let mode = effective_mode(mode, factor);
    let (unit_counts, weights_kg) = raw_inputs
        .iter()
        .map(|raw| convert_one(raw.as_ref(), mode, factor))
        .unzip();
    Conversion { mode, unit_counts, weights_kg }
}

pub fn validate_minimum(weight_kg: Decimal) -> MinimumCheck {
    if weight_kg < MIN_ORDER_KG {
        MinimumCheck::BelowMinimum { deficit_kg: MIN_ORDER_KG - weight_kg }
    } else {
        MinimumCheck::Pass
    }
}

/// Displayed price: per unit in unit mode, per kilogram in weight mode.
pub fn format_price(unit_price: Decimal, mode: DisplayMode, factor: Option<Decimal>) -> String {
    let shown = match (effective_mode(mode, factor), usable_factor(factor)) {
        (DisplayMode::Weight, Some(f)) => unit_price.saturating_mul(f),
        _ => unit_price,
    };
    let shown = shown.round_dp_with_strategy(PRICE_DP, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.4}", shown)
}

/// Inverse of [`format_price`]: canonical per-unit price from a typed value.
pub fn parse_price(
    displayed: &str,
    mode: DisplayMode,
    factor: Option<Decimal>,
) -> Option<Decimal> {
    let v = displayed.trim().parse::<Decimal>().ok()?;
    if v < Decimal::ZERO {
        return None;
    }
    match (effective_mode(mode, factor), usable_factor(factor)) {
        (DisplayMode::Weight, Some(f)) => v.checked_div(f),
        _ => Some(v),
    }
}
