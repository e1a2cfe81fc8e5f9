// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How the user enters quantities: piece count or kilograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Unit,
    Weight,
}

/// Quotations offer three price breaks, direct orders exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    #[default]
    Quotation,
    Order,
}

impl LineKind {
    pub fn slot_count(&self) -> usize {
        match self {
            LineKind::Quotation => 3,
            LineKind::Order => 1,
        }
    }
}

/// Product configuration as supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductConfig {
    /// Units producible per kilogram. Missing or zero disables weight mode.
    pub conversion_factor: Option<Decimal>,
    pub ink_count_id: u32,
    pub faces_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub quantity_units: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub conversion_factor: Decimal,
    pub ink_count_id: u32,
    pub faces_id: u32,
}

/// Cost breakdown returned by the tariff service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub unit_price: Decimal,
    #[serde(default)]
    pub total_cost: Decimal,
    #[serde(default)]
    pub production_cost: Decimal,
    // informative only, not part of the unit price
    #[serde(default)]
    pub waste_cost: Decimal,
    #[serde(default)]
    pub weight_kg: Decimal,
}

/// One priced quantity option of a finished line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityOption {
    pub slot: usize,
    pub unit_count: u64,
    pub weight_kg: Decimal,
    pub unit_price: Option<Decimal>,
    pub overridden: bool,
}

/// What the composition form receives when a line is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineDraft {
    pub kind: LineKind,
    pub mode: DisplayMode,
    pub product: ProductConfig,
    pub options: Vec<QuantityOption>,
}

/// Recorded session activity (JSONL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    Scheduled { ts_ns: i128, slot: usize, seq: u64, request: CalculationRequest },
    Applied { ts_ns: i128, slot: usize, seq: u64, unit_price: Decimal },
    Discarded { ts_ns: i128, slot: usize, seq: u64, reason: String },
    Failed { ts_ns: i128, slot: usize, seq: u64, reason: String },
    Override { ts_ns: i128, slot: usize, unit_price: Option<Decimal> },
    Restored { ts_ns: i128, slot: usize },
    LineAdded { ts_ns: i128, line: LineDraft },
    Note(String),
}

pub fn now_ns() -> i128 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as i128
}
