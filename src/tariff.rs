// ===============================
// src/tariff.rs
// ===============================
//
// Remote tariff pricing service adapters:
// - MockTariff : weight-band pricing with artificial latency (and optional
//                random rejections) for local runs
// - HttpTariff : JSON POST to `{TARIFF_URL}/calculate`
//
// Both are cancel-safe: dropping the future abandons the call.
//
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

use crate::config::{TariffCfg, TariffMode};
use crate::domain::{CalculationRequest, CalculationResult};
use crate::metrics::TARIFF_LATENCY;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TariffError {
    #[error("tariff service unreachable: {0}")]
    Transport(String),
    #[error("tariff service answered {code}: {body}")]
    Status { code: u16, body: String },
    #[error("invalid tariff response: {0}")]
    Decode(String),
    #[error("tariff rejected the request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait TariffService: Send + Sync {
    fn name(&self) -> &'static str;
    async fn calculate(&self, req: CalculationRequest) -> Result<CalculationResult, TariffError>;
}

pub fn build(cfg: &TariffCfg) -> Result<Arc<dyn TariffService>, TariffError> {
    Ok(match cfg.mode {
        TariffMode::Mock => Arc::new(MockTariff::new(cfg.mock_latency, cfg.mock_fail_rate)),
        TariffMode::Http => Arc::new(HttpTariff::new(&cfg.url, cfg.timeout)?),
    })
}

// -----------------------------------------------------------------------------
// Mock
// -----------------------------------------------------------------------------
pub struct MockTariff {
    latency: Duration,
    fail_rate: f64,
}

impl MockTariff {
    pub fn new(latency: Duration, fail_rate: f64) -> Self {
        Self { latency, fail_rate: fail_rate.clamp(0.0, 1.0) }
    }
}

fn d(num: i64, scale: u32) -> Decimal {
    Decimal::new(num, scale)
}

/// Per-kg rate by weight band.
fn band_rate(weight_kg: Decimal) -> Decimal {
    if weight_kg < d(100, 0) {
        d(950, 2)
    } else if weight_kg < d(500, 0) {
        d(820, 2)
    } else if weight_kg < d(1000, 0) {
        d(740, 2)
    } else {
        d(690, 2)
    }
}

fn waste_pct(weight_kg: Decimal) -> Decimal {
    if weight_kg < d(100, 0) {
        d(12, 2)
    } else if weight_kg < d(500, 0) {
        d(8, 2)
    } else {
        d(5, 2)
    }
}

/// Illustrative pricing only; the real tables live in the tariff service.
pub fn mock_quote(req: &CalculationRequest) -> Result<CalculationResult, TariffError> {
    if req.quantity_units == 0 {
        return Err(TariffError::Rejected("quantity must be positive".into()));
    }
    if req.conversion_factor <= Decimal::ZERO {
        return Err(TariffError::Rejected("conversion factor must be positive".into()));
    }
    let out_of_range = || TariffError::Rejected("quantity out of pricing range".into());
    let units = Decimal::from(req.quantity_units);
    let weight_kg = units.checked_div(req.conversion_factor).ok_or_else(out_of_range)?;

    let ink = d(35, 2) * Decimal::from(req.ink_count_id);
    let faces = if req.faces_id >= 2 {
        d(110, 2)
    } else {
        Decimal::ONE
    };
    let production_cost = weight_kg
        .checked_mul(band_rate(weight_kg) + ink)
        .and_then(|v| v.checked_mul(faces))
        .ok_or_else(out_of_range)?;
    let waste_cost = production_cost * waste_pct(weight_kg);
    // waste is reported, not charged
    let total_cost = production_cost;

    let round =
        |v: Decimal, dp| v.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    Ok(CalculationResult {
        unit_price: round(total_cost / units, 4),
        total_cost: round(total_cost, 2),
        production_cost: round(production_cost, 2),
        waste_cost: round(waste_cost, 2),
        weight_kg: round(weight_kg, 4),
    })
}

#[async_trait]
impl TariffService for MockTariff {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn calculate(&self, req: CalculationRequest) -> Result<CalculationResult, TariffError> {
        // don't hold ThreadRng across .await
        let reject = self.fail_rate > 0.0 && rand::thread_rng().gen_bool(self.fail_rate);
        let t0 = Instant::now();
        sleep(self.latency).await;
        TARIFF_LATENCY.observe(t0.elapsed().as_secs_f64() * 1000.0);
        if reject {
            return Err(TariffError::Rejected("simulated outage".into()));
        }
        mock_quote(&req)
    }
}

// -----------------------------------------------------------------------------
// HTTP
// -----------------------------------------------------------------------------
pub struct HttpTariff {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTariff {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TariffError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TariffError::Transport(e.to_string()))?;
        let endpoint = format!("{}/calculate", base_url.trim_end_matches('/'));
        Ok(Self { http, endpoint })
    }

    #[cfg(test)]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TariffService for HttpTariff {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn calculate(&self, req: CalculationRequest) -> Result<CalculationResult, TariffError> {
        let t0 = Instant::now();
        let rsp = self
            .http
            .post(&self.endpoint)
            .json(&req)
            .send()
            .await
            .map_err(|e| TariffError::Transport(e.to_string()))?;
        TARIFF_LATENCY.observe(t0.elapsed().as_secs_f64() * 1000.0);

        let status = rsp.status();
        if !status.is_success() {
            let body = rsp.text().await.unwrap_or_default();
            tracing::warn!(code = status.as_u16(), %body, "tariff call failed");
            return Err(TariffError::Status { code: status.as_u16(), body });
        }
        rsp.json::<CalculationResult>()
            .await
            .map_err(|e| TariffError::Decode(e.to_string()))
    }
}
