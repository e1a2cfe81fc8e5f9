// ===============================
// src/coordinator.rs
// ===============================
//
// Per-product pricing session.
//
// Every input change (quantity, mode, ink count, faces, factor) goes through
// the converter, then each active slot that is not overridden gets one
// debounced tariff call. Results are applied only while they still match
// the slot's current request; anything else is a stale result and dropped.
//
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::convert::{self, MinimumCheck};
use crate::domain::{
    now_ns, CalculationRequest, CalculationResult, DisplayMode, LineDraft, LineKind,
    ProductConfig, QuantityOption, SessionEvent,
};
use crate::metrics::{BELOW_MINIMUM, RESULTS};
use crate::overrides::OverrideTracker;
use crate::scheduler::{CallOutcome, CallPhase, DebouncedCallScheduler, Delivery, QUIESCENCE};
use crate::tariff::TariffService;

pub type PriceDelivery = Delivery<usize, CalculationRequest, CalculationResult>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("slot {0} does not exist on this line")]
    SlotOutOfRange(usize),
    #[error("quantity {raw:?} in slot {slot} is too large")]
    QuantityOutOfRange { slot: usize, raw: String },
    #[error("weight mode needs a conversion factor")]
    WeightModeUnavailable,
    #[error("invalid price: {0:?}")]
    InvalidPrice(String),
    #[error("slot {slot} is {deficit_kg} kg below the minimum order weight")]
    BelowMinimum { slot: usize, deficit_kg: Decimal },
    #[error("price for slot {slot} is still being calculated")]
    CalculationPending { slot: usize },
    #[error("no quantity entered")]
    NoQuantity,
    #[error("no product selected")]
    NoProduct,
}

/// Derived from slot fields and scheduler phase, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    Empty,
    PendingDebounce,
    InFlight,
    Resolved,
    Failed,
    Overridden,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Slot {
    pub raw_input: String,
    pub unit_count: u64,
    pub weight_kg: Decimal,
    /// Canonical per-unit price, computed or typed.
    pub unit_price: Option<Decimal>,
    pub price_text: String,
    pub breakdown: Option<CalculationResult>,
    /// Request the computed price belongs to.
    pub priced_for: Option<CalculationRequest>,
    pub failed: bool,
}

impl Slot {
    /// `None` while the slot has no weight.
    pub fn minimum_check(&self) -> Option<MinimumCheck> {
        (self.weight_kg > Decimal::ZERO).then(|| convert::validate_minimum(self.weight_kg))
    }

    fn clear_price(&mut self) {
        self.unit_price = None;
        self.price_text.clear();
        self.breakdown = None;
        self.priced_for = None;
        self.failed = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub raw_input: String,
    pub unit_count: u64,
    pub weight_kg: Decimal,
    pub unit_price: Option<Decimal>,
    pub price_text: String,
    pub overridden: bool,
    pub state: SlotState,
    pub minimum: Option<MinimumCheck>,
}

/// Snapshot read by the composition form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub kind: LineKind,
    pub mode: DisplayMode,
    pub weight_mode_available: bool,
    pub product: Option<ProductConfig>,
    pub slots: Vec<SlotView>,
    pub batch_error: Option<String>,
    pub notice: Option<String>,
    pub blocked: Option<String>,
}

#[derive(Debug)]
pub enum SessionCommand {
    SelectProduct(ProductConfig),
    SetQuantity { slot: usize, raw: String },
    SetMode(DisplayMode),
    SetInkCount(u32),
    SetFaces(u32),
    SetConversionFactor(Option<Decimal>),
    SetManualPrice { slot: usize, text: String },
    RestoreAutomatic { slot: usize },
    AddLine { respond_to: oneshot::Sender<Result<LineDraft, PricingError>> },
    Reset,
}

pub struct PricingSession {
    kind: LineKind,
    product: Option<ProductConfig>,
    mode: DisplayMode,
    slots: Vec<Slot>,
    overrides: OverrideTracker,
    scheduler: DebouncedCallScheduler<usize, CalculationRequest, CalculationResult>,
    tariff: Arc<dyn TariffService>,
    batch_error: Option<String>,
    notice: Option<String>,
    events: Option<mpsc::Sender<SessionEvent>>,
}

impl PricingSession {
    pub fn new(kind: LineKind, tariff: Arc<dyn TariffService>) -> Self {
        let n = kind.slot_count();
        Self {
            kind,
            product: None,
            mode: DisplayMode::Unit,
            slots: vec![Slot::default(); n],
            overrides: OverrideTracker::new(n),
            scheduler: DebouncedCallScheduler::new(QUIESCENCE),
            tariff,
            batch_error: None,
            notice: None,
            events: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, ev: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(ev);
        }
    }

    fn factor(&self) -> Option<Decimal> {
        self.product
            .as_ref()
            .and_then(|p| convert::usable_factor(p.conversion_factor))
    }

    fn check_slot(&self, slot: usize) -> Result<(), PricingError> {
        if slot < self.slots.len() {
            Ok(())
        } else {
            Err(PricingError::SlotOutOfRange(slot))
        }
    }

    fn product_mut(&mut self) -> Result<&mut ProductConfig, PricingError> {
        self.product.as_mut().ok_or(PricingError::NoProduct)
    }

    /// Slots, overrides and in-flight calls are always cleared together.
    fn clear_slots(&mut self) {
        self.scheduler.disable_all();
        self.slots.iter_mut().for_each(|s| *s = Slot::default());
        self.overrides.reset();
        self.batch_error = None;
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    pub fn select_product(&mut self, product: ProductConfig) {
        self.clear_slots();
        self.mode = convert::effective_mode(self.mode, product.conversion_factor);
        info!(factor = ?product.conversion_factor, mode = ?self.mode, "product selected");
        self.product = Some(product);
    }

    /// A quantity that cannot be represented is rejected and the slot keeps
    /// its previous input.
    pub fn set_quantity(&mut self, slot: usize, raw: &str) -> Result<(), PricingError> {
        self.check_slot(slot)?;
        convert::try_convert_one(raw, self.mode, self.factor()).map_err(|_| {
            PricingError::QuantityOutOfRange { slot, raw: raw.trim().to_string() }
        })?;
        self.slots[slot].raw_input = raw.to_string();
        self.recompute();
        Ok(())
    }

    /// Switching mode clears every slot so a number is never silently
    /// reinterpreted under the other unit.
    pub fn set_mode(&mut self, mode: DisplayMode) -> Result<DisplayMode, PricingError> {
        if mode == DisplayMode::Weight && self.factor().is_none() {
            return Err(PricingError::WeightModeUnavailable);
        }
        if mode != self.mode {
            self.mode = mode;
            self.clear_slots();
            info!(?mode, "display mode changed, slots cleared");
        }
        Ok(self.mode)
    }

    pub fn set_ink_count(&mut self, ink_count_id: u32) -> Result<(), PricingError> {
        self.product_mut()?.ink_count_id = ink_count_id;
        self.recompute();
        Ok(())
    }

    pub fn set_faces(&mut self, faces_id: u32) -> Result<(), PricingError> {
        self.product_mut()?.faces_id = faces_id;
        self.recompute();
        Ok(())
    }

    pub fn set_conversion_factor(&mut self, factor: Option<Decimal>) -> Result<(), PricingError> {
        self.product_mut()?.conversion_factor = factor;
        let mode = convert::effective_mode(self.mode, factor);
        if mode != self.mode {
            // kilogram inputs mean nothing without a factor
            self.mode = mode;
            self.clear_slots();
            warn!("conversion factor unusable, weight mode disabled");
        } else {
            self.recompute();
        }
        Ok(())
    }

    /// Typed price. Displayed per kg in weight mode, stored per unit.
    pub fn set_manual_price(&mut self, slot: usize, text: &str) -> Result<(), PricingError> {
        self.check_slot(slot)?;
        let text = text.trim();
        let price = if text.is_empty() {
            None
        } else {
            let p = convert::parse_price(text, self.mode, self.factor())
                .ok_or_else(|| PricingError::InvalidPrice(text.to_string()))?;
            Some(p)
        };

        // a response still on its way must not land on a typed price
        self.scheduler.cancel(&slot);
        self.overrides.mark_overridden(slot);

        let s = &mut self.slots[slot];
        s.unit_price = price;
        s.price_text = text.to_string();
        s.breakdown = None;
        s.priced_for = None;
        s.failed = false;
        self.refresh_batch_error();

        debug!(slot, ?price, "manual price");
        self.emit(SessionEvent::Override { ts_ns: now_ns(), slot, unit_price: price });
        Ok(())
    }

    /// Drop the override and schedule a fresh automatic price.
    pub fn restore_automatic(&mut self, slot: usize) -> Result<(), PricingError> {
        self.check_slot(slot)?;
        self.overrides.clear_override(slot);
        self.slots[slot].priced_for = None;
        self.refresh_slot(slot);
        info!(slot, "automatic price restored");
        self.emit(SessionEvent::Restored { ts_ns: now_ns(), slot });
        Ok(())
    }

    pub fn reset(&mut self) {
        self.clear_slots();
        self.product = None;
        self.mode = DisplayMode::Unit;
        self.notice = None;
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    fn recompute(&mut self) {
        let conv = {
            let raws: Vec<&str> = self.slots.iter().map(|s| s.raw_input.as_str()).collect();
            convert::convert(&raws, self.mode, self.factor())
        };
        self.mode = conv.mode;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.unit_count = conv.unit_counts[i];
            slot.weight_kg = conv.weights_kg[i];
        }
        for i in 0..self.slots.len() {
            self.refresh_slot(i);
        }
    }

    fn request_for(&self, slot: usize) -> Option<CalculationRequest> {
        let product = self.product.as_ref()?;
        let factor = self.factor()?;
        let units = self.slots.get(slot)?.unit_count;
        (units > 0).then(|| CalculationRequest {
            quantity_units: units,
            conversion_factor: factor,
            ink_count_id: product.ink_count_id,
            faces_id: product.faces_id,
        })
    }

    fn refresh_slot(&mut self, slot: usize) {
        if self.overrides.is_overridden(slot) {
            return;
        }
        let Some(req) = self.request_for(slot) else {
            self.scheduler.disable(&slot);
            self.slots[slot].clear_price();
            self.refresh_batch_error();
            return;
        };

        let s = &self.slots[slot];
        let up_to_date = match self.scheduler.live_payload(&slot) {
            Some(live) => *live == req,
            None => !s.failed && s.priced_for.as_ref() == Some(&req),
        };
        if up_to_date {
            return;
        }

        let tariff = self.tariff.clone();
        let seq = self
            .scheduler
            .schedule(slot, req.clone(), move |req| async move { tariff.calculate(req).await });
        self.slots[slot].failed = false;
        self.refresh_batch_error();

        debug!(slot, seq, units = req.quantity_units, "price calculation scheduled");
        self.emit(SessionEvent::Scheduled { ts_ns: now_ns(), slot, seq, request: req });
    }

    fn refresh_batch_error(&mut self) {
        if !self.slots.iter().any(|s| s.failed) {
            self.batch_error = None;
        }
    }

    #[cfg(test)]
    pub async fn next_delivery(&mut self) -> PriceDelivery {
        self.scheduler.next().await
    }

    pub fn apply(&mut self, d: PriceDelivery) {
        let slot = d.key;
        if self.check_slot(slot).is_err() {
            return;
        }
        let overridden = self.overrides.is_overridden(slot);
        let current = self.request_for(slot).as_ref() == Some(&d.payload);

        match d.outcome {
            CallOutcome::Resolved(res) => {
                if overridden {
                    RESULTS.with_label_values(&["overridden"]).inc();
                    self.discard(slot, d.seq, "slot overridden");
                    return;
                }
                if !current {
                    RESULTS.with_label_values(&["stale"]).inc();
                    self.discard(slot, d.seq, "quantity changed");
                    return;
                }
                let text = convert::format_price(res.unit_price, self.mode, self.factor());
                let unit_price = res.unit_price;
                let s = &mut self.slots[slot];
                s.unit_price = Some(unit_price);
                s.price_text = text;
                s.breakdown = Some(res);
                s.priced_for = Some(d.payload);
                s.failed = false;
                self.refresh_batch_error();

                RESULTS.with_label_values(&["applied"]).inc();
                debug!(slot, seq = d.seq, %unit_price, "price applied");
                self.emit(SessionEvent::Applied { ts_ns: now_ns(), slot, seq: d.seq, unit_price });
            }
            CallOutcome::Failed(reason) => {
                if overridden || !current {
                    RESULTS.with_label_values(&["stale"]).inc();
                    self.discard(slot, d.seq, "failure for outdated request");
                    return;
                }
                let s = &mut self.slots[slot];
                s.clear_price();
                s.failed = true;
                self.batch_error = Some(format!("Could not calculate the price: {reason}"));

                RESULTS.with_label_values(&["failed"]).inc();
                warn!(slot, seq = d.seq, %reason, "price calculation failed");
                self.emit(SessionEvent::Failed { ts_ns: now_ns(), slot, seq: d.seq, reason });
            }
            CallOutcome::Cancelled => {
                debug!(slot, seq = d.seq, "price calculation cancelled");
            }
        }
    }

    fn discard(&self, slot: usize, seq: u64, reason: &str) {
        debug!(slot, seq, reason, "result discarded");
        self.emit(SessionEvent::Discarded {
            ts_ns: now_ns(),
            slot,
            seq,
            reason: reason.to_string(),
        });
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    #[cfg(test)]
    pub fn mode(&self) -> DisplayMode {
        self.mode
    }

    #[cfg(test)]
    pub fn slot(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot)
    }

    #[cfg(test)]
    pub fn is_overridden(&self, slot: usize) -> bool {
        self.overrides.is_overridden(slot)
    }

    #[cfg(test)]
    pub fn batch_error(&self) -> Option<&str> {
        self.batch_error.as_deref()
    }

    pub fn slot_state(&self, slot: usize) -> SlotState {
        let Some(s) = self.slots.get(slot) else {
            return SlotState::Empty;
        };
        if self.overrides.is_overridden(slot) {
            return SlotState::Overridden;
        }
        match self.scheduler.phase(&slot) {
            Some(CallPhase::Pending) => SlotState::PendingDebounce,
            Some(CallPhase::InFlight) => SlotState::InFlight,
            None if s.unit_count == 0 => SlotState::Empty,
            None if s.failed => SlotState::Failed,
            None if s.unit_price.is_some() => SlotState::Resolved,
            None => SlotState::Empty,
        }
    }

    /// Adding the line is blocked while an active slot is under the minimum
    /// weight or still waiting for its price.
    pub fn check_line(&self) -> Result<(), PricingError> {
        if self.product.is_none() {
            return Err(PricingError::NoProduct);
        }
        let mut active = 0;
        for (i, s) in self.slots.iter().enumerate() {
            // a tiny weight can round to zero units but still counts
            if s.unit_count == 0 && s.weight_kg.is_zero() {
                continue;
            }
            active += 1;
            if let Some(MinimumCheck::BelowMinimum { deficit_kg }) = s.minimum_check() {
                return Err(PricingError::BelowMinimum { slot: i, deficit_kg });
            }
            if self.scheduler.is_busy(&i) {
                return Err(PricingError::CalculationPending { slot: i });
            }
        }
        if active == 0 {
            return Err(PricingError::NoQuantity);
        }
        Ok(())
    }

    /// Hand the priced options to the form and start over.
    pub fn take_line(&mut self) -> Result<LineDraft, PricingError> {
        if let Err(e) = self.check_line() {
            if matches!(e, PricingError::BelowMinimum { .. }) {
                BELOW_MINIMUM.inc();
            }
            return Err(e);
        }
        let product = self.product.clone().ok_or(PricingError::NoProduct)?;
        let options = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.unit_count > 0 || !s.weight_kg.is_zero())
            .map(|(i, s)| QuantityOption {
                slot: i,
                unit_count: s.unit_count,
                weight_kg: s.weight_kg,
                unit_price: s.unit_price,
                overridden: self.overrides.is_overridden(i),
            })
            .collect();
        let line = LineDraft { kind: self.kind, mode: self.mode, product, options };

        info!(options = line.options.len(), manual = self.overrides.any(), "line added");
        self.emit(SessionEvent::LineAdded { ts_ns: now_ns(), line: line.clone() });
        self.reset();
        Ok(line)
    }

    pub fn view(&self) -> SessionView {
        let slots = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, s)| SlotView {
                slot: i,
                raw_input: s.raw_input.clone(),
                unit_count: s.unit_count,
                weight_kg: s.weight_kg,
                unit_price: s.unit_price,
                price_text: s.price_text.clone(),
                overridden: self.overrides.is_overridden(i),
                state: self.slot_state(i),
                minimum: s.minimum_check(),
            })
            .collect();
        SessionView {
            kind: self.kind,
            mode: self.mode,
            weight_mode_available: self.factor().is_some(),
            product: self.product.clone(),
            slots,
            batch_error: self.batch_error.clone(),
            notice: self.notice.clone(),
            blocked: self.check_line().err().map(|e| e.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Task
    // -------------------------------------------------------------------------

    pub fn handle(&mut self, cmd: SessionCommand) {
        let res = match cmd {
            SessionCommand::SelectProduct(p) => {
                self.select_product(p);
                Ok(())
            }
            SessionCommand::SetQuantity { slot, raw } => self.set_quantity(slot, &raw),
            SessionCommand::SetMode(mode) => self.set_mode(mode).map(|_| ()),
            SessionCommand::SetInkCount(id) => self.set_ink_count(id),
            SessionCommand::SetFaces(id) => self.set_faces(id),
            SessionCommand::SetConversionFactor(f) => self.set_conversion_factor(f),
            SessionCommand::SetManualPrice { slot, text } => self.set_manual_price(slot, &text),
            SessionCommand::RestoreAutomatic { slot } => self.restore_automatic(slot),
            SessionCommand::AddLine { respond_to } => {
                let res = self.take_line();
                let out = res.as_ref().map(|_| ()).map_err(|e| e.clone());
                let _ = respond_to.send(res);
                out
            }
            SessionCommand::Reset => {
                self.reset();
                Ok(())
            }
        };
        self.notice = match res {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "command rejected");
                Some(e.to_string())
            }
        };
    }

    /// Session task: commands in, snapshots out.
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        view_tx: watch::Sender<SessionView>,
    ) {
        info!(kind = ?self.kind, tariff = self.tariff.name(), "pricing session started");
        let _ = view_tx.send(self.view());
        loop {
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.handle(cmd),
                        None => {
                            info!("pricing session: command channel closed, stopped");
                            break;
                        }
                    }
                }
                d = self.scheduler.next() => self.apply(d),
            }
            let _ = view_tx.send(self.view());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tariff::{mock_quote, MockTariff, TariffError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    /// Mock pricing with fixed latency, call counting and per-quantity failures.
    struct TestTariff {
        latency: Duration,
        calls: AtomicUsize,
        fail_units: Vec<u64>,
    }

    impl TestTariff {
        fn new(latency_ms: u64) -> Arc<Self> {
            Self::failing(latency_ms, vec![])
        }
        fn failing(latency_ms: u64, fail_units: Vec<u64>) -> Arc<Self> {
            Arc::new(Self {
                latency: Duration::from_millis(latency_ms),
                calls: AtomicUsize::new(0),
                fail_units,
            })
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TariffService for TestTariff {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn calculate(
            &self,
            req: CalculationRequest,
        ) -> Result<CalculationResult, TariffError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(self.latency).await;
            if self.fail_units.contains(&req.quantity_units) {
                return Err(TariffError::Status { code: 503, body: "busy".into() });
            }
            mock_quote(&req)
        }
    }

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn product() -> ProductConfig {
        ProductConfig { conversion_factor: Some(d("88.652")), ink_count_id: 1, faces_id: 1 }
    }

    fn session(tariff: Arc<TestTariff>) -> PricingSession {
        let mut s = PricingSession::new(LineKind::Quotation, tariff);
        s.select_product(product());
        s
    }

    fn expected_text(units: u64, mode: DisplayMode) -> String {
        let req = CalculationRequest {
            quantity_units: units,
            conversion_factor: d("88.652"),
            ink_count_id: 1,
            faces_id: 1,
        };
        convert::format_price(mock_quote(&req).unwrap().unit_price, mode, Some(d("88.652")))
    }

    /// Apply deliveries until nothing arrives for a while.
    async fn settle(s: &mut PricingSession) {
        while let Ok(d) = timeout(Duration::from_secs(5), s.next_delivery()).await {
            s.apply(d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn below_minimum_blocks_line_until_quantity_fixed() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());

        s.set_quantity(0, "2650").unwrap();
        settle(&mut s).await;
        match s.check_line() {
            Err(PricingError::BelowMinimum { slot: 0, deficit_kg }) => {
                assert!(deficit_kg > d("0.10") && deficit_kg < d("0.11"));
            }
            other => panic!("expected below minimum, got {other:?}"),
        }
        // editing stays possible and pricing still runs
        assert_eq!(s.slot_state(0), SlotState::Resolved);

        s.set_quantity(0, "2660").unwrap();
        settle(&mut s).await;
        assert_eq!(s.check_line(), Ok(()));
        assert_eq!(s.slot(0).unwrap().price_text, expected_text(2660, DisplayMode::Unit));
        assert_eq!(tariff.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mode_toggle_clears_every_slot() {
        let mut s = session(TestTariff::new(50));
        s.set_quantity(0, "5000").unwrap();
        s.set_quantity(2, "9000").unwrap();
        settle(&mut s).await;
        s.set_manual_price(2, "0.5").unwrap();

        assert_eq!(s.set_mode(DisplayMode::Weight), Ok(DisplayMode::Weight));
        for i in 0..3 {
            let slot = s.slot(i).unwrap();
            assert_eq!(slot, &Slot::default(), "slot {i}");
            assert_eq!(s.slot_state(i), SlotState::Empty);
            assert!(!s.is_overridden(i));
        }
        assert_eq!(s.check_line(), Err(PricingError::NoQuantity));
    }

    #[tokio::test(start_paused = true)]
    async fn weight_mode_prices_per_kilogram() {
        let mut s = session(TestTariff::new(50));
        s.set_mode(DisplayMode::Weight).unwrap();
        s.set_quantity(0, "30").unwrap();
        settle(&mut s).await;

        let slot = s.slot(0).unwrap();
        assert_eq!(slot.unit_count, 2660);
        assert_eq!(slot.weight_kg, d("30"));
        assert_eq!(slot.price_text, expected_text(2660, DisplayMode::Weight));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_price_survives_quantity_edits_until_restored() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        s.set_quantity(1, "3000").unwrap();
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 1);

        s.set_manual_price(1, "1.2500").unwrap();
        assert!(s.is_overridden(1));
        s.set_quantity(1, "4000").unwrap();
        settle(&mut s).await;
        assert_eq!(s.slot(1).unwrap().price_text, "1.2500");
        assert_eq!(s.slot(1).unwrap().unit_price, Some(d("1.25")));
        assert_eq!(s.slot_state(1), SlotState::Overridden);
        assert_eq!(tariff.calls(), 1);

        s.restore_automatic(1).unwrap();
        assert_eq!(s.slot_state(1), SlotState::PendingDebounce);
        // manual value stays visible until the new price lands
        assert_eq!(s.slot(1).unwrap().price_text, "1.2500");
        settle(&mut s).await;
        assert_eq!(s.slot(1).unwrap().price_text, expected_text(4000, DisplayMode::Unit));
        assert!(!s.is_overridden(1));
        assert_eq!(tariff.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_price_in_weight_mode_is_stored_per_unit() {
        let mut s = session(TestTariff::new(50));
        s.set_mode(DisplayMode::Weight).unwrap();
        s.set_quantity(0, "40").unwrap();
        s.set_manual_price(0, "8.8652").unwrap();
        assert_eq!(s.slot(0).unwrap().unit_price, Some(d("0.1")));
        assert_eq!(
            s.set_manual_price(0, "abc"),
            Err(PricingError::InvalidPrice("abc".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn typing_burst_issues_a_single_call() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        for raw in ["3", "30", "300", "3000"] {
            s.set_quantity(0, raw).unwrap();
            sleep(Duration::from_millis(120)).await;
        }
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 1);
        assert_eq!(s.slot(0).unwrap().price_text, expected_text(3000, DisplayMode::Unit));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_request_is_not_reissued() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        s.set_quantity(0, "3000").unwrap();
        settle(&mut s).await;
        s.set_quantity(0, " 3000 ").unwrap();
        s.set_quantity(1, "5000").unwrap();
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_response_never_overwrites_newer_quantity() {
        let tariff = TestTariff::new(2_000);
        let mut s = session(tariff.clone());
        s.set_quantity(0, "3000").unwrap();
        sleep(Duration::from_millis(700)).await;

        s.set_quantity(0, "4000").unwrap();
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 2);
        assert_eq!(s.slot(0).unwrap().price_text, expected_text(4000, DisplayMode::Unit));
    }

    #[tokio::test(start_paused = true)]
    async fn result_for_old_quantity_is_discarded() {
        let mut s = session(TestTariff::new(50));
        s.set_quantity(0, "3000").unwrap();
        let old = s.scheduler.live_payload(&0).cloned().unwrap();
        s.set_quantity(0, "4000").unwrap();

        let stale = Delivery {
            key: 0,
            seq: 1,
            payload: old,
            outcome: CallOutcome::Resolved(CalculationResult {
                unit_price: d("9.99"),
                total_cost: Decimal::ZERO,
                production_cost: Decimal::ZERO,
                waste_cost: Decimal::ZERO,
                weight_kg: Decimal::ZERO,
            }),
        };
        s.apply(stale);
        assert_eq!(s.slot(0).unwrap().unit_price, None);

        settle(&mut s).await;
        assert_eq!(s.slot(0).unwrap().price_text, expected_text(4000, DisplayMode::Unit));
    }

    #[tokio::test(start_paused = true)]
    async fn typed_price_wins_over_in_flight_result() {
        let mut s = session(TestTariff::new(1_000));
        s.set_quantity(0, "3000").unwrap();
        sleep(Duration::from_millis(700)).await;

        s.set_manual_price(0, "2").unwrap();
        settle(&mut s).await;
        assert_eq!(s.slot(0).unwrap().price_text, "2");
        assert_eq!(s.slot_state(0), SlotState::Overridden);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_once_for_the_batch() {
        let tariff = TestTariff::failing(50, vec![5000, 7000]);
        let mut s = session(tariff.clone());
        s.set_quantity(0, "3000").unwrap();
        s.set_quantity(1, "5000").unwrap();
        s.set_quantity(2, "7000").unwrap();
        settle(&mut s).await;

        assert_eq!(s.slot_state(0), SlotState::Resolved);
        assert_eq!(s.slot_state(1), SlotState::Failed);
        assert_eq!(s.slot_state(2), SlotState::Failed);
        let msg = s.batch_error().unwrap();
        assert!(msg.starts_with("Could not calculate the price"), "{msg}");

        // typing a price stays possible while the service fails
        s.set_manual_price(2, "0.2").unwrap();

        // next input change retries the failed slot
        s.set_quantity(1, "6000").unwrap();
        settle(&mut s).await;
        assert_eq!(s.slot_state(1), SlotState::Resolved);
        assert_eq!(s.batch_error(), None);
        assert_eq!(s.slot(0).unwrap().price_text, expected_text(3000, DisplayMode::Unit));
    }

    #[tokio::test(start_paused = true)]
    async fn ink_change_reprices_active_slots() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        s.set_quantity(0, "3000").unwrap();
        settle(&mut s).await;
        let before = s.slot(0).unwrap().unit_price.unwrap();

        s.set_ink_count(3).unwrap();
        assert_eq!(s.slot_state(0), SlotState::PendingDebounce);
        settle(&mut s).await;
        assert!(s.slot(0).unwrap().unit_price.unwrap() > before);
        assert_eq!(tariff.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_factor_disables_weight_mode_and_pricing() {
        let tariff = TestTariff::new(50);
        let mut s = PricingSession::new(LineKind::Quotation, tariff.clone());
        s.select_product(ProductConfig { conversion_factor: None, ink_count_id: 1, faces_id: 1 });

        assert_eq!(s.set_mode(DisplayMode::Weight), Err(PricingError::WeightModeUnavailable));
        s.set_quantity(0, "5000").unwrap();
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 0);
        assert_eq!(s.slot(0).unwrap().unit_count, 5000);
        assert!(!s.view().weight_mode_available);
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_factor_in_weight_mode_clears_slots() {
        let mut s = session(TestTariff::new(50));
        s.set_mode(DisplayMode::Weight).unwrap();
        s.set_quantity(0, "40").unwrap();
        s.set_conversion_factor(Some(Decimal::ZERO)).unwrap();
        assert_eq!(s.mode(), DisplayMode::Unit);
        assert_eq!(s.slot(0).unwrap(), &Slot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn clearing_quantity_empties_the_slot() {
        let mut s = session(TestTariff::new(50));
        s.set_quantity(0, "3000").unwrap();
        settle(&mut s).await;
        s.set_quantity(0, "").unwrap();
        assert_eq!(s.slot_state(0), SlotState::Empty);
        assert_eq!(s.slot(0).unwrap().unit_price, None);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_clear_issues_no_call() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        for raw in ["4", "45", "450", "4500"] {
            s.set_quantity(0, raw).unwrap();
            sleep(Duration::from_millis(100)).await;
        }
        s.set_quantity(0, "").unwrap();
        settle(&mut s).await;
        assert_eq!(tariff.calls(), 0);
        assert_eq!(s.slot_state(0), SlotState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_quantity_is_rejected_and_session_keeps_running() {
        let tariff = TestTariff::new(50);
        let mut s = session(tariff.clone());
        s.set_mode(DisplayMode::Weight).unwrap();
        s.set_quantity(0, "40").unwrap();

        let huge = "1000000000000000000000000000";
        assert_eq!(
            s.set_quantity(0, huge),
            Err(PricingError::QuantityOutOfRange { slot: 0, raw: huge.into() })
        );
        assert_eq!(s.slot(0).unwrap().raw_input, "40");
        assert_eq!(s.slot(0).unwrap().weight_kg, d("40"));

        settle(&mut s).await;
        assert_eq!(tariff.calls(), 1);
        assert_eq!(s.slot_state(0), SlotState::Resolved);
    }

    #[tokio::test(start_paused = true)]
    async fn weight_rounding_to_zero_units_still_blocks_on_minimum() {
        let mut s = session(TestTariff::new(50));
        s.set_mode(DisplayMode::Weight).unwrap();
        s.set_quantity(0, "0.001").unwrap();
        assert_eq!(s.slot(0).unwrap().unit_count, 0);

        let view = s.view();
        assert!(matches!(view.slots[0].minimum, Some(MinimumCheck::BelowMinimum { .. })));
        assert!(matches!(
            s.check_line(),
            Err(PricingError::BelowMinimum { slot: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn order_lines_have_one_slot() {
        let mut s = PricingSession::new(LineKind::Order, TestTariff::new(50));
        s.select_product(product());
        assert_eq!(s.set_quantity(1, "3000"), Err(PricingError::SlotOutOfRange(1)));
        assert_eq!(s.view().slots.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn take_line_waits_for_prices_then_resets() {
        let mut s = session(TestTariff::new(50));
        s.set_quantity(0, "3000").unwrap();
        s.set_quantity(2, "9000").unwrap();
        assert_eq!(s.take_line(), Err(PricingError::CalculationPending { slot: 0 }));

        settle(&mut s).await;
        let line = s.take_line().unwrap();
        assert_eq!(line.options.len(), 2);
        assert_eq!(line.options[1].slot, 2);
        assert!(line.options.iter().all(|o| o.unit_price.is_some() && !o.overridden));
        assert_eq!(s.check_line(), Err(PricingError::NoProduct));
    }

    #[tokio::test(start_paused = true)]
    async fn session_task_publishes_views_and_adds_lines() {
        let tariff = Arc::new(MockTariff::new(Duration::from_millis(50), 0.0));
        let s = PricingSession::new(LineKind::Quotation, tariff);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (view_tx, mut view_rx) = watch::channel(s.view());
        let task = tokio::spawn(s.run(cmd_rx, view_tx));

        cmd_tx.send(SessionCommand::SelectProduct(product())).await.unwrap();
        cmd_tx.send(SessionCommand::SetQuantity { slot: 0, raw: "3000".into() }).await.unwrap();

        let resolved = view_rx.wait_for(|v| v.slots[0].state == SlotState::Resolved);
        timeout(Duration::from_secs(5), resolved)
            .await
            .unwrap()
            .unwrap();

        let (tx, rx) = oneshot::channel();
        cmd_tx.send(SessionCommand::AddLine { respond_to: tx }).await.unwrap();
        let line = rx.await.unwrap().unwrap();
        assert_eq!(line.options[0].unit_count, 3000);

        drop(cmd_tx);
        task.await.unwrap();
    }
}
