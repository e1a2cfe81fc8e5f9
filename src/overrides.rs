// ===============================
// src/overrides.rs
// ===============================
//
// Remembers which slot prices were typed by the user. Automation must not
// overwrite those until the user explicitly restores the automatic price.
// Quantity edits never clear a flag; only `clear_override` or `reset` do.
//

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTracker {
    flags: Vec<bool>,
}

impl OverrideTracker {
    pub fn new(slots: usize) -> Self {
        Self { flags: vec![false; slots] }
    }

    pub fn mark_overridden(&mut self, slot: usize) {
        if let Some(f) = self.flags.get_mut(slot) {
            *f = true;
        }
    }

    pub fn clear_override(&mut self, slot: usize) {
        if let Some(f) = self.flags.get_mut(slot) {
            *f = false;
        }
    }

    pub fn is_overridden(&self, slot: usize) -> bool {
        self.flags.get(slot).copied().unwrap_or(false)
    }

    /// Mode switch or product change.
    pub fn reset(&mut self) {
        self.flags.iter_mut().for_each(|f| *f = false);
    }

    pub fn any(&self) -> bool {
        self.flags.iter().any(|f| *f)
    }
}
