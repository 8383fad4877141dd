//! Append-only spend ledger with a hard cap.

use crate::core::BackendTier;
use crate::errors::BudgetExceededError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One charge against a run's budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The stage that made the call.
    pub stage: String,
    /// The tier the call was routed to.
    pub tier: BackendTier,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens consumed.
    pub output_tokens: u64,
    /// Cost in budget units.
    pub cost: f64,
    /// Whether the call returned a usable response.
    #[serde(default = "default_true")]
    pub succeeded: bool,
    /// When the charge was recorded (ISO 8601).
    #[serde(default)]
    pub recorded_at: String,
}

fn default_true() -> bool {
    true
}

impl LedgerEntry {
    /// Creates a successful entry.
    #[must_use]
    pub fn new(stage: impl Into<String>, tier: BackendTier, input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            stage: stage.into(),
            tier,
            input_tokens,
            output_tokens,
            cost,
            succeeded: true,
            recorded_at: crate::utils::iso_timestamp(),
        }
    }

    /// Marks the entry as a failed call that still consumed tokens.
    #[must_use]
    pub fn failed(mut self) -> Self {
        self.succeeded = false;
        self
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    total: f64,
    reserved: f64,
}

impl LedgerInner {
    fn release(&mut self, amount: f64) {
        self.reserved = (self.reserved - amount).max(0.0);
    }
}

/// Budget held for one in-flight call.
///
/// Settle it with the call's actual charge. Dropping an unsettled
/// reservation releases the held amount.
#[derive(Debug)]
#[must_use = "dropping a reservation releases it"]
pub struct Reservation<'a> {
    ledger: &'a BudgetLedger,
    amount: f64,
    open: bool,
}

impl Reservation<'_> {
    /// The amount held.
    pub fn amount(&self) -> f64 {
        self.amount
    }

    /// Records the actual charge and releases the hold in one step.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceededError` if the charge pushed an enforced ledger
    /// past its cap. The entry is recorded either way.
    pub fn settle(mut self, entry: LedgerEntry) -> Result<(), BudgetExceededError> {
        self.open = false;
        self.ledger.record(entry, self.amount)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.open {
            self.ledger.inner.lock().release(self.amount);
        }
    }
}

/// Tracks cumulative spend against a configured cap.
///
/// All mutations happen under one lock, so concurrent charges from sibling
/// stages are linearizable: every reader sees totals that correspond to a
/// prefix of the entry log.
#[derive(Debug)]
pub struct BudgetLedger {
    cap: f64,
    enforce: bool,
    inner: Mutex<LedgerInner>,
}

impl BudgetLedger {
    /// Creates an empty ledger with enforcement enabled.
    #[must_use]
    pub fn new(cap: f64) -> Self {
        Self {
            cap,
            enforce: true,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Enables or disables enforcement. Disabled ledgers only record.
    #[must_use]
    pub fn with_enforcement(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }

    /// Rebuilds a ledger from persisted entries.
    #[must_use]
    pub fn restore(cap: f64, enforce: bool, entries: Vec<LedgerEntry>) -> Self {
        let total = entries.iter().map(|e| e.cost).sum();
        Self {
            cap,
            enforce,
            inner: Mutex::new(LedgerInner {
                entries,
                total,
                reserved: 0.0,
            }),
        }
    }

    /// Appends a charge and re-checks the total against the cap.
    ///
    /// The entry is always recorded; the error only tells the caller to stop
    /// spending.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceededError` if enforcement is on and the total now
    /// exceeds the cap.
    pub fn charge(&self, entry: LedgerEntry) -> Result<(), BudgetExceededError> {
        self.record(entry, 0.0)
    }

    fn record(&self, entry: LedgerEntry, reserved: f64) -> Result<(), BudgetExceededError> {
        let mut inner = self.inner.lock();
        inner.release(reserved);
        inner.total += entry.cost;
        debug!(
            stage = %entry.stage,
            tier = %entry.tier,
            cost = entry.cost,
            total = inner.total,
            cap = self.cap,
            "Ledger charge"
        );
        inner.entries.push(entry);

        if self.enforce && inner.total > self.cap {
            warn!(total = inner.total, cap = self.cap, "Budget cap exceeded");
            return Err(BudgetExceededError {
                cap: self.cap,
                total: inner.total,
            });
        }
        Ok(())
    }

    /// Holds `expected` for a call about to be made.
    ///
    /// The check and the hold happen under the ledger lock, so concurrent
    /// callers cannot all pass against the same total. A call is refused
    /// when spent plus held budget has reached the cap, or when `expected`
    /// would not fit in what is left.
    ///
    /// # Errors
    ///
    /// Returns `BudgetExceededError` when enforcement is on and the call
    /// does not fit.
    pub fn try_reserve(&self, expected: f64) -> Result<Reservation<'_>, BudgetExceededError> {
        let expected = expected.max(0.0);
        let mut inner = self.inner.lock();
        let committed = inner.total + inner.reserved;
        if self.enforce && (committed >= self.cap || committed + expected > self.cap) {
            debug!(total = inner.total, reserved = inner.reserved, expected, cap = self.cap, "Reservation refused");
            return Err(BudgetExceededError {
                cap: self.cap,
                total: inner.total,
            });
        }
        inner.reserved += expected;
        Ok(Reservation {
            ledger: self,
            amount: expected,
            open: true,
        })
    }

    /// Budget currently held by unsettled reservations.
    #[must_use]
    pub fn reserved(&self) -> f64 {
        self.inner.lock().reserved
    }

    /// Fraction of the cap still unspent, clamped to `[0, 1]`.
    #[must_use]
    pub fn remaining_fraction(&self) -> f64 {
        if self.cap <= 0.0 {
            return 0.0;
        }
        ((self.cap - self.total()) / self.cap).clamp(0.0, 1.0)
    }

    /// Fraction of the cap already spent (may exceed 1 when not enforced).
    #[must_use]
    pub fn consumed_fraction(&self) -> f64 {
        if self.cap <= 0.0 {
            return 1.0;
        }
        self.total() / self.cap
    }

    /// Total spend so far.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.inner.lock().total
    }

    /// The configured cap.
    #[must_use]
    pub fn cap(&self) -> f64 {
        self.cap
    }

    /// Whether the cap is enforced.
    #[must_use]
    pub fn is_enforced(&self) -> bool {
        self.enforce
    }

    /// True once enforcement is on and the total has reached the cap.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.enforce && self.total() >= self.cap
    }

    /// True once enforcement is on and the total is strictly above the cap.
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        self.enforce && self.total() > self.cap
    }

    /// A copy of every entry, in charge order.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner.lock().entries.clone()
    }

    /// The entries to persist with a checkpoint, taken under one lock.
    ///
    /// Feed them back through [`BudgetLedger::restore`].
    #[must_use]
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        self.entries()
    }

    /// Number of entries recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns true if nothing has been charged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Spend per stage.
    #[must_use]
    pub fn spend_by_stage(&self) -> BTreeMap<String, f64> {
        let inner = self.inner.lock();
        let mut spend = BTreeMap::new();
        for entry in &inner.entries {
            *spend.entry(entry.stage.clone()).or_insert(0.0) += entry.cost;
        }
        spend
    }
}
