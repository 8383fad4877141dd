//! Budget accounting for a run.
//!
//! The [`BudgetLedger`] is one of the two shared mutable resources of a run
//! (the other is the memory store). Stages never touch it directly; the
//! backend router reserves budget before every provider call and settles
//! the reservation with the actual charge.

mod ledger;

pub use ledger::{BudgetLedger, LedgerEntry, Reservation};
