//! dunner — invoice lifecycle and reminder engine.
//!
//! Watches detected invoices through a strict state machine, schedules
//! tone-escalating payment reminders on day offsets around the due date,
//! surfaces stuck-collection patterns, and records every action in an
//! append-only ledger. Reminders never reach a client without a human
//! approval.

pub mod approval;
pub mod channels;
pub mod db;
pub mod error;
pub mod escalation;
pub mod invoice;
mod migrations;
pub mod reminders;
pub mod scheduler;
pub mod state;
pub mod types;
