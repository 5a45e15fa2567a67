//! Drip engine facade — composes the campaign, enrollment, touch, ledger,
//! and opt-out stores behind the synchronous command surface the
//! presentation layer calls, while scheduling/execution/ingestion run as
//! background passes.

pub mod engine;

pub use engine::{DripEngine, EnrollOutcome, EnrollmentDetail, TickSummary};
