//! Opt-out registry — per-contact, per-channel consent state, consulted
//! before every send.

pub mod registry;

pub use registry::{OptOutReason, OptOutRecord, OptOutRegistry, OptOutSource};
