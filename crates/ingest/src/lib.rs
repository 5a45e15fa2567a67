//! Response/event ingestor — maps asynchronous carrier signals (inbound
//! replies, delivery receipts, bounce notices, opt-out registrations) back
//! onto touches and enrollments.

pub mod ingestor;

pub use ingestor::{DeliveryEvent, DeliveryKind, EventIngestor, InboundResponse};
