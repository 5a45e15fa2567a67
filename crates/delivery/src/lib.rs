//! Touch delivery — the scheduler that decides when each enrolled contact's
//! next touch fires, the executor that dispatches it, the append-only touch
//! log, and the channel-sender seam to the messaging providers.

pub mod executor;
pub mod scheduler;
pub mod send_window;
pub mod senders;
pub mod touch;

pub use executor::{TouchExecutor, TouchOutcome};
pub use scheduler::{schedule_next, TouchRequest, TouchScheduler};
pub use senders::{
    ChannelSender, HardBouncingSender, OutboundMessage, SendError, SendReceipt, SenderRegistry,
    SimulatedSender,
};
pub use touch::{DirectMailDetail, SkipReason, Touch, TouchLog, TouchStatus};
