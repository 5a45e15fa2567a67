//! Campaign definition store — campaigns and their ordered step lists.

pub mod store;
pub mod types;

pub use store::{CampaignStore, CounterKind};
pub use types::{
    BouncePolicy, Campaign, CampaignCounters, CampaignPatch, CampaignStatus, NewCampaign, NewStep,
    QuietHours, Step, StepContent, StepPatch,
};
