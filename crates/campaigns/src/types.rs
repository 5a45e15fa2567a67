use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::types::Channel;

/// A drip campaign definition: an ordered multi-channel touch sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub owner_user_id: String,
    pub name: String,
    pub description: String,
    pub status: CampaignStatus,
    /// Free-form lead classification ("seller", "buyer", "expired", ...).
    pub lead_type: String,
    /// Do-not-disturb window, evaluated in the contact's timezone.
    pub quiet_hours: Option<QuietHours>,
    pub weekend_skip: bool,
    pub auto_pause_on_response: bool,
    pub auto_convert_on_response: bool,
    pub bounce_policy: BouncePolicy,
    pub steps: Vec<Step>,
    pub counters: CampaignCounters,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a campaign definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

/// Do-not-disturb window. `start > end` spans midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// What a hard bounce does to an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BouncePolicy {
    /// The bounced channel becomes undeliverable for the contact; the
    /// enrollment continues on other channels' steps.
    ChannelOnly,
    /// Any hard bounce terminates the whole enrollment.
    EntireEnrollment,
}

/// Derived aggregate counters, updated alongside the enrollment writes that
/// cause them. Eventually consistent with the enrollment rows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub enrolled: u64,
    pub responded: u64,
    pub converted: u64,
    pub opted_out: u64,
}

/// A single timed touch within a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 1-based, unique and contiguous within the campaign.
    pub step_number: u32,
    pub delay_days: u32,
    /// Delay measured from enrollment time rather than the previous step's
    /// actual send time.
    pub delay_from_enrollment: bool,
    pub channel: Channel,
    pub content: StepContent,
    pub skip_if_responded: bool,
    pub skip_if_converted: bool,
    /// Inactive steps are skipped but keep their number for historical
    /// touch references.
    pub active: bool,
}

/// Channel-specific content. Bodies support `{{variable}}` interpolation
/// from the enrollment context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepContent {
    Sms { body: String },
    Email { subject: String, body: String },
    DirectMail { piece_type: String, cost_credits: f64 },
    SocialDm { platform: String, body: String },
    PhoneReminder { note: String },
}

impl StepContent {
    pub fn channel(&self) -> Channel {
        match self {
            StepContent::Sms { .. } => Channel::Sms,
            StepContent::Email { .. } => Channel::Email,
            StepContent::DirectMail { .. } => Channel::DirectMail,
            StepContent::SocialDm { .. } => Channel::SocialDm,
            StepContent::PhoneReminder { .. } => Channel::PhoneReminder,
        }
    }
}

impl Campaign {
    /// Step with the given number, if present.
    pub fn step_at(&self, step_number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// First active step with `step_number >= from`.
    pub fn next_active_step(&self, from: u32) -> Option<&Step> {
        self.steps
            .iter()
            .filter(|s| s.active && s.step_number >= from)
            .min_by_key(|s| s.step_number)
    }

    pub fn has_active_step(&self) -> bool {
        self.steps.iter().any(|s| s.active)
    }
}

/// Input for creating a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub lead_type: String,
    pub quiet_hours: Option<QuietHours>,
    #[serde(default)]
    pub weekend_skip: bool,
    #[serde(default)]
    pub auto_pause_on_response: bool,
    #[serde(default)]
    pub auto_convert_on_response: bool,
    pub bounce_policy: BouncePolicy,
}

/// Partial update for a campaign. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<CampaignStatus>,
    pub lead_type: Option<String>,
    /// `Some(None)` clears the quiet-hours window.
    pub quiet_hours: Option<Option<QuietHours>>,
    pub weekend_skip: Option<bool>,
    pub auto_pause_on_response: Option<bool>,
    pub auto_convert_on_response: Option<bool>,
    pub bounce_policy: Option<BouncePolicy>,
}

/// Input for appending a step to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub delay_days: u32,
    #[serde(default)]
    pub delay_from_enrollment: bool,
    pub content: StepContent,
    #[serde(default)]
    pub skip_if_responded: bool,
    #[serde(default)]
    pub skip_if_converted: bool,
}

/// Partial update for a step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepPatch {
    pub delay_days: Option<u32>,
    pub delay_from_enrollment: Option<bool>,
    pub content: Option<StepContent>,
    pub skip_if_responded: Option<bool>,
    pub skip_if_converted: Option<bool>,
    pub active: Option<bool>,
}
