use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::types::Channel;

/// A contact progressing through one campaign's touch sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: String,
    pub deal_id: Option<Uuid>,
    /// 1-based number of the next step to execute.
    pub current_step: u32,
    /// Non-null iff status is `Active` and a remaining active step exists.
    pub next_touch_at: Option<DateTime<Utc>>,
    pub status: EnrollmentStatus,
    pub touches_sent: u32,
    pub touches_delivered: u32,
    pub touches_failed: u32,
    pub last_touch_at: Option<DateTime<Utc>>,
    pub last_touch_channel: Option<Channel>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_channel: Option<Channel>,
    pub response_body: Option<String>,
    pub converted_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub pause_reason: Option<String>,
    /// Free-form key/value map used for template interpolation.
    pub context: serde_json::Value,
    /// Contact's UTC offset in minutes, captured at enrollment. Quiet hours
    /// and weekend skips are evaluated in this offset.
    pub utc_offset_minutes: i32,
    /// Set when a direct-mail reservation failed for lack of credits.
    pub low_balance: bool,
    /// Claim lease: a scheduler worker owns this enrollment until the lease
    /// expires. Compare-and-set under the store's entry lock.
    pub claimed_until: Option<DateTime<Utc>>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Responded,
    Converted,
    OptedOut,
    Bounced,
    Expired,
}

impl EnrollmentStatus {
    /// Terminal states never leave via the state machine (expiry excepted
    /// where the transition table allows it).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed
                | EnrollmentStatus::Converted
                | EnrollmentStatus::OptedOut
                | EnrollmentStatus::Expired
        )
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Responded => "responded",
            EnrollmentStatus::Converted => "converted",
            EnrollmentStatus::OptedOut => "opted_out",
            EnrollmentStatus::Bounced => "bounced",
            EnrollmentStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// Input for enrolling one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub contact_id: String,
    pub deal_id: Option<Uuid>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Per-contact context merged over the request-level context.
    pub context: Option<serde_json::Value>,
}

impl Enrollment {
    /// True when the claim lease is free or expired at `now`.
    pub fn claimable(&self, now: DateTime<Utc>) -> bool {
        match self.claimed_until {
            Some(until) => until <= now,
            None => true,
        }
    }
}
