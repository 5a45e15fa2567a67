use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound channel a drip step can fire on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    DirectMail,
    SocialDm,
    PhoneReminder,
}

impl Channel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::DirectMail => "direct_mail",
            Channel::SocialDm => "social_dm",
            Channel::PhoneReminder => "phone_reminder",
        }
    }

    /// Channels that debit the credit ledger before dispatch.
    pub fn is_paid(&self) -> bool {
        matches!(self, Channel::DirectMail)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Identity attached to every mutation coming in from the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActingUser {
    pub user_id: String,
    pub admin: bool,
}

impl ActingUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: false,
        }
    }

    /// Background workers act with full rights.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            admin: true,
        }
    }
}

/// Lifecycle events emitted into the analytics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EnrollmentCreated,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentRemoved,
    EnrollmentCompleted,
    EnrollmentExpired,
    EnrollmentBounced,
    EnrollmentOptedOut,
    TouchScheduled,
    TouchSent,
    TouchDelivered,
    TouchSkipped,
    TouchFailed,
    TouchBounced,
    ResponseReceived,
    ConversionRecorded,
    OptOutRegistered,
    CreditsPurchased,
    CreditsReserved,
    CreditsCommitted,
    CreditsReleased,
    CreditsRefunded,
}

/// A single analytics event. Emitted through an `EventSink`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DripEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Option<Uuid>,
    pub enrollment_id: Option<Uuid>,
    pub touch_id: Option<Uuid>,
    pub contact_id: Option<String>,
    pub channel: Option<Channel>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}
