//! Append-only touch execution log with provider-id and per-enrollment
//! indexes for webhook lookups and in-flight checks.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_campaigns::{Step, StepContent};
use drip_core::error::{DripError, DripResult};
use drip_core::types::Channel;
use drip_enrollment::Enrollment;

/// Status of a touch through its lifecycle. `Pending` and `Sending` are the
/// only non-terminal states; everything else is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchStatus {
    Pending,
    Sending,
    Skipped,
    Sent,
    Delivered,
    Failed,
    Bounced,
}

impl TouchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TouchStatus::Pending | TouchStatus::Sending)
    }
}

/// Why a step was skipped instead of sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyResponded,
    AlreadyConverted,
    OptedOut,
    EnrollmentEnded,
}

/// Direct-mail specifics carried on the touch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMailDetail {
    pub piece_type: String,
    pub cost_credits: f64,
    pub tracking_number: Option<String>,
}

/// One executed (or skipped, or attempted) step for one enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Touch {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: String,
    pub step_number: u32,
    pub channel: Channel,
    pub status: TouchStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub response_received: bool,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub direct_mail: Option<DirectMailDetail>,
    /// Ledger escrow backing this touch, when the channel is paid.
    pub reservation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Touch {
    fn base(enrollment: &Enrollment, step: &Step, now: DateTime<Utc>) -> Self {
        let direct_mail = match &step.content {
            StepContent::DirectMail { piece_type, cost_credits } => Some(DirectMailDetail {
                piece_type: piece_type.clone(),
                cost_credits: *cost_credits,
                tracking_number: None,
            }),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            campaign_id: enrollment.campaign_id,
            contact_id: enrollment.contact_id.clone(),
            step_number: step.step_number,
            channel: step.channel,
            status: TouchStatus::Pending,
            scheduled_at: now,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            provider_message_id: None,
            retry_count: 0,
            last_retry_at: None,
            response_received: false,
            responded_at: None,
            response_body: None,
            error: None,
            skip_reason: None,
            direct_mail,
            reservation_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A touch ready for execution.
    pub fn pending(
        enrollment: &Enrollment,
        step: &Step,
        scheduled_at: DateTime<Utc>,
        reservation_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut touch = Self::base(enrollment, step, now);
        touch.scheduled_at = scheduled_at;
        touch.reservation_id = reservation_id;
        touch
    }

    /// A skipped step, recorded for auditability.
    pub fn skipped(
        enrollment: &Enrollment,
        step: &Step,
        reason: SkipReason,
        now: DateTime<Utc>,
    ) -> Self {
        let mut touch = Self::base(enrollment, step, now);
        touch.status = TouchStatus::Skipped;
        touch.skip_reason = Some(reason);
        touch
    }
}

/// Thread-safe, append-only touch log backed by `DashMap`.
pub struct TouchLog {
    touches: DashMap<Uuid, Touch>,
    by_enrollment: DashMap<Uuid, Vec<Uuid>>,
    /// Maps provider message id -> touch id for webhook lookups.
    provider_index: DashMap<String, Uuid>,
}

impl TouchLog {
    pub fn new() -> Self {
        Self {
            touches: DashMap::new(),
            by_enrollment: DashMap::new(),
            provider_index: DashMap::new(),
        }
    }

    pub fn insert(&self, touch: Touch) {
        self.by_enrollment
            .entry(touch.enrollment_id)
            .or_default()
            .push(touch.id);
        self.touches.insert(touch.id, touch);
    }

    pub fn get(&self, id: &Uuid) -> Option<Touch> {
        self.touches.get(id).map(|t| t.clone())
    }

    pub fn update<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Touch) -> DripResult<R>,
    ) -> DripResult<R> {
        let mut t = self
            .touches
            .get_mut(id)
            .ok_or_else(|| DripError::NotFound(format!("touch {id}")))?;
        let result = f(&mut t)?;
        t.updated_at = Utc::now();
        Ok(result)
    }

    pub fn link_provider(&self, provider_message_id: &str, touch_id: Uuid) {
        self.provider_index
            .insert(provider_message_id.to_string(), touch_id);
    }

    pub fn by_provider(&self, provider_message_id: &str) -> Option<Touch> {
        let id = *self.provider_index.get(provider_message_id)?.value();
        self.get(&id)
    }

    /// All touches for an enrollment, oldest first.
    pub fn list_for_enrollment(&self, enrollment_id: &Uuid) -> Vec<Touch> {
        let ids = match self.by_enrollment.get(enrollment_id) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };
        let mut touches: Vec<Touch> = ids.iter().filter_map(|id| self.get(id)).collect();
        touches.sort_by_key(|t| t.created_at);
        touches
    }

    /// The single non-terminal touch for an enrollment, if any. The
    /// scheduler refuses to create a second one — this is the engine's
    /// at-most-once-in-flight guarantee made observable.
    pub fn open_for_enrollment(&self, enrollment_id: &Uuid) -> Option<Touch> {
        self.list_for_enrollment(enrollment_id)
            .into_iter()
            .find(|t| !t.status.is_terminal())
    }

    /// Latest sent/delivered touch for a contact on a channel. Fallback for
    /// inbound replies that carry no provider message id.
    pub fn latest_outbound_for_contact(&self, contact_id: &str, channel: Channel) -> Option<Touch> {
        self.touches
            .iter()
            .filter(|t| {
                let t = t.value();
                t.contact_id == contact_id
                    && t.channel == channel
                    && matches!(t.status, TouchStatus::Sent | TouchStatus::Delivered)
            })
            .map(|t| t.value().clone())
            .max_by_key(|t| t.sent_at)
    }

    /// Mark any in-flight touch for the enrollment as skipped (used when an
    /// enrollment is removed). Returns the number of touches cancelled.
    pub fn cancel_open(&self, enrollment_id: &Uuid, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for touch in self.list_for_enrollment(enrollment_id) {
            if touch.status.is_terminal() {
                continue;
            }
            let _ = self.update(&touch.id, |t| {
                t.status = TouchStatus::Skipped;
                t.skip_reason = Some(SkipReason::EnrollmentEnded);
                t.scheduled_at = t.scheduled_at.min(now);
                Ok(())
            });
            cancelled += 1;
        }
        cancelled
    }

    pub fn count(&self) -> usize {
        self.touches.len()
    }
}

impl Default for TouchLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_campaigns::Step;
    use drip_enrollment::EnrollmentStatus;

    fn make_enrollment() -> Enrollment {
        let now = Utc::now();
        Enrollment {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            contact_id: "c-1".into(),
            deal_id: None,
            current_step: 1,
            next_touch_at: Some(now),
            status: EnrollmentStatus::Active,
            touches_sent: 0,
            touches_delivered: 0,
            touches_failed: 0,
            last_touch_at: None,
            last_touch_channel: None,
            responded_at: None,
            response_channel: None,
            response_body: None,
            converted_at: None,
            paused_at: None,
            pause_reason: None,
            context: serde_json::json!({}),
            utc_offset_minutes: 0,
            low_balance: false,
            claimed_until: None,
            enrolled_at: now,
            updated_at: now,
        }
    }

    fn make_step(step_number: u32) -> Step {
        Step {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            step_number,
            delay_days: 0,
            delay_from_enrollment: true,
            channel: Channel::Sms,
            content: StepContent::Sms { body: "hi".into() },
            skip_if_responded: false,
            skip_if_converted: false,
            active: true,
        }
    }

    #[test]
    fn test_open_for_enrollment_sees_only_non_terminal() {
        let log = TouchLog::new();
        let enrollment = make_enrollment();
        let now = Utc::now();

        let skipped = Touch::skipped(&enrollment, &make_step(1), SkipReason::OptedOut, now);
        log.insert(skipped);
        assert!(log.open_for_enrollment(&enrollment.id).is_none());

        let pending = Touch::pending(&enrollment, &make_step(2), now, None, now);
        let pending_id = pending.id;
        log.insert(pending);
        assert_eq!(log.open_for_enrollment(&enrollment.id).unwrap().id, pending_id);

        log.update(&pending_id, |t| {
            t.status = TouchStatus::Sent;
            t.sent_at = Some(now);
            Ok(())
        })
        .unwrap();
        assert!(log.open_for_enrollment(&enrollment.id).is_none());
    }

    #[test]
    fn test_provider_index_roundtrip() {
        let log = TouchLog::new();
        let enrollment = make_enrollment();
        let now = Utc::now();
        let touch = Touch::pending(&enrollment, &make_step(1), now, None, now);
        let id = touch.id;
        log.insert(touch);

        log.link_provider("SM123", id);
        assert_eq!(log.by_provider("SM123").unwrap().id, id);
        assert!(log.by_provider("SM999").is_none());
    }

    #[test]
    fn test_cancel_open() {
        let log = TouchLog::new();
        let enrollment = make_enrollment();
        let now = Utc::now();
        log.insert(Touch::pending(&enrollment, &make_step(1), now, None, now));

        assert_eq!(log.cancel_open(&enrollment.id, now), 1);
        let touches = log.list_for_enrollment(&enrollment.id);
        assert_eq!(touches[0].status, TouchStatus::Skipped);
        assert_eq!(touches[0].skip_reason, Some(SkipReason::EnrollmentEnded));
        // Nothing left in flight.
        assert_eq!(log.cancel_open(&enrollment.id, now), 0);
    }
}
