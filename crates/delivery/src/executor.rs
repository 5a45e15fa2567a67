//! Touch executor — performs one claimed send through the channel sender
//! and records the outcome. Keyed by (enrollment, step): re-invocation
//! after a crash or retry never produces a second external send.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};

use drip_campaigns::{BouncePolicy, CampaignStore, Step, StepContent};
use drip_core::config::ExecutorConfig;
use drip_core::error::{DripError, DripResult};
use drip_core::event_bus::{make_event, EventSink};
use drip_core::templates;
use drip_core::types::EventType;
use drip_enrollment::{Enrollment, EnrollmentStatus, EnrollmentStore};
use drip_ledger::CreditLedger;
use drip_optout::{OptOutReason, OptOutRegistry, OptOutSource};

use crate::scheduler::{schedule_next, TouchRequest};
use crate::senders::{OutboundMessage, SendError, SendReceipt, SenderRegistry};
use crate::touch::{SkipReason, Touch, TouchLog, TouchStatus};

/// What happened to one executed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchOutcome {
    Sent,
    Delivered,
    /// Transient failure; the touch stays pending and fires again after
    /// backoff.
    Retrying,
    /// Attempt cap reached; the touch failed but the enrollment advanced.
    Failed,
    Bounced,
    /// Nothing to do — already executed, or the enrollment left `Active`
    /// while the request was queued.
    Skipped,
}

pub struct TouchExecutor {
    campaigns: Arc<CampaignStore>,
    enrollments: Arc<EnrollmentStore>,
    touches: Arc<TouchLog>,
    ledger: Arc<CreditLedger>,
    optout: Arc<OptOutRegistry>,
    senders: Arc<SenderRegistry>,
    events: Arc<dyn EventSink>,
    config: ExecutorConfig,
}

impl TouchExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<CampaignStore>,
        enrollments: Arc<EnrollmentStore>,
        touches: Arc<TouchLog>,
        ledger: Arc<CreditLedger>,
        optout: Arc<OptOutRegistry>,
        senders: Arc<SenderRegistry>,
        events: Arc<dyn EventSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            campaigns,
            enrollments,
            touches,
            ledger,
            optout,
            senders,
            events,
            config,
        }
    }

    /// Execute one claimed request. The claim lease is released on every
    /// exit path — external sends are slow and must not pin the enrollment
    /// longer than necessary.
    pub fn execute(&self, request: &TouchRequest, now: DateTime<Utc>) -> DripResult<TouchOutcome> {
        let result = self.execute_inner(request, now);
        self.enrollments.release_claim(&request.enrollment_id);
        result
    }

    fn execute_inner(
        &self,
        request: &TouchRequest,
        now: DateTime<Utc>,
    ) -> DripResult<TouchOutcome> {
        let touch = self
            .touches
            .get(&request.touch_id)
            .ok_or_else(|| DripError::NotFound(format!("touch {}", request.touch_id)))?;

        // Idempotency gate: only a pending touch is ever dispatched. A
        // re-invoked key whose touch already moved to in-flight or terminal
        // is a no-op.
        if touch.status != TouchStatus::Pending {
            return Ok(TouchOutcome::Skipped);
        }

        let enrollment = self
            .enrollments
            .get(&request.enrollment_id)
            .ok_or_else(|| DripError::NotFound(format!("enrollment {}", request.enrollment_id)))?;

        if enrollment.status != EnrollmentStatus::Active {
            // Paused or terminated while the request was queued; cancel.
            self.touches.update(&touch.id, |t| {
                t.status = TouchStatus::Skipped;
                t.skip_reason = Some(SkipReason::EnrollmentEnded);
                Ok(())
            })?;
            if let Some(reservation_id) = touch.reservation_id {
                self.ledger.release(reservation_id, "enrollment inactive")?;
            }
            return Ok(TouchOutcome::Skipped);
        }

        let campaign = self
            .campaigns
            .get(&enrollment.campaign_id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {}", enrollment.campaign_id)))?;
        let step = campaign
            .step_at(request.step_number)
            .cloned()
            .ok_or_else(|| DripError::NotFound(format!("step {}", request.step_number)))?;

        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Sending;
            Ok(())
        })?;

        let message = build_message(&touch, &enrollment, &step);
        let sender = match self.senders.get(step.channel) {
            Some(sender) => sender,
            None => {
                // Configuration gap, not a recipient problem; treat as
                // transient so an operator can register the sender.
                return self.on_transient(
                    &touch,
                    &enrollment,
                    format!("no sender registered for channel {}", step.channel),
                    now,
                );
            }
        };

        match sender.send(&message) {
            Ok(receipt) => self.on_success(&touch, &enrollment, &step, receipt, now),
            Err(SendError::Transient(reason)) => {
                self.on_transient(&touch, &enrollment, reason, now)
            }
            Err(SendError::Permanent(reason)) => {
                self.on_permanent(&touch, &enrollment, &step, campaign.bounce_policy, reason, now)
            }
        }
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    fn on_success(
        &self,
        touch: &Touch,
        enrollment: &Enrollment,
        step: &Step,
        receipt: SendReceipt,
        now: DateTime<Utc>,
    ) -> DripResult<TouchOutcome> {
        let delivered = receipt.delivered;
        let status = if delivered { TouchStatus::Delivered } else { TouchStatus::Sent };

        self.touches.update(&touch.id, |t| {
            t.status = status;
            t.sent_at = Some(now);
            if delivered {
                t.delivered_at = Some(now);
            }
            t.provider_message_id = Some(receipt.provider_message_id.clone());
            t.error = None;
            if let Some(dm) = t.direct_mail.as_mut() {
                dm.tracking_number = receipt.tracking_number.clone();
            }
            Ok(())
        })?;
        self.touches.link_provider(&receipt.provider_message_id, touch.id);

        if let Some(reservation_id) = touch.reservation_id {
            self.ledger.commit(reservation_id, "direct mail dispatched")?;
            self.events.emit(make_event(
                EventType::CreditsCommitted,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                Some(touch.id),
                None,
                Some(step.channel),
            ));
        }

        self.enrollments.update(&enrollment.id, |e| {
            e.touches_sent += 1;
            if delivered {
                e.touches_delivered += 1;
            }
            e.last_touch_at = Some(now);
            e.last_touch_channel = Some(step.channel);
            e.current_step = step.step_number + 1;
            Ok(())
        })?;
        schedule_next(
            &self.campaigns,
            &self.enrollments,
            self.events.as_ref(),
            &enrollment.id,
            now,
        )?;

        let event_type = if delivered { EventType::TouchDelivered } else { EventType::TouchSent };
        self.events.emit(make_event(
            event_type,
            Some(enrollment.campaign_id),
            Some(enrollment.id),
            Some(touch.id),
            Some(enrollment.contact_id.clone()),
            Some(step.channel),
        ));
        metrics::counter!("touch.sent", "channel" => step.channel.display_name()).increment(1);
        info!(
            touch_id = %touch.id,
            enrollment_id = %enrollment.id,
            step_number = step.step_number,
            channel = %step.channel,
            "Touch dispatched"
        );

        Ok(if delivered { TouchOutcome::Delivered } else { TouchOutcome::Sent })
    }

    fn on_transient(
        &self,
        touch: &Touch,
        enrollment: &Enrollment,
        reason: String,
        now: DateTime<Utc>,
    ) -> DripResult<TouchOutcome> {
        let attempts = touch.retry_count + 1;

        if attempts >= self.config.max_attempts {
            // Attempt cap reached: the touch fails, the sequence survives.
            self.touches.update(&touch.id, |t| {
                t.status = TouchStatus::Failed;
                t.failed_at = Some(now);
                t.retry_count = attempts;
                t.last_retry_at = Some(now);
                t.error = Some(reason.clone());
                Ok(())
            })?;
            if let Some(reservation_id) = touch.reservation_id {
                self.ledger.release(reservation_id, "send failed")?;
                self.events.emit(make_event(
                    EventType::CreditsReleased,
                    Some(enrollment.campaign_id),
                    Some(enrollment.id),
                    Some(touch.id),
                    None,
                    Some(touch.channel),
                ));
            }
            self.enrollments.update(&enrollment.id, |e| {
                e.touches_failed += 1;
                e.current_step = touch.step_number + 1;
                Ok(())
            })?;
            schedule_next(
                &self.campaigns,
                &self.enrollments,
                self.events.as_ref(),
                &enrollment.id,
                now,
            )?;

            self.events.emit(make_event(
                EventType::TouchFailed,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                Some(touch.id),
                Some(enrollment.contact_id.clone()),
                Some(touch.channel),
            ));
            metrics::counter!("touch.failed").increment(1);
            warn!(touch_id = %touch.id, attempts, %reason, "Touch failed after retries");
            return Ok(TouchOutcome::Failed);
        }

        let delay = self.backoff(attempts);
        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Pending;
            t.retry_count = attempts;
            t.last_retry_at = Some(now);
            t.error = Some(reason.clone());
            Ok(())
        })?;
        self.enrollments.update(&enrollment.id, |e| {
            e.next_touch_at = Some(now + delay);
            Ok(())
        })?;

        metrics::counter!("touch.retried").increment(1);
        warn!(
            touch_id = %touch.id,
            attempt = attempts,
            retry_in_secs = delay.num_seconds(),
            %reason,
            "Transient send failure; backing off"
        );
        Ok(TouchOutcome::Retrying)
    }

    fn on_permanent(
        &self,
        touch: &Touch,
        enrollment: &Enrollment,
        step: &Step,
        policy: BouncePolicy,
        reason: String,
        now: DateTime<Utc>,
    ) -> DripResult<TouchOutcome> {
        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Bounced;
            t.failed_at = Some(now);
            t.error = Some(reason.clone());
            Ok(())
        })?;
        if let Some(reservation_id) = touch.reservation_id {
            self.ledger.release(reservation_id, "hard bounce")?;
        }

        // The channel is undeliverable for this contact everywhere, not
        // just in this campaign.
        self.optout.register(
            &enrollment.contact_id,
            step.channel,
            OptOutReason::Bounced,
            OptOutSource {
                campaign_id: Some(enrollment.campaign_id),
                touch_id: Some(touch.id),
            },
        );

        self.events.emit(make_event(
            EventType::TouchBounced,
            Some(enrollment.campaign_id),
            Some(enrollment.id),
            Some(touch.id),
            Some(enrollment.contact_id.clone()),
            Some(step.channel),
        ));
        metrics::counter!("touch.bounced", "channel" => step.channel.display_name()).increment(1);
        warn!(touch_id = %touch.id, channel = %step.channel, %reason, "Hard bounce");

        match policy {
            BouncePolicy::EntireEnrollment => {
                self.enrollments
                    .transition(&enrollment.id, EnrollmentStatus::Bounced, now)?;
                self.events.emit(make_event(
                    EventType::EnrollmentBounced,
                    Some(enrollment.campaign_id),
                    Some(enrollment.id),
                    None,
                    Some(enrollment.contact_id.clone()),
                    None,
                ));
            }
            BouncePolicy::ChannelOnly => {
                self.enrollments.update(&enrollment.id, |e| {
                    e.touches_failed += 1;
                    e.current_step = step.step_number + 1;
                    Ok(())
                })?;
                // Later steps on the bounced channel skip via the opt-out
                // the registration above created.
                schedule_next(
                    &self.campaigns,
                    &self.enrollments,
                    self.events.as_ref(),
                    &enrollment.id,
                    now,
                )?;
            }
        }

        Ok(TouchOutcome::Bounced)
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(16);
        let exp = self
            .config
            .backoff_base_secs
            .saturating_mul(1i64 << shift)
            .min(self.config.backoff_max_secs);
        let jitter = rand::thread_rng().gen_range(0..=self.config.backoff_base_secs.max(1) / 2);
        Duration::seconds(exp + jitter)
    }
}

fn build_message(touch: &Touch, enrollment: &Enrollment, step: &Step) -> OutboundMessage {
    let (subject, body) = match &step.content {
        StepContent::Sms { body } => (None, templates::render(body, &enrollment.context)),
        StepContent::Email { subject, body } => (
            Some(templates::render(subject, &enrollment.context)),
            templates::render(body, &enrollment.context),
        ),
        StepContent::DirectMail { piece_type, .. } => (None, piece_type.clone()),
        StepContent::SocialDm { body, .. } => (None, templates::render(body, &enrollment.context)),
        StepContent::PhoneReminder { note } => (None, templates::render(note, &enrollment.context)),
    };
    OutboundMessage {
        touch_id: touch.id,
        enrollment_id: enrollment.id,
        contact_id: enrollment.contact_id.clone(),
        channel: step.channel,
        subject,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TouchScheduler;
    use crate::senders::{ChannelSender, HardBouncingSender, SendReceipt, SimulatedSender};
    use drip_campaigns::{Campaign, CampaignPatch, CampaignStatus, NewCampaign, NewStep};
    use drip_core::config::SchedulerConfig;
    use drip_core::event_bus::capture_sink;
    use drip_core::types::Channel;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    /// Sender that fails transiently a fixed number of times, then succeeds.
    struct FlakySender {
        channel: Channel,
        failures_left: AtomicU32,
    }

    impl FlakySender {
        fn new(channel: Channel, failures: u32) -> Self {
            Self {
                channel,
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    impl ChannelSender for FlakySender {
        fn channel(&self) -> Channel {
            self.channel
        }

        fn send(&self, _message: &OutboundMessage) -> Result<SendReceipt, SendError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SendError::Transient("rate limited".into()));
            }
            Ok(SendReceipt {
                provider_message_id: format!("FL{}", Uuid::new_v4()),
                delivered: false,
                tracking_number: None,
            })
        }
    }

    struct Fixture {
        campaigns: Arc<CampaignStore>,
        enrollments: Arc<EnrollmentStore>,
        touches: Arc<TouchLog>,
        optout: Arc<OptOutRegistry>,
        ledger: Arc<CreditLedger>,
        senders: Arc<SenderRegistry>,
        scheduler: TouchScheduler,
        executor: TouchExecutor,
    }

    fn fixture() -> Fixture {
        let campaigns = Arc::new(CampaignStore::new());
        let enrollments = Arc::new(EnrollmentStore::new());
        let touches = Arc::new(TouchLog::new());
        let optout = Arc::new(OptOutRegistry::new());
        let ledger = Arc::new(CreditLedger::new());
        let senders = Arc::new(SenderRegistry::new());
        let events = capture_sink();
        let scheduler = TouchScheduler::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&optout),
            Arc::clone(&ledger),
            events.clone(),
            SchedulerConfig::default(),
        );
        let executor = TouchExecutor::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&ledger),
            Arc::clone(&optout),
            Arc::clone(&senders),
            events,
            ExecutorConfig::default(),
        );
        Fixture {
            campaigns,
            enrollments,
            touches,
            optout,
            ledger,
            senders,
            scheduler,
            executor,
        }
    }

    fn make_campaign(fx: &Fixture, steps: Vec<NewStep>, policy: BouncePolicy) -> Campaign {
        let campaign = fx
            .campaigns
            .create(
                "agent-1",
                NewCampaign {
                    name: "Drip".into(),
                    description: String::new(),
                    lead_type: String::new(),
                    quiet_hours: None,
                    weekend_skip: false,
                    auto_pause_on_response: false,
                    auto_convert_on_response: false,
                    bounce_policy: policy,
                },
            )
            .unwrap();
        for step in steps {
            fx.campaigns.add_step(&campaign.id, step).unwrap();
        }
        fx.campaigns
            .update(
                &campaign.id,
                CampaignPatch {
                    status: Some(CampaignStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    fn sms_step(delay_days: u32) -> NewStep {
        NewStep {
            delay_days,
            delay_from_enrollment: true,
            content: StepContent::Sms { body: "hi {{first_name}}".into() },
            skip_if_responded: false,
            skip_if_converted: false,
        }
    }

    fn enroll(fx: &Fixture, campaign: &Campaign, now: DateTime<Utc>) -> Enrollment {
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
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
            context: serde_json::json!({"first_name": "Ada"}),
            utc_offset_minutes: 0,
            low_balance: false,
            claimed_until: None,
            enrolled_at: now,
            updated_at: now,
        };
        fx.enrollments.insert(enrollment, false).unwrap()
    }

    fn wednesday() -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_success_advances_and_completes() {
        let fx = fixture();
        fx.senders.register(Arc::new(SimulatedSender::sms()));
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0)], BouncePolicy::ChannelOnly);
        let enrollment = enroll(&fx, &campaign, now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(requests.len(), 1);

        let outcome = fx.executor.execute(&requests[0], now).unwrap();
        assert_eq!(outcome, TouchOutcome::Sent);

        let touch = fx.touches.get(&requests[0].touch_id).unwrap();
        assert_eq!(touch.status, TouchStatus::Sent);
        assert!(touch.provider_message_id.is_some());

        // Single step: the enrollment completed and the claim was released.
        let updated = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(updated.status, EnrollmentStatus::Completed);
        assert_eq!(updated.touches_sent, 1);
        assert!(updated.next_touch_at.is_none());
        assert!(updated.claimed_until.is_none());
    }

    #[test]
    fn test_executor_is_idempotent_per_key() {
        let fx = fixture();
        fx.senders.register(Arc::new(SimulatedSender::sms()));
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0), sms_step(3)], BouncePolicy::ChannelOnly);
        enroll(&fx, &campaign, now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Sent);

        // Re-invocation with the same key (crash/retry replay) is a no-op.
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Skipped);
        let touches = fx.touches.list_for_enrollment(&requests[0].enrollment_id);
        assert_eq!(touches.len(), 1);
    }

    #[test]
    fn test_transient_failures_back_off_then_fail_without_killing_sequence() {
        let fx = fixture();
        // More failures than the attempt cap.
        fx.senders.register(Arc::new(FlakySender::new(Channel::Sms, 10)));
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0), sms_step(3)], BouncePolicy::ChannelOnly);
        let enrollment = enroll(&fx, &campaign, now);

        // Attempt 1: transient, backs off.
        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Retrying);
        let touch = fx.touches.get(&requests[0].touch_id).unwrap();
        assert_eq!(touch.status, TouchStatus::Pending);
        assert_eq!(touch.retry_count, 1);

        let after_backoff = fx.enrollments.get(&enrollment.id).unwrap().next_touch_at.unwrap();
        assert!(after_backoff > now);

        // Attempt 2 reuses the same touch record.
        let retry = fx.scheduler.run_pass(after_backoff);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].touch_id, requests[0].touch_id);
        assert_eq!(
            fx.executor.execute(&retry[0], after_backoff).unwrap(),
            TouchOutcome::Retrying
        );

        // Attempt 3 hits the cap: failed, but the enrollment stays active
        // and advances to step 2.
        let next_at = fx.enrollments.get(&enrollment.id).unwrap().next_touch_at.unwrap();
        let last = fx.scheduler.run_pass(next_at);
        assert_eq!(
            fx.executor.execute(&last[0], next_at).unwrap(),
            TouchOutcome::Failed
        );

        let touch = fx.touches.get(&requests[0].touch_id).unwrap();
        assert_eq!(touch.status, TouchStatus::Failed);
        assert_eq!(touch.retry_count, 3);

        let updated = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(updated.status, EnrollmentStatus::Active);
        assert_eq!(updated.touches_failed, 1);
        assert_eq!(updated.current_step, 2);
        assert!(updated.next_touch_at.is_some());
    }

    #[test]
    fn test_hard_bounce_entire_enrollment_policy() {
        let fx = fixture();
        fx.senders.register(Arc::new(HardBouncingSender::new(Channel::Sms)));
        let now = wednesday();
        let campaign =
            make_campaign(&fx, vec![sms_step(0), sms_step(3)], BouncePolicy::EntireEnrollment);
        let enrollment = enroll(&fx, &campaign, now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Bounced);

        let updated = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(updated.status, EnrollmentStatus::Bounced);
        assert!(updated.next_touch_at.is_none());
        // The channel became globally undeliverable for the contact.
        assert!(fx.optout.is_opted_out("c-1", Channel::Sms));
    }

    #[test]
    fn test_hard_bounce_channel_only_policy_continues_on_other_channels() {
        let fx = fixture();
        fx.senders.register(Arc::new(HardBouncingSender::new(Channel::Sms)));
        fx.senders.register(Arc::new(SimulatedSender::email()));
        let now = wednesday();
        let campaign = make_campaign(
            &fx,
            vec![
                sms_step(0),
                NewStep {
                    delay_days: 0,
                    delay_from_enrollment: true,
                    content: StepContent::Email {
                        subject: "hello".into(),
                        body: "again".into(),
                    },
                    skip_if_responded: false,
                    skip_if_converted: false,
                },
                sms_step(5),
            ],
            BouncePolicy::ChannelOnly,
        );
        let enrollment = enroll(&fx, &campaign, now);

        // Step 1 bounces; enrollment continues.
        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Bounced);
        let updated = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(updated.status, EnrollmentStatus::Active);
        assert_eq!(updated.current_step, 2);

        // Step 2 (email) sends fine.
        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Sent);

        // Step 3 is SMS again: skipped through the bounce-created opt-out.
        // No further step has an allowed channel, so the enrollment ends in
        // opted_out.
        let later = now + Duration::days(5);
        let requests = fx.scheduler.run_pass(later);
        assert!(requests.is_empty());
        let finished = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(finished.status, EnrollmentStatus::OptedOut);

        let touches = fx.touches.list_for_enrollment(&enrollment.id);
        assert_eq!(touches.len(), 3);
        assert_eq!(touches[2].status, TouchStatus::Skipped);
        assert_eq!(touches[2].skip_reason, Some(SkipReason::OptedOut));
    }

    #[test]
    fn test_pause_mid_flight_cancels_queued_request() {
        let fx = fixture();
        fx.senders.register(Arc::new(SimulatedSender::sms()));
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0)], BouncePolicy::ChannelOnly);
        let enrollment = enroll(&fx, &campaign, now);

        let requests = fx.scheduler.run_pass(now);
        fx.enrollments.pause(&enrollment.id, Some("agent hold".into()), now).unwrap();

        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Skipped);
        let touch = fx.touches.get(&requests[0].touch_id).unwrap();
        assert_eq!(touch.status, TouchStatus::Skipped);
        assert_eq!(touch.skip_reason, Some(SkipReason::EnrollmentEnded));
        assert_eq!(
            fx.enrollments.get(&enrollment.id).unwrap().touches_sent,
            0
        );
    }

    #[test]
    fn test_direct_mail_success_commits_reservation() {
        let fx = fixture();
        fx.senders.register(Arc::new(SimulatedSender::direct_mail()));
        let now = wednesday();
        fx.ledger.purchase("starter-50").unwrap();
        let campaign = make_campaign(
            &fx,
            vec![NewStep {
                delay_days: 0,
                delay_from_enrollment: true,
                content: StepContent::DirectMail {
                    piece_type: "postcard".into(),
                    cost_credits: 1.49,
                },
                skip_if_responded: false,
                skip_if_converted: false,
            }],
            BouncePolicy::ChannelOnly,
        );
        enroll(&fx, &campaign, now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(fx.executor.execute(&requests[0], now).unwrap(), TouchOutcome::Sent);

        let snap = fx.ledger.snapshot();
        assert!((snap.lifetime_used - 1.49).abs() < 1e-9);
        assert!(snap.reserved.abs() < 1e-9);
        assert!((fx.ledger.audit() - snap.balance).abs() < 1e-9);

        let touch = fx.touches.get(&requests[0].touch_id).unwrap();
        assert!(touch.direct_mail.unwrap().tracking_number.is_some());
    }
}
