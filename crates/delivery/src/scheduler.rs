//! Touch scheduler — finds due enrollments, resolves the concrete step to
//! execute, and emits at most one touch-execution request per enrollment
//! per pass. Concurrent workers coordinate through the claim lease on the
//! enrollment row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use drip_campaigns::{Campaign, CampaignStatus, CampaignStore, CounterKind, Step, StepContent};
use drip_core::config::SchedulerConfig;
use drip_core::error::{DripError, DripResult};
use drip_core::event_bus::{make_event, EventSink};
use drip_core::types::{Channel, EventType};
use drip_enrollment::{Enrollment, EnrollmentStatus, EnrollmentStore};
use drip_ledger::CreditLedger;
use drip_optout::OptOutRegistry;

use crate::send_window;
use crate::touch::{SkipReason, Touch, TouchLog, TouchStatus};

/// A claimed unit of work handed to the executor. The scheduler keeps the
/// enrollment's claim lease held until the executor finishes with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TouchRequest {
    pub touch_id: Uuid,
    pub enrollment_id: Uuid,
    pub campaign_id: Uuid,
    pub step_number: u32,
    pub channel: Channel,
    pub scheduled_at: DateTime<Utc>,
}

/// Concrete send instant for a step: base time plus delay, pushed past
/// quiet hours and skipped weekends.
fn step_send_time(campaign: &Campaign, enrollment: &Enrollment, step: &Step) -> DateTime<Utc> {
    let base = if step.delay_from_enrollment {
        enrollment.enrolled_at
    } else {
        enrollment.last_touch_at.unwrap_or(enrollment.enrolled_at)
    };
    let candidate = base + Duration::days(i64::from(step.delay_days));
    send_window::next_allowed(
        candidate,
        campaign.quiet_hours.as_ref(),
        campaign.weekend_skip,
        enrollment.utc_offset_minutes,
    )
}

/// Terminal status for an enrollment that ran out of steps.
fn completion_status(enrollment: &Enrollment, via_opt_out: bool) -> EnrollmentStatus {
    if enrollment.converted_at.is_some() {
        EnrollmentStatus::Converted
    } else if enrollment.responded_at.is_some() {
        EnrollmentStatus::Responded
    } else if via_opt_out {
        EnrollmentStatus::OptedOut
    } else {
        EnrollmentStatus::Completed
    }
}

pub(crate) fn finish_enrollment(
    campaigns: &CampaignStore,
    enrollments: &EnrollmentStore,
    events: &dyn EventSink,
    enrollment: &Enrollment,
    via_opt_out: bool,
    now: DateTime<Utc>,
) -> DripResult<()> {
    let status = completion_status(enrollment, via_opt_out);
    enrollments.transition(&enrollment.id, status, now)?;

    let event_type = if status == EnrollmentStatus::OptedOut {
        campaigns.bump(&enrollment.campaign_id, CounterKind::OptedOut);
        EventType::EnrollmentOptedOut
    } else {
        EventType::EnrollmentCompleted
    };
    events.emit(make_event(
        event_type,
        Some(enrollment.campaign_id),
        Some(enrollment.id),
        None,
        Some(enrollment.contact_id.clone()),
        None,
    ));

    info!(enrollment_id = %enrollment.id, status = %status, "Enrollment finished");
    Ok(())
}

/// Recompute `next_touch_at` for the next remaining active step, or finish
/// the enrollment when none remain. Shared by the enroll command, the
/// executor's advance paths, and the scheduler.
pub fn schedule_next(
    campaigns: &CampaignStore,
    enrollments: &EnrollmentStore,
    events: &dyn EventSink,
    enrollment_id: &Uuid,
    now: DateTime<Utc>,
) -> DripResult<()> {
    let enrollment = enrollments
        .get(enrollment_id)
        .ok_or_else(|| DripError::NotFound(format!("enrollment {enrollment_id}")))?;
    if enrollment.status != EnrollmentStatus::Active {
        return Ok(());
    }
    let campaign = campaigns
        .get(&enrollment.campaign_id)
        .ok_or_else(|| DripError::NotFound(format!("campaign {}", enrollment.campaign_id)))?;

    match campaign.next_active_step(enrollment.current_step) {
        Some(step) => {
            let at = step_send_time(&campaign, &enrollment, step);
            enrollments.update(enrollment_id, |e| {
                e.next_touch_at = Some(at);
                Ok(())
            })
        }
        None => finish_enrollment(campaigns, enrollments, events, &enrollment, false, now),
    }
}

/// The scheduler. One instance per worker; all coordination happens in the
/// shared stores.
pub struct TouchScheduler {
    campaigns: Arc<CampaignStore>,
    enrollments: Arc<EnrollmentStore>,
    touches: Arc<TouchLog>,
    optout: Arc<OptOutRegistry>,
    ledger: Arc<CreditLedger>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl TouchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<CampaignStore>,
        enrollments: Arc<EnrollmentStore>,
        touches: Arc<TouchLog>,
        optout: Arc<OptOutRegistry>,
        ledger: Arc<CreditLedger>,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            campaigns,
            enrollments,
            touches,
            optout,
            ledger,
            events,
            config,
        }
    }

    /// One scheduler pass. Returns the touch-execution requests this worker
    /// claimed; each carries a held lease the executor releases when done.
    pub fn run_pass(&self, now: DateTime<Utc>) -> Vec<TouchRequest> {
        let due = self.enrollments.due(now, self.config.batch_size);
        if !due.is_empty() {
            debug!(candidates = due.len(), "Scheduler pass");
        }
        metrics::counter!("scheduler.passes").increment(1);

        let mut requests = Vec::new();
        for candidate in due {
            if !self.enrollments.try_claim(&candidate.id, now, self.config.lease_secs) {
                // Another worker won the claim; not an error.
                continue;
            }
            match self.plan(&candidate.id, now) {
                Ok(Some(request)) => requests.push(request),
                Ok(None) => self.enrollments.release_claim(&candidate.id),
                Err(error) => {
                    warn!(enrollment_id = %candidate.id, %error, "Scheduling failed; will retry");
                    self.enrollments.release_claim(&candidate.id);
                }
            }
        }
        requests
    }

    /// Expire enrollments that have not produced a touch within the
    /// staleness window. Catches orphans left behind by deleted campaigns
    /// or corrupted step lists.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for enrollment in self.enrollments.stale(now, self.config.staleness_days) {
            match self
                .enrollments
                .transition(&enrollment.id, EnrollmentStatus::Expired, now)
            {
                Ok(_) => {
                    expired += 1;
                    self.events.emit(make_event(
                        EventType::EnrollmentExpired,
                        Some(enrollment.campaign_id),
                        Some(enrollment.id),
                        None,
                        Some(enrollment.contact_id.clone()),
                        None,
                    ));
                }
                Err(error) => {
                    warn!(enrollment_id = %enrollment.id, %error, "Stale enrollment not expirable");
                }
            }
        }
        if expired > 0 {
            info!(expired, "Stale enrollments expired");
            metrics::counter!("scheduler.expired").increment(expired as u64);
        }
        expired
    }

    // ------------------------------------------------------------------
    // Per-enrollment planning
    // ------------------------------------------------------------------

    /// Decide the concrete next action for one claimed enrollment. Returns
    /// the request to execute, or `None` when nothing should fire this pass
    /// (deferred, skipped to completion, in flight, or out of credits).
    fn plan(&self, id: &Uuid, now: DateTime<Utc>) -> DripResult<Option<TouchRequest>> {
        let first = match self.enrollments.get(id) {
            Some(e) => e,
            None => return Ok(None),
        };
        let campaign = match self.campaigns.get(&first.campaign_id) {
            Some(c) => c,
            None => {
                warn!(enrollment_id = %id, campaign_id = %first.campaign_id, "Enrollment references missing campaign");
                return Ok(None);
            }
        };
        if campaign.status != CampaignStatus::Active {
            // Paused/draft campaigns hold their enrollments; nothing fires.
            return Ok(None);
        }

        let mut via_opt_out = false;
        loop {
            let enrollment = match self.enrollments.get(id) {
                Some(e) if e.status == EnrollmentStatus::Active => e,
                _ => return Ok(None),
            };

            let step = match campaign.next_active_step(enrollment.current_step) {
                Some(step) => step.clone(),
                None => {
                    finish_enrollment(
                        &self.campaigns,
                        &self.enrollments,
                        self.events.as_ref(),
                        &enrollment,
                        via_opt_out,
                        now,
                    )?;
                    return Ok(None);
                }
            };

            // Align past missing or inactive steps.
            if step.step_number != enrollment.current_step {
                self.enrollments.update(id, |e| {
                    e.current_step = step.step_number;
                    Ok(())
                })?;
            }

            // Skip predicates, evaluated against enrollment state at
            // execution time.
            if step.skip_if_responded && enrollment.responded_at.is_some() {
                self.skip_step(&enrollment, &step, SkipReason::AlreadyResponded, now)?;
                continue;
            }
            if step.skip_if_converted && enrollment.converted_at.is_some() {
                self.skip_step(&enrollment, &step, SkipReason::AlreadyConverted, now)?;
                continue;
            }

            // Consent gate.
            if self.optout.is_opted_out(&enrollment.contact_id, step.channel) {
                via_opt_out = true;
                self.skip_step(&enrollment, &step, SkipReason::OptedOut, now)?;
                continue;
            }

            // Timing: the step's own send time, and — when that is already
            // behind us — the present instant re-checked against the window.
            let earliest = step_send_time(&campaign, &enrollment, &step);
            let effective = if earliest <= now {
                send_window::next_allowed(
                    now,
                    campaign.quiet_hours.as_ref(),
                    campaign.weekend_skip,
                    enrollment.utc_offset_minutes,
                )
            } else {
                earliest
            };
            if effective > now {
                self.enrollments.update(id, |e| {
                    e.next_touch_at = Some(effective);
                    Ok(())
                })?;
                debug!(enrollment_id = %id, %effective, "Touch deferred to send window");
                return Ok(None);
            }

            // At-most-one-in-flight: reuse an existing pending touch for
            // this step (retry), and never emit alongside another open one.
            let touch = match self.touches.open_for_enrollment(id) {
                Some(open) if open.step_number == step.step_number => {
                    if open.status == TouchStatus::Sending {
                        // A worker marked this in flight and then lost its
                        // lease — the claim this pass holds proves it.
                        // Re-queue the attempt.
                        warn!(touch_id = %open.id, "Requeueing touch from an expired lease");
                        self.touches.update(&open.id, |t| {
                            t.status = TouchStatus::Pending;
                            Ok(())
                        })?;
                    }
                    open
                }
                Some(open) => {
                    warn!(touch_id = %open.id, "Open touch for another step; skipping enrollment");
                    return Ok(None);
                }
                None => {
                    let touch = Touch::pending(&enrollment, &step, effective, None, now);
                    self.touches.insert(touch.clone());
                    self.events.emit(make_event(
                        EventType::TouchScheduled,
                        Some(campaign.id),
                        Some(enrollment.id),
                        Some(touch.id),
                        Some(enrollment.contact_id.clone()),
                        Some(step.channel),
                    ));
                    metrics::counter!("touch.scheduled").increment(1);
                    touch
                }
            };

            // Escrow the piece cost before a paid send. Insufficient balance
            // is not a failure: the touch stays pending and the reservation
            // is retried on the next pass.
            if let StepContent::DirectMail { cost_credits, .. } = &step.content {
                if touch.reservation_id.is_none() {
                    let note = format!("step {} for {}", step.step_number, enrollment.contact_id);
                    match self.ledger.reserve(*cost_credits, &note) {
                        Ok(reservation_id) => {
                            self.touches.update(&touch.id, |t| {
                                t.reservation_id = Some(reservation_id);
                                Ok(())
                            })?;
                            if enrollment.low_balance {
                                self.enrollments.update(id, |e| {
                                    e.low_balance = false;
                                    Ok(())
                                })?;
                            }
                            self.events.emit(make_event(
                                EventType::CreditsReserved,
                                Some(campaign.id),
                                Some(enrollment.id),
                                Some(touch.id),
                                None,
                                Some(Channel::DirectMail),
                            ));
                        }
                        Err(DripError::InsufficientBalance { requested, available }) => {
                            warn!(
                                enrollment_id = %id,
                                requested,
                                available,
                                "Insufficient credits; touch stays pending"
                            );
                            metrics::counter!("scheduler.low_balance").increment(1);
                            self.enrollments.update(id, |e| {
                                e.low_balance = true;
                                Ok(())
                            })?;
                            return Ok(None);
                        }
                        Err(other) => return Err(other),
                    }
                }
            }

            return Ok(Some(TouchRequest {
                touch_id: touch.id,
                enrollment_id: enrollment.id,
                campaign_id: campaign.id,
                step_number: step.step_number,
                channel: step.channel,
                scheduled_at: touch.scheduled_at,
            }));
        }
    }

    /// Record a skipped step and advance past it without waiting. A pending
    /// touch for the step (e.g. one parked on a credit retry) is converted
    /// in place rather than duplicated.
    fn skip_step(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        reason: SkipReason,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        let existing = self
            .touches
            .open_for_enrollment(&enrollment.id)
            .filter(|t| t.step_number == step.step_number);

        match existing {
            Some(open) => {
                if let Some(reservation_id) = open.reservation_id {
                    self.ledger.release(reservation_id, "step skipped")?;
                }
                self.touches.update(&open.id, |t| {
                    t.status = TouchStatus::Skipped;
                    t.skip_reason = Some(reason);
                    Ok(())
                })?;
            }
            None => {
                self.touches.insert(Touch::skipped(enrollment, step, reason, now));
            }
        }

        self.enrollments.update(&enrollment.id, |e| {
            e.current_step = step.step_number + 1;
            Ok(())
        })?;

        self.events.emit(make_event(
            EventType::TouchSkipped,
            Some(enrollment.campaign_id),
            Some(enrollment.id),
            None,
            Some(enrollment.contact_id.clone()),
            Some(step.channel),
        ));
        metrics::counter!("touch.skipped", "reason" => format!("{reason:?}")).increment(1);
        debug!(
            enrollment_id = %enrollment.id,
            step_number = step.step_number,
            ?reason,
            "Step skipped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_campaigns::{BouncePolicy, NewCampaign, NewStep, QuietHours};
    use drip_core::event_bus::capture_sink;
    use drip_optout::{OptOutReason, OptOutSource};

    struct Fixture {
        campaigns: Arc<CampaignStore>,
        enrollments: Arc<EnrollmentStore>,
        touches: Arc<TouchLog>,
        optout: Arc<OptOutRegistry>,
        ledger: Arc<CreditLedger>,
        scheduler: TouchScheduler,
    }

    fn fixture() -> Fixture {
        let campaigns = Arc::new(CampaignStore::new());
        let enrollments = Arc::new(EnrollmentStore::new());
        let touches = Arc::new(TouchLog::new());
        let optout = Arc::new(OptOutRegistry::new());
        let ledger = Arc::new(CreditLedger::new());
        let scheduler = TouchScheduler::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&optout),
            Arc::clone(&ledger),
            capture_sink(),
            SchedulerConfig::default(),
        );
        Fixture {
            campaigns,
            enrollments,
            touches,
            optout,
            ledger,
            scheduler,
        }
    }

    fn sms_step(delay_days: u32, skip_if_responded: bool) -> NewStep {
        NewStep {
            delay_days,
            delay_from_enrollment: true,
            content: StepContent::Sms { body: "hi {{first_name}}".into() },
            skip_if_responded,
            skip_if_converted: false,
        }
    }

    fn make_campaign(fx: &Fixture, steps: Vec<NewStep>) -> Campaign {
        let campaign = fx
            .campaigns
            .create(
                "agent-1",
                NewCampaign {
                    name: "Drip".into(),
                    description: String::new(),
                    lead_type: "seller".into(),
                    quiet_hours: None,
                    weekend_skip: false,
                    auto_pause_on_response: false,
                    auto_convert_on_response: false,
                    bounce_policy: BouncePolicy::ChannelOnly,
                },
            )
            .unwrap();
        for step in steps {
            fx.campaigns.add_step(&campaign.id, step).unwrap();
        }
        fx.campaigns
            .update(
                &campaign.id,
                drip_campaigns::CampaignPatch {
                    status: Some(CampaignStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    fn enroll(fx: &Fixture, campaign: &Campaign, contact: &str, now: DateTime<Utc>) -> Enrollment {
        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            contact_id: contact.to_string(),
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
        };
        fx.enrollments.insert(enrollment, false).unwrap()
    }

    fn wednesday() -> DateTime<Utc> {
        use chrono::TimeZone;
        // 2026-03-04 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap()
    }

    #[test]
    fn test_pass_emits_one_request_and_holds_claim() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);
        let enrollment = enroll(&fx, &campaign, "c-1", now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].enrollment_id, enrollment.id);
        assert_eq!(requests[0].step_number, 1);

        // The claim is still held for the executor, so a second concurrent
        // pass emits nothing for this enrollment.
        let second = fx.scheduler.run_pass(now);
        assert!(second.is_empty());
    }

    #[test]
    fn test_skip_if_responded_records_skip_and_finishes_as_responded() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, true)]);
        let enrollment = enroll(&fx, &campaign, "c-1", now);

        fx.enrollments
            .update(&enrollment.id, |e| {
                e.responded_at = Some(now);
                Ok(())
            })
            .unwrap();

        let requests = fx.scheduler.run_pass(now);
        assert!(requests.is_empty());

        let touches = fx.touches.list_for_enrollment(&enrollment.id);
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0].status, TouchStatus::Skipped);
        assert_eq!(touches[0].skip_reason, Some(SkipReason::AlreadyResponded));

        let finished = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(finished.status, EnrollmentStatus::Responded);
        assert!(finished.next_touch_at.is_none());
    }

    #[test]
    fn test_opted_out_channel_yields_skip_never_send() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);
        let enrollment = enroll(&fx, &campaign, "c-1", now);

        fx.optout.register(
            "c-1",
            Channel::Sms,
            OptOutReason::UserRequest,
            OptOutSource::default(),
        );

        let requests = fx.scheduler.run_pass(now);
        assert!(requests.is_empty());

        let touches = fx.touches.list_for_enrollment(&enrollment.id);
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0].skip_reason, Some(SkipReason::OptedOut));

        // Every remaining step was on a blocked channel.
        let finished = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(finished.status, EnrollmentStatus::OptedOut);
    }

    #[test]
    fn test_quiet_hours_defer_scheduling() {
        use chrono::TimeZone;
        let fx = fixture();
        let campaign = fx
            .campaigns
            .create(
                "agent-1",
                NewCampaign {
                    name: "Quiet".into(),
                    description: String::new(),
                    lead_type: String::new(),
                    quiet_hours: Some(QuietHours {
                        start: chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
                        end: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                    }),
                    weekend_skip: false,
                    auto_pause_on_response: false,
                    auto_convert_on_response: false,
                    bounce_policy: BouncePolicy::ChannelOnly,
                },
            )
            .unwrap();
        fx.campaigns.add_step(&campaign.id, sms_step(0, false)).unwrap();
        let campaign = fx
            .campaigns
            .update(
                &campaign.id,
                drip_campaigns::CampaignPatch {
                    status: Some(CampaignStatus::Active),
                    ..Default::default()
                },
            )
            .unwrap();

        // Wednesday 23:00 — inside the window.
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 23, 0, 0).unwrap();
        let enrollment = enroll(&fx, &campaign, "c-1", now);

        let requests = fx.scheduler.run_pass(now);
        assert!(requests.is_empty());

        // Deferred to 08:00 the next morning, and no touch recorded.
        let updated = fx.enrollments.get(&enrollment.id).unwrap();
        assert_eq!(
            updated.next_touch_at.unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 5, 8, 0, 0).unwrap()
        );
        assert_eq!(fx.touches.count(), 0);

        // At 08:00 the touch fires.
        let morning = Utc.with_ymd_and_hms(2026, 3, 5, 8, 0, 0).unwrap();
        let requests = fx.scheduler.run_pass(morning);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn test_insufficient_balance_leaves_touch_pending() {
        let fx = fixture();
        let now = wednesday();
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
        );
        let enrollment = enroll(&fx, &campaign, "c-1", now);

        // No credits purchased: reservation fails, touch parks as pending.
        let requests = fx.scheduler.run_pass(now);
        assert!(requests.is_empty());

        let touches = fx.touches.list_for_enrollment(&enrollment.id);
        assert_eq!(touches.len(), 1);
        assert_eq!(touches[0].status, TouchStatus::Pending);
        assert!(touches[0].reservation_id.is_none());
        assert!(fx.enrollments.get(&enrollment.id).unwrap().low_balance);
        assert_eq!(fx.ledger.snapshot().reserved, 0.0);

        // After a purchase the same pending touch dispatches.
        fx.ledger.purchase("starter-50").unwrap();
        let requests = fx.scheduler.run_pass(now);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].touch_id, touches[0].id);

        let reloaded = fx.touches.get(&touches[0].id).unwrap();
        assert!(reloaded.reservation_id.is_some());
        assert!(!fx.enrollments.get(&enrollment.id).unwrap().low_balance);
        assert!(fx.ledger.snapshot().reserved > 0.0);
    }

    #[test]
    fn test_due_enrollments_processed_in_order() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);

        let first = enroll(&fx, &campaign, "c-early", now - Duration::hours(2));
        let second = enroll(&fx, &campaign, "c-late", now - Duration::hours(1));
        let (first_id, second_id) = (first.id, second.id);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].enrollment_id, first_id);
        assert_eq!(requests[1].enrollment_id, second_id);
    }

    #[test]
    fn test_paused_campaign_holds_enrollments() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);
        enroll(&fx, &campaign, "c-1", now);

        fx.campaigns
            .update(
                &campaign.id,
                drip_campaigns::CampaignPatch {
                    status: Some(CampaignStatus::Paused),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(fx.scheduler.run_pass(now).is_empty());
        assert_eq!(fx.touches.count(), 0);
    }

    #[test]
    fn test_crashed_worker_touch_is_requeued_after_lease_expiry() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);
        enroll(&fx, &campaign, "c-1", now);

        let requests = fx.scheduler.run_pass(now);
        assert_eq!(requests.len(), 1);

        // Simulate a worker that marked the touch in flight and died: the
        // touch sits in `Sending` and the lease eventually runs out.
        fx.touches
            .update(&requests[0].touch_id, |t| {
                t.status = TouchStatus::Sending;
                Ok(())
            })
            .unwrap();
        let after_lease = now + Duration::seconds(SchedulerConfig::default().lease_secs + 1);

        let recovered = fx.scheduler.run_pass(after_lease);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].touch_id, requests[0].touch_id);
        assert_eq!(
            fx.touches.get(&requests[0].touch_id).unwrap().status,
            TouchStatus::Pending
        );
        assert_eq!(fx.touches.count(), 1);
    }

    #[test]
    fn test_expire_stale_enrollments() {
        let fx = fixture();
        let now = wednesday();
        let campaign = make_campaign(&fx, vec![sms_step(0, false)]);
        let enrollment = enroll(&fx, &campaign, "c-1", now - Duration::days(120));

        let expired = fx.scheduler.expire_stale(now);
        assert_eq!(expired, 1);
        assert_eq!(
            fx.enrollments.get(&enrollment.id).unwrap().status,
            EnrollmentStatus::Expired
        );
    }
}
