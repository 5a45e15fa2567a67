use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use drip_campaigns::{
    Campaign, CampaignPatch, CampaignStatus, CampaignStore, CounterKind, NewCampaign, NewStep,
    Step, StepPatch,
};
use drip_core::config::AppConfig;
use drip_core::error::{DripError, DripResult};
use drip_core::event_bus::{make_event, noop_sink, EventSink};
use drip_core::templates;
use drip_core::types::{ActingUser, EventType};
use drip_delivery::{
    schedule_next, SenderRegistry, Touch, TouchExecutor, TouchLog, TouchOutcome, TouchScheduler,
};
use drip_enrollment::{Enrollment, EnrollmentStatus, EnrollmentStore, NewEnrollment};
use drip_ingest::EventIngestor;
use drip_ledger::{CreditBalance, CreditLedger, CreditPackage, LedgerTransaction};
use drip_optout::{OptOutRecord, OptOutRegistry};

/// Result of an enroll-contacts command: what went in, and what was
/// rejected with which typed failure.
#[derive(Debug)]
pub struct EnrollOutcome {
    pub enrolled: Vec<Enrollment>,
    pub rejected: Vec<(String, DripError)>,
}

/// Enrollment read model: the row plus its touch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentDetail {
    pub enrollment: Enrollment,
    pub touches: Vec<Touch>,
}

/// Counts from one scheduler-plus-executor tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub dispatched: usize,
    pub sent: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub bounced: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// The engine. One instance per process; all state lives in the shared
/// stores, so multiple processes pointing at the same stores coordinate
/// through claim leases alone.
pub struct DripEngine {
    campaigns: Arc<CampaignStore>,
    enrollments: Arc<EnrollmentStore>,
    touches: Arc<TouchLog>,
    optout: Arc<OptOutRegistry>,
    ledger: Arc<CreditLedger>,
    senders: Arc<SenderRegistry>,
    events: Arc<dyn EventSink>,
    scheduler: TouchScheduler,
    executor: TouchExecutor,
    ingestor: EventIngestor,
    config: AppConfig,
}

impl DripEngine {
    pub fn new(config: AppConfig) -> Self {
        Self::with_event_sink(config, noop_sink())
    }

    pub fn with_event_sink(config: AppConfig, events: Arc<dyn EventSink>) -> Self {
        let campaigns = Arc::new(CampaignStore::new());
        let enrollments = Arc::new(EnrollmentStore::new());
        let touches = Arc::new(TouchLog::new());
        let optout = Arc::new(OptOutRegistry::new());
        let ledger = Arc::new(CreditLedger::new());
        let senders = Arc::new(SenderRegistry::new());

        let scheduler = TouchScheduler::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&optout),
            Arc::clone(&ledger),
            Arc::clone(&events),
            config.scheduler.clone(),
        );
        let executor = TouchExecutor::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&ledger),
            Arc::clone(&optout),
            Arc::clone(&senders),
            Arc::clone(&events),
            config.executor.clone(),
        );
        let ingestor = EventIngestor::new(
            Arc::clone(&campaigns),
            Arc::clone(&enrollments),
            Arc::clone(&touches),
            Arc::clone(&optout),
            Arc::clone(&ledger),
            Arc::clone(&events),
            config.ingest.clone(),
        );

        info!(node_id = %config.node_id, "Drip engine initialized");
        Self {
            campaigns,
            enrollments,
            touches,
            optout,
            ledger,
            senders,
            events,
            scheduler,
            executor,
            ingestor,
            config,
        }
    }

    /// Channel sender registry; real or simulated providers register here.
    pub fn senders(&self) -> &SenderRegistry {
        &self.senders
    }

    /// Webhook/ingest surface for delivery callbacks and inbound replies.
    pub fn ingest(&self) -> &EventIngestor {
        &self.ingestor
    }

    // ------------------------------------------------------------------
    // Campaign commands
    // ------------------------------------------------------------------

    pub fn create_campaign(&self, actor: &ActingUser, def: NewCampaign) -> DripResult<Campaign> {
        self.campaigns.create(&actor.user_id, def)
    }

    pub fn update_campaign(
        &self,
        actor: &ActingUser,
        id: &Uuid,
        patch: CampaignPatch,
    ) -> DripResult<Campaign> {
        self.authorize_campaign(actor, id)?;
        self.campaigns.update(id, patch)
    }

    /// Delete a campaign definition. Refused while live enrollments exist —
    /// remove or finish them first.
    pub fn delete_campaign(&self, actor: &ActingUser, id: &Uuid) -> DripResult<Campaign> {
        self.authorize_campaign(actor, id)?;
        let live = self
            .enrollments
            .list_by_campaign(id)
            .into_iter()
            .filter(|e| !e.status.is_terminal())
            .count();
        if live > 0 {
            return Err(DripError::Validation(format!(
                "campaign has {live} live enrollments"
            )));
        }
        self.campaigns.delete(id)
    }

    pub fn create_step(
        &self,
        actor: &ActingUser,
        campaign_id: &Uuid,
        def: NewStep,
    ) -> DripResult<Step> {
        self.authorize_campaign(actor, campaign_id)?;
        self.campaigns.add_step(campaign_id, def)
    }

    pub fn update_step(
        &self,
        actor: &ActingUser,
        campaign_id: &Uuid,
        step_id: &Uuid,
        patch: StepPatch,
    ) -> DripResult<Step> {
        self.authorize_campaign(actor, campaign_id)?;
        self.campaigns.update_step(campaign_id, step_id, patch)
    }

    pub fn delete_step(
        &self,
        actor: &ActingUser,
        campaign_id: &Uuid,
        step_id: &Uuid,
    ) -> DripResult<()> {
        self.authorize_campaign(actor, campaign_id)?;
        self.campaigns.delete_step(campaign_id, step_id)
    }

    // ------------------------------------------------------------------
    // Enrollment commands
    // ------------------------------------------------------------------

    /// Enroll a batch of contacts. Rejections (duplicates, mostly) are
    /// returned per contact; they never abort the rest of the batch.
    pub fn enroll_contacts(
        &self,
        actor: &ActingUser,
        campaign_id: &Uuid,
        contacts: Vec<NewEnrollment>,
        shared_context: serde_json::Value,
        allow_re_enrollment: bool,
        now: DateTime<Utc>,
    ) -> DripResult<EnrollOutcome> {
        let campaign = self.authorize_campaign(actor, campaign_id)?;
        if campaign.status != CampaignStatus::Active {
            return Err(DripError::Validation("campaign is not active".into()));
        }
        if !campaign.has_active_step() {
            return Err(DripError::Validation("campaign has no active steps".into()));
        }

        let mut outcome = EnrollOutcome {
            enrolled: Vec::new(),
            rejected: Vec::new(),
        };

        for contact in contacts {
            let context = match &contact.context {
                Some(extra) => templates::merge_context(&shared_context, extra),
                None => shared_context.clone(),
            };
            let enrollment = Enrollment {
                id: Uuid::new_v4(),
                campaign_id: *campaign_id,
                contact_id: contact.contact_id.clone(),
                deal_id: contact.deal_id,
                current_step: 1,
                next_touch_at: None,
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
                context,
                utc_offset_minutes: contact.utc_offset_minutes,
                low_balance: false,
                claimed_until: None,
                enrolled_at: now,
                updated_at: now,
            };

            match self.enrollments.insert(enrollment, allow_re_enrollment) {
                Ok(inserted) => {
                    self.campaigns.bump(campaign_id, CounterKind::Enrolled);
                    // First touch time: step 1's delay pushed past the send
                    // window.
                    schedule_next(
                        &self.campaigns,
                        &self.enrollments,
                        self.events.as_ref(),
                        &inserted.id,
                        now,
                    )?;
                    self.events.emit(make_event(
                        EventType::EnrollmentCreated,
                        Some(*campaign_id),
                        Some(inserted.id),
                        None,
                        Some(inserted.contact_id.clone()),
                        None,
                    ));
                    // Re-read: schedule_next filled in next_touch_at.
                    if let Some(current) = self.enrollments.get(&inserted.id) {
                        outcome.enrolled.push(current);
                    }
                }
                Err(error) => {
                    warn!(contact_id = %contact.contact_id, %error, "Enrollment rejected");
                    outcome.rejected.push((contact.contact_id, error));
                }
            }
        }

        info!(
            campaign_id = %campaign_id,
            enrolled = outcome.enrolled.len(),
            rejected = outcome.rejected.len(),
            "Enroll command finished"
        );
        Ok(outcome)
    }

    pub fn pause_enrollment(
        &self,
        actor: &ActingUser,
        id: &Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.authorize_enrollment(actor, id)?;
        let paused = self.enrollments.pause(id, reason, now)?;
        self.events.emit(make_event(
            EventType::EnrollmentPaused,
            Some(paused.campaign_id),
            Some(paused.id),
            None,
            Some(paused.contact_id.clone()),
            None,
        ));
        Ok(paused)
    }

    pub fn resume_enrollment(
        &self,
        actor: &ActingUser,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.authorize_enrollment(actor, id)?;
        let resumed = self
            .enrollments
            .resume(id, self.config.scheduler.resume_buffer_secs, now)?;
        self.events.emit(make_event(
            EventType::EnrollmentResumed,
            Some(resumed.campaign_id),
            Some(resumed.id),
            None,
            Some(resumed.contact_id.clone()),
            None,
        ));
        Ok(resumed)
    }

    /// Hard-remove an enrollment. Cancels any pending touch (returning
    /// escrowed credits) before the row disappears; an already-dispatched
    /// send is not recalled.
    pub fn remove_from_campaign(
        &self,
        actor: &ActingUser,
        id: &Uuid,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.authorize_enrollment(actor, id)?;

        if let Some(open) = self.touches.open_for_enrollment(id) {
            if let Some(reservation_id) = open.reservation_id {
                self.ledger.release(reservation_id, "enrollment removed")?;
            }
            self.touches.cancel_open(id, now);
        }

        let removed = self.enrollments.remove(id)?;
        self.events.emit(make_event(
            EventType::EnrollmentRemoved,
            Some(removed.campaign_id),
            Some(removed.id),
            None,
            Some(removed.contact_id.clone()),
            None,
        ));
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Credits
    // ------------------------------------------------------------------

    pub fn purchase_credits(
        &self,
        actor: &ActingUser,
        package_id: &str,
    ) -> DripResult<LedgerTransaction> {
        let tx = self.ledger.purchase(package_id)?;
        self.events.emit(make_event(
            EventType::CreditsPurchased,
            None,
            None,
            None,
            Some(actor.user_id.clone()),
            None,
        ));
        Ok(tx)
    }

    /// Refund a usage transaction. Admin-only.
    pub fn refund_usage(
        &self,
        actor: &ActingUser,
        transaction_id: Uuid,
        reason: &str,
    ) -> DripResult<LedgerTransaction> {
        if !actor.admin {
            return Err(DripError::Authorization(
                "refunds require an admin actor".into(),
            ));
        }
        let tx = self.ledger.refund(transaction_id, reason)?;
        self.events.emit(make_event(
            EventType::CreditsRefunded,
            None,
            None,
            None,
            Some(actor.user_id.clone()),
            None,
        ));
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Background passes
    // ------------------------------------------------------------------

    /// One scheduler pass plus execution of everything it claimed. Called
    /// on an interval by the server binary; called with a pinned clock by
    /// tests.
    pub fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let requests = self.scheduler.run_pass(now);
        let mut summary = TickSummary {
            dispatched: requests.len(),
            ..TickSummary::default()
        };

        for request in &requests {
            match self.executor.execute(request, now) {
                Ok(TouchOutcome::Sent) => summary.sent += 1,
                Ok(TouchOutcome::Delivered) => summary.delivered += 1,
                Ok(TouchOutcome::Retrying) => summary.retrying += 1,
                Ok(TouchOutcome::Failed) => summary.failed += 1,
                Ok(TouchOutcome::Bounced) => summary.bounced += 1,
                Ok(TouchOutcome::Skipped) => summary.skipped += 1,
                Err(error) => {
                    warn!(touch_id = %request.touch_id, %error, "Touch execution errored");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    /// Expire enrollments beyond the staleness window.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        self.scheduler.expire_stale(now)
    }

    // ------------------------------------------------------------------
    // Read models
    // ------------------------------------------------------------------

    pub fn campaign(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id)
    }

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        self.campaigns.list()
    }

    pub fn enrollment(&self, id: &Uuid) -> Option<EnrollmentDetail> {
        let enrollment = self.enrollments.get(id)?;
        let touches = self.touches.list_for_enrollment(id);
        Some(EnrollmentDetail { enrollment, touches })
    }

    pub fn enrollments_for_campaign(&self, campaign_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments.list_by_campaign(campaign_id)
    }

    pub fn credit_balance(&self) -> CreditBalance {
        self.ledger.snapshot()
    }

    pub fn credit_packages(&self) -> Vec<CreditPackage> {
        self.ledger.list_packages()
    }

    pub fn ledger_statement(&self) -> Vec<LedgerTransaction> {
        self.ledger.statement()
    }

    pub fn ledger_audit(&self) -> f64 {
        self.ledger.audit()
    }

    pub fn opt_out_history(&self, contact_id: &str) -> Vec<OptOutRecord> {
        self.optout.history(contact_id)
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn authorize_campaign(&self, actor: &ActingUser, id: &Uuid) -> DripResult<Campaign> {
        let campaign = self
            .campaigns
            .get(id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {id}")))?;
        if actor.admin || campaign.owner_user_id == actor.user_id {
            Ok(campaign)
        } else {
            Err(DripError::Authorization(format!(
                "user {} does not own campaign {}",
                actor.user_id, id
            )))
        }
    }

    fn authorize_enrollment(&self, actor: &ActingUser, id: &Uuid) -> DripResult<Enrollment> {
        let enrollment = self
            .enrollments
            .get(id)
            .ok_or_else(|| DripError::NotFound(format!("enrollment {id}")))?;
        // Ownership follows the campaign; orphaned enrollments (campaign
        // deleted underneath) are admin-only.
        match self.campaigns.get(&enrollment.campaign_id) {
            Some(campaign) if actor.admin || campaign.owner_user_id == actor.user_id => {
                Ok(enrollment)
            }
            None if actor.admin => Ok(enrollment),
            _ => Err(DripError::Authorization(format!(
                "user {} cannot modify enrollment {}",
                actor.user_id, id
            ))),
        }
    }
}
