use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use drip_core::error::{DripError, DripResult};

use crate::types::{
    Campaign, CampaignCounters, CampaignPatch, CampaignStatus, NewCampaign, NewStep, Step,
    StepContent, StepPatch,
};

/// Which derived campaign counter an enrollment write should bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Enrolled,
    Responded,
    Converted,
    OptedOut,
}

/// Thread-safe campaign definition store backed by `DashMap`.
///
/// Step mutations run under the campaign's map entry lock, so renumbering
/// after a delete is atomic with respect to concurrent readers.
pub struct CampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
}

impl CampaignStore {
    pub fn new() -> Self {
        Self {
            campaigns: DashMap::new(),
        }
    }

    pub fn create(&self, owner_user_id: &str, def: NewCampaign) -> DripResult<Campaign> {
        if def.name.trim().is_empty() {
            return Err(DripError::Validation("campaign name must not be empty".into()));
        }
        if let Some(qh) = &def.quiet_hours {
            if qh.start == qh.end {
                return Err(DripError::Validation(
                    "quiet-hours window must not be empty".into(),
                ));
            }
        }

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            owner_user_id: owner_user_id.to_string(),
            name: def.name,
            description: def.description,
            status: CampaignStatus::Draft,
            lead_type: def.lead_type,
            quiet_hours: def.quiet_hours,
            weekend_skip: def.weekend_skip,
            auto_pause_on_response: def.auto_pause_on_response,
            auto_convert_on_response: def.auto_convert_on_response,
            bounce_policy: def.bounce_policy,
            steps: Vec::new(),
            counters: CampaignCounters::default(),
            version: 1,
            created_at: now,
            updated_at: now,
        };

        info!(campaign_id = %campaign.id, name = %campaign.name, "Campaign created");
        self.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    pub fn get(&self, id: &Uuid) -> Option<Campaign> {
        self.campaigns.get(id).map(|c| c.clone())
    }

    pub fn list(&self) -> Vec<Campaign> {
        self.campaigns.iter().map(|c| c.value().clone()).collect()
    }

    pub fn update(&self, id: &Uuid, patch: CampaignPatch) -> DripResult<Campaign> {
        let mut entry = self
            .campaigns
            .get_mut(id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {id}")))?;

        if let Some(status) = patch.status {
            Self::check_status_change(&entry, status)?;
            entry.status = status;
        }
        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(DripError::Validation("campaign name must not be empty".into()));
            }
            entry.name = name;
        }
        if let Some(description) = patch.description {
            entry.description = description;
        }
        if let Some(lead_type) = patch.lead_type {
            entry.lead_type = lead_type;
        }
        if let Some(quiet_hours) = patch.quiet_hours {
            if let Some(qh) = &quiet_hours {
                if qh.start == qh.end {
                    return Err(DripError::Validation(
                        "quiet-hours window must not be empty".into(),
                    ));
                }
            }
            entry.quiet_hours = quiet_hours;
        }
        if let Some(weekend_skip) = patch.weekend_skip {
            entry.weekend_skip = weekend_skip;
        }
        if let Some(v) = patch.auto_pause_on_response {
            entry.auto_pause_on_response = v;
        }
        if let Some(v) = patch.auto_convert_on_response {
            entry.auto_convert_on_response = v;
        }
        if let Some(v) = patch.bounce_policy {
            entry.bounce_policy = v;
        }

        entry.version += 1;
        entry.updated_at = Utc::now();
        info!(campaign_id = %id, version = entry.version, "Campaign updated");
        Ok(entry.clone())
    }

    pub fn delete(&self, id: &Uuid) -> DripResult<Campaign> {
        let (_, campaign) = self
            .campaigns
            .remove(id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {id}")))?;
        info!(campaign_id = %id, "Campaign deleted");
        Ok(campaign)
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub fn add_step(&self, campaign_id: &Uuid, def: NewStep) -> DripResult<Step> {
        Self::validate_step_content(&def)?;

        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {campaign_id}")))?;

        let step = Step {
            id: Uuid::new_v4(),
            campaign_id: *campaign_id,
            step_number: entry.steps.len() as u32 + 1,
            delay_days: def.delay_days,
            delay_from_enrollment: def.delay_from_enrollment,
            channel: def.content.channel(),
            content: def.content,
            skip_if_responded: def.skip_if_responded,
            skip_if_converted: def.skip_if_converted,
            active: true,
        };

        entry.steps.push(step.clone());
        entry.version += 1;
        entry.updated_at = Utc::now();
        info!(
            campaign_id = %campaign_id,
            step_number = step.step_number,
            channel = %step.channel,
            "Step added"
        );
        Ok(step)
    }

    pub fn update_step(
        &self,
        campaign_id: &Uuid,
        step_id: &Uuid,
        patch: StepPatch,
    ) -> DripResult<Step> {
        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {campaign_id}")))?;

        let step = entry
            .steps
            .iter_mut()
            .find(|s| s.id == *step_id)
            .ok_or_else(|| DripError::NotFound(format!("step {step_id}")))?;

        if let Some(delay_days) = patch.delay_days {
            if delay_days > 365 {
                return Err(DripError::Validation("step delay exceeds 365 days".into()));
            }
            step.delay_days = delay_days;
        }
        if let Some(v) = patch.delay_from_enrollment {
            step.delay_from_enrollment = v;
        }
        if let Some(content) = patch.content {
            if let StepContent::DirectMail { cost_credits, .. } = &content {
                if *cost_credits <= 0.0 {
                    return Err(DripError::Validation(
                        "direct-mail piece cost must be positive".into(),
                    ));
                }
            }
            step.channel = content.channel();
            step.content = content;
        }
        if let Some(v) = patch.skip_if_responded {
            step.skip_if_responded = v;
        }
        if let Some(v) = patch.skip_if_converted {
            step.skip_if_converted = v;
        }
        if let Some(v) = patch.active {
            step.active = v;
        }

        let updated = step.clone();
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(updated)
    }

    /// Delete a step and renumber the remainder. Runs atomically under the
    /// campaign's entry lock.
    pub fn delete_step(&self, campaign_id: &Uuid, step_id: &Uuid) -> DripResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| DripError::NotFound(format!("campaign {campaign_id}")))?;

        let before = entry.steps.len();
        entry.steps.retain(|s| s.id != *step_id);
        if entry.steps.len() == before {
            return Err(DripError::NotFound(format!("step {step_id}")));
        }

        entry.steps.sort_by_key(|s| s.step_number);
        for (idx, step) in entry.steps.iter_mut().enumerate() {
            step.step_number = idx as u32 + 1;
        }

        entry.version += 1;
        entry.updated_at = Utc::now();
        info!(campaign_id = %campaign_id, step_id = %step_id, "Step deleted and sequence renumbered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Derived counters
    // ------------------------------------------------------------------

    pub fn bump(&self, campaign_id: &Uuid, kind: CounterKind) {
        if let Some(mut entry) = self.campaigns.get_mut(campaign_id) {
            match kind {
                CounterKind::Enrolled => entry.counters.enrolled += 1,
                CounterKind::Responded => entry.counters.responded += 1,
                CounterKind::Converted => entry.counters.converted += 1,
                CounterKind::OptedOut => entry.counters.opted_out += 1,
            }
        }
    }

    // ------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------

    fn check_status_change(campaign: &Campaign, to: CampaignStatus) -> DripResult<()> {
        use CampaignStatus::*;
        let ok = matches!(
            (campaign.status, to),
            (Draft, Active) | (Active, Paused) | (Paused, Active) | (Active, Completed) | (Paused, Completed)
        );
        if !ok {
            return Err(DripError::Validation(format!(
                "campaign cannot move from {:?} to {:?}",
                campaign.status, to
            )));
        }
        if to == Active && !campaign.has_active_step() {
            return Err(DripError::Validation(
                "campaign needs at least one active step before activation".into(),
            ));
        }
        Ok(())
    }

    fn validate_step_content(def: &NewStep) -> DripResult<()> {
        if def.delay_days > 365 {
            return Err(DripError::Validation("step delay exceeds 365 days".into()));
        }
        match &def.content {
            StepContent::Sms { body } | StepContent::SocialDm { body, .. } => {
                if body.trim().is_empty() {
                    return Err(DripError::Validation("message body must not be empty".into()));
                }
            }
            StepContent::Email { subject, body } => {
                if subject.trim().is_empty() || body.trim().is_empty() {
                    return Err(DripError::Validation(
                        "email subject and body must not be empty".into(),
                    ));
                }
            }
            StepContent::DirectMail { cost_credits, .. } => {
                if *cost_credits <= 0.0 {
                    return Err(DripError::Validation(
                        "direct-mail piece cost must be positive".into(),
                    ));
                }
            }
            StepContent::PhoneReminder { note } => {
                if note.trim().is_empty() {
                    return Err(DripError::Validation("reminder note must not be empty".into()));
                }
            }
        }
        Ok(())
    }
}

impl Default for CampaignStore {
    fn default() -> Self {
        Self::new()
    }
}
