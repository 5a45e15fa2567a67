use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use drip_core::error::{DripError, DripResult};

use crate::state_machine::EnrollmentStateMachine;
use crate::types::{Enrollment, EnrollmentStatus};

/// Thread-safe enrollment store backed by `DashMap`.
///
/// All single-enrollment mutations run under the map's entry lock, which is
/// what makes `try_claim` an atomic compare-and-set: two workers racing on
/// the same enrollment serialize on the shard lock and exactly one wins.
pub struct EnrollmentStore {
    enrollments: DashMap<Uuid, Enrollment>,
    /// (campaign, contact) -> live enrollment, for re-enrollment checks.
    pair_index: DashMap<(Uuid, String), Uuid>,
    machine: EnrollmentStateMachine,
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self {
            enrollments: DashMap::new(),
            pair_index: DashMap::new(),
            machine: EnrollmentStateMachine::new(),
        }
    }

    /// Insert a new enrollment. Rejects a second enrollment for the same
    /// (campaign, contact) pair unless `allow_re_enrollment` is set.
    pub fn insert(&self, enrollment: Enrollment, allow_re_enrollment: bool) -> DripResult<Enrollment> {
        let key = (enrollment.campaign_id, enrollment.contact_id.clone());

        if !allow_re_enrollment {
            if let Some(existing) = self.pair_index.get(&key) {
                if self.enrollments.contains_key(existing.value()) {
                    return Err(DripError::DuplicateEnrollment {
                        campaign_id: enrollment.campaign_id,
                        contact_id: enrollment.contact_id.clone(),
                    });
                }
            }
        }

        self.pair_index.insert(key, enrollment.id);
        info!(
            enrollment_id = %enrollment.id,
            campaign_id = %enrollment.campaign_id,
            contact_id = %enrollment.contact_id,
            "Enrollment created"
        );
        self.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    pub fn get(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|e| e.clone())
    }

    pub fn list_by_campaign(&self, campaign_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.value().campaign_id == *campaign_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_by_contact(&self, contact_id: &str) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.value().contact_id == contact_id)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Active enrollments due at `now` with a free (or expired) claim lease,
    /// in deterministic order: ascending `next_touch_at`, then ascending id.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<Enrollment> {
        let mut due: Vec<Enrollment> = self
            .enrollments
            .iter()
            .filter(|e| {
                let e = e.value();
                e.status == EnrollmentStatus::Active
                    && e.next_touch_at.is_some_and(|t| t <= now)
                    && e.claimable(now)
            })
            .map(|e| e.value().clone())
            .collect();

        due.sort_by_key(|e| (e.next_touch_at, e.id));
        due.truncate(limit);
        due
    }

    /// Non-terminal enrollments whose last touch activity predates the
    /// staleness cutoff. Candidates for the expiry sweep.
    pub fn stale(&self, now: DateTime<Utc>, staleness_days: i64) -> Vec<Enrollment> {
        let cutoff = now - Duration::days(staleness_days);
        self.enrollments
            .iter()
            .filter(|e| {
                let e = e.value();
                self.machine.can_transition(e.status, EnrollmentStatus::Expired)
                    && e.last_touch_at.unwrap_or(e.enrolled_at) < cutoff
            })
            .map(|e| e.value().clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Claim lease
    // ------------------------------------------------------------------

    /// Atomic conditional claim. Returns `true` when this caller now owns
    /// the enrollment until `now + lease_secs`. A lost race is not an error;
    /// the losing worker simply skips the enrollment.
    pub fn try_claim(&self, id: &Uuid, now: DateTime<Utc>, lease_secs: i64) -> bool {
        match self.enrollments.get_mut(id) {
            Some(mut e) => {
                if e.status != EnrollmentStatus::Active || !e.claimable(now) {
                    return false;
                }
                e.claimed_until = Some(now + Duration::seconds(lease_secs));
                true
            }
            None => false,
        }
    }

    pub fn release_claim(&self, id: &Uuid) {
        if let Some(mut e) = self.enrollments.get_mut(id) {
            e.claimed_until = None;
        }
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Apply a closure to one enrollment under its entry lock.
    pub fn update<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Enrollment) -> DripResult<R>,
    ) -> DripResult<R> {
        let mut e = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| DripError::NotFound(format!("enrollment {id}")))?;
        let result = f(&mut e)?;
        e.updated_at = Utc::now();
        Ok(result)
    }

    /// Validated state transition. Clears `next_touch_at` whenever the
    /// enrollment leaves `Active`, upholding the scheduling invariant.
    pub fn transition(
        &self,
        id: &Uuid,
        to: EnrollmentStatus,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        let mut e = self
            .enrollments
            .get_mut(id)
            .ok_or_else(|| DripError::NotFound(format!("enrollment {id}")))?;

        self.machine.ensure(e.status, to)?;
        e.status = to;
        if to != EnrollmentStatus::Active {
            e.next_touch_at = None;
        }
        if to == EnrollmentStatus::Paused {
            e.paused_at = Some(now);
        }
        e.updated_at = Utc::now();

        info!(enrollment_id = %id, status = %to, "Enrollment transitioned");
        Ok(e.clone())
    }

    pub fn pause(
        &self,
        id: &Uuid,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.transition(id, EnrollmentStatus::Paused, now)?;
        self.update(id, |e| {
            e.pause_reason = reason;
            Ok(e.clone())
        })
    }

    /// Resume a paused enrollment. `next_touch_at` becomes `now + buffer`
    /// rather than the original stale schedule, so a resume never triggers a
    /// burst of overdue sends.
    pub fn resume(
        &self,
        id: &Uuid,
        buffer_secs: i64,
        now: DateTime<Utc>,
    ) -> DripResult<Enrollment> {
        self.transition(id, EnrollmentStatus::Active, now)?;
        self.update(id, |e| {
            e.next_touch_at = Some(now + Duration::seconds(buffer_secs));
            e.paused_at = None;
            e.pause_reason = None;
            Ok(e.clone())
        })
    }

    /// Hard delete. Not a state-machine transition; legal from any state.
    pub fn remove(&self, id: &Uuid) -> DripResult<Enrollment> {
        let (_, enrollment) = self
            .enrollments
            .remove(id)
            .ok_or_else(|| DripError::NotFound(format!("enrollment {id}")))?;

        let key = (enrollment.campaign_id, enrollment.contact_id.clone());
        if self.pair_index.get(&key).is_some_and(|v| *v.value() == enrollment.id) {
            self.pair_index.remove(&key);
        }

        info!(enrollment_id = %id, "Enrollment removed");
        Ok(enrollment)
    }

    pub fn count(&self) -> usize {
        self.enrollments.len()
    }
}

impl Default for EnrollmentStore {
    fn default() -> Self {
        Self::new()
    }
}
