//! Consent history is append/flip only: a new opt-out deactivates any prior
//! opt-in for that (contact, channel); opting back in appends an inactive
//! record with its own timestamp rather than deleting history.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use drip_core::types::Channel;

/// Why a contact was opted out of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptOutReason {
    #[default]
    UserRequest,
    CarrierComplaint,
    Bounced,
    AdminAction,
}

/// Where the opt-out originated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptOutSource {
    pub campaign_id: Option<Uuid>,
    pub touch_id: Option<Uuid>,
}

/// One consent-history entry. `active = true` is an opt-out; `active = false`
/// records an opt-back-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptOutRecord {
    pub id: Uuid,
    pub contact_id: String,
    pub channel: Channel,
    pub active: bool,
    pub reason: OptOutReason,
    pub source: OptOutSource,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe opt-out registry backed by `DashMap`, keyed by contact.
///
/// An active opt-out for a channel makes that channel unusable for the
/// contact across all campaigns until explicitly reversed.
pub struct OptOutRegistry {
    entries: DashMap<String, Vec<OptOutRecord>>,
}

impl OptOutRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register an opt-out. Idempotent: when the latest record for this
    /// (contact, channel) is already an active opt-out, the existing record
    /// is returned and no new one is appended.
    pub fn register(
        &self,
        contact_id: &str,
        channel: Channel,
        reason: OptOutReason,
        source: OptOutSource,
    ) -> OptOutRecord {
        let mut history = self.entries.entry(contact_id.to_string()).or_default();

        if let Some(existing) = Self::latest_for(&history, channel) {
            if existing.active {
                return existing.clone();
            }
        }

        let record = OptOutRecord {
            id: Uuid::new_v4(),
            contact_id: contact_id.to_string(),
            channel,
            active: true,
            reason,
            source,
            created_at: Utc::now(),
        };
        history.push(record.clone());

        info!(contact_id, channel = %channel, reason = ?reason, "Opt-out registered");
        metrics::counter!("optout.registered").increment(1);
        record
    }

    /// Reverse an opt-out by appending an inactive record. Returns `None`
    /// when the contact is not currently opted out of the channel.
    pub fn opt_back_in(&self, contact_id: &str, channel: Channel) -> Option<OptOutRecord> {
        let mut history = self.entries.get_mut(contact_id)?;

        let currently_out = Self::latest_for(&history, channel).is_some_and(|r| r.active);
        if !currently_out {
            return None;
        }

        let record = OptOutRecord {
            id: Uuid::new_v4(),
            contact_id: contact_id.to_string(),
            channel,
            active: false,
            reason: OptOutReason::UserRequest,
            source: OptOutSource::default(),
            created_at: Utc::now(),
        };
        history.push(record.clone());

        info!(contact_id, channel = %channel, "Contact opted back in");
        Some(record)
    }

    /// Whether the channel is currently unusable for the contact.
    pub fn is_opted_out(&self, contact_id: &str, channel: Channel) -> bool {
        self.entries
            .get(contact_id)
            .map(|history| Self::latest_for(&history, channel).is_some_and(|r| r.active))
            .unwrap_or(false)
    }

    /// True when every one of the given channels is opted out.
    pub fn all_opted_out(&self, contact_id: &str, channels: &[Channel]) -> bool {
        !channels.is_empty() && channels.iter().all(|c| self.is_opted_out(contact_id, *c))
    }

    /// Full consent history for a contact, oldest first.
    pub fn history(&self, contact_id: &str) -> Vec<OptOutRecord> {
        self.entries
            .get(contact_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Count of currently active opt-outs across all contacts.
    pub fn active_count(&self) -> usize {
        use std::collections::HashSet;
        self.entries
            .iter()
            .map(|entry| {
                let mut seen: HashSet<Channel> = HashSet::new();
                let mut active = 0usize;
                for record in entry.value().iter().rev() {
                    if seen.insert(record.channel) && record.active {
                        active += 1;
                    }
                }
                active
            })
            .sum()
    }

    fn latest_for(history: &[OptOutRecord], channel: Channel) -> Option<&OptOutRecord> {
        history.iter().rev().find(|r| r.channel == channel)
    }
}

impl Default for OptOutRegistry {
    fn default() -> Self {
        Self::new()
    }
}
