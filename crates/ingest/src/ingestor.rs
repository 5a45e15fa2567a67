//! The ingestor runs fully asynchronously beside the scheduler and executor.
//! It only ever moves enrollments toward a more terminal or paused state —
//! it never re-activates a paused enrollment, so it cannot race an explicit
//! resume command. Duplicate and out-of-order callbacks are idempotent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use drip_campaigns::{BouncePolicy, CampaignStore, CounterKind};
use drip_core::config::IngestConfig;
use drip_core::error::DripResult;
use drip_core::event_bus::{make_event, EventSink};
use drip_core::types::{Channel, EventType};
use drip_delivery::{Touch, TouchLog, TouchStatus};
use drip_enrollment::{EnrollmentStatus, EnrollmentStore};
use drip_ledger::CreditLedger;
use drip_optout::{OptOutReason, OptOutRegistry, OptOutSource};

/// Carrier keywords that are consent revocations, not conversation.
const OPT_OUT_KEYWORDS: [&str; 6] = ["stop", "stopall", "unsubscribe", "cancel", "end", "quit"];

/// Reply phrases the engine treats as a conversion signal when the campaign
/// has `auto_convert_on_response` set.
const CONVERSION_KEYWORDS: [&str; 5] =
    ["yes", "interested", "call me", "sign me up", "schedule"];

/// A delivery receipt or bounce notice from a channel provider, keyed by
/// the provider's message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub provider_message_id: String,
    pub kind: DeliveryKind,
    pub occurred_at: DateTime<Utc>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Delivered,
    Failed,
    Bounced,
}

/// An inbound reply from a contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundResponse {
    /// Provider-side event id, used for idempotent application.
    pub external_id: String,
    /// Message the contact replied to, when the provider threads it.
    pub provider_message_id: Option<String>,
    pub contact_id: String,
    pub channel: Channel,
    pub body: String,
    pub occurred_at: DateTime<Utc>,
}

pub struct EventIngestor {
    campaigns: Arc<CampaignStore>,
    enrollments: Arc<EnrollmentStore>,
    touches: Arc<TouchLog>,
    optout: Arc<OptOutRegistry>,
    ledger: Arc<CreditLedger>,
    events: Arc<dyn EventSink>,
    config: IngestConfig,
    /// External event ids already applied; a repeat is a no-op.
    processed: DashMap<String, DateTime<Utc>>,
}

impl EventIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        campaigns: Arc<CampaignStore>,
        enrollments: Arc<EnrollmentStore>,
        touches: Arc<TouchLog>,
        optout: Arc<OptOutRegistry>,
        ledger: Arc<CreditLedger>,
        events: Arc<dyn EventSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            campaigns,
            enrollments,
            touches,
            optout,
            ledger,
            events,
            config,
            processed: DashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Delivery callbacks
    // ------------------------------------------------------------------

    /// Apply a delivery/bounce callback. Returns `false` when the event was
    /// a duplicate or referenced an unknown message.
    pub fn handle_delivery(&self, event: &DeliveryEvent, now: DateTime<Utc>) -> DripResult<bool> {
        let dedupe_key = format!("{}:{:?}", event.provider_message_id, event.kind);
        if self.processed.insert(dedupe_key, now).is_some() {
            debug!(provider_id = %event.provider_message_id, "Duplicate delivery callback ignored");
            return Ok(false);
        }

        let touch = match self.touches.by_provider(&event.provider_message_id) {
            Some(touch) => touch,
            None => {
                warn!(provider_id = %event.provider_message_id, "Delivery callback for unknown message");
                return Ok(false);
            }
        };

        metrics::counter!("ingest.delivery_events", "kind" => format!("{:?}", event.kind))
            .increment(1);

        match event.kind {
            DeliveryKind::Delivered => self.apply_delivered(&touch, event),
            DeliveryKind::Failed => self.apply_failed(&touch, event),
            DeliveryKind::Bounced => self.apply_bounced(&touch, event, now),
        }?;
        Ok(true)
    }

    fn apply_delivered(&self, touch: &Touch, event: &DeliveryEvent) -> DripResult<()> {
        // Only a sent touch can confirm delivery; late receipts after a
        // failure/bounce record are stale and ignored.
        if touch.status != TouchStatus::Sent {
            return Ok(());
        }
        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Delivered;
            t.delivered_at = Some(event.occurred_at);
            Ok(())
        })?;
        self.enrollments.update(&touch.enrollment_id, |e| {
            e.touches_delivered += 1;
            Ok(())
        })?;
        self.events.emit(make_event(
            EventType::TouchDelivered,
            Some(touch.campaign_id),
            Some(touch.enrollment_id),
            Some(touch.id),
            Some(touch.contact_id.clone()),
            Some(touch.channel),
        ));
        Ok(())
    }

    fn apply_failed(&self, touch: &Touch, event: &DeliveryEvent) -> DripResult<()> {
        if touch.status != TouchStatus::Sent {
            return Ok(());
        }
        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Failed;
            t.failed_at = Some(event.occurred_at);
            t.error = event
                .error_message
                .clone()
                .or_else(|| event.error_code.clone());
            Ok(())
        })?;
        self.enrollments.update(&touch.enrollment_id, |e| {
            e.touches_failed += 1;
            Ok(())
        })?;
        self.events.emit(make_event(
            EventType::TouchFailed,
            Some(touch.campaign_id),
            Some(touch.enrollment_id),
            Some(touch.id),
            Some(touch.contact_id.clone()),
            Some(touch.channel),
        ));
        Ok(())
    }

    fn apply_bounced(
        &self,
        touch: &Touch,
        event: &DeliveryEvent,
        now: DateTime<Utc>,
    ) -> DripResult<()> {
        // A bounce can land while the touch is in flight or after the sent
        // confirmation; any other terminal state already won.
        if !matches!(
            touch.status,
            TouchStatus::Sent | TouchStatus::Pending | TouchStatus::Sending
        ) {
            return Ok(());
        }
        self.touches.update(&touch.id, |t| {
            t.status = TouchStatus::Bounced;
            t.failed_at = Some(event.occurred_at);
            t.error = event
                .error_message
                .clone()
                .or_else(|| event.error_code.clone());
            Ok(())
        })?;

        self.optout.register(
            &touch.contact_id,
            touch.channel,
            OptOutReason::Bounced,
            OptOutSource {
                campaign_id: Some(touch.campaign_id),
                touch_id: Some(touch.id),
            },
        );

        self.events.emit(make_event(
            EventType::TouchBounced,
            Some(touch.campaign_id),
            Some(touch.enrollment_id),
            Some(touch.id),
            Some(touch.contact_id.clone()),
            Some(touch.channel),
        ));

        let whole_enrollment = self
            .campaigns
            .get(&touch.campaign_id)
            .map(|c| c.bounce_policy == BouncePolicy::EntireEnrollment)
            .unwrap_or(false);
        if whole_enrollment {
            if let Some(enrollment) = self.enrollments.get(&touch.enrollment_id) {
                if enrollment.status == EnrollmentStatus::Active {
                    self.cancel_open_touches(&touch.enrollment_id, now)?;
                    self.enrollments
                        .transition(&touch.enrollment_id, EnrollmentStatus::Bounced, now)?;
                    self.events.emit(make_event(
                        EventType::EnrollmentBounced,
                        Some(touch.campaign_id),
                        Some(touch.enrollment_id),
                        None,
                        Some(touch.contact_id.clone()),
                        None,
                    ));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound replies
    // ------------------------------------------------------------------

    /// Apply an inbound reply. Opt-out keywords route to the opt-out flow;
    /// anything else records the response and drives the enrollment per the
    /// campaign's auto-pause / auto-convert flags.
    pub fn handle_inbound(&self, response: &InboundResponse, now: DateTime<Utc>) -> DripResult<bool> {
        if self
            .processed
            .insert(format!("inbound:{}", response.external_id), now)
            .is_some()
        {
            debug!(external_id = %response.external_id, "Duplicate inbound event ignored");
            return Ok(false);
        }

        let normalized = response.body.trim().to_lowercase();
        if OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
            self.handle_opt_out(
                &response.contact_id,
                response.channel,
                OptOutReason::UserRequest,
                OptOutSource::default(),
                now,
            )?;
            return Ok(true);
        }

        metrics::counter!("ingest.responses").increment(1);

        // Thread the reply back to the touch it answers.
        let touch = response
            .provider_message_id
            .as_deref()
            .and_then(|id| self.touches.by_provider(id))
            .or_else(|| {
                self.touches
                    .latest_outbound_for_contact(&response.contact_id, response.channel)
            });

        if let Some(touch) = &touch {
            self.touches.update(&touch.id, |t| {
                t.response_received = true;
                t.responded_at = Some(response.occurred_at);
                t.response_body = Some(response.body.clone());
                Ok(())
            })?;
        }

        // Which enrollment responded: prefer the touch's, fall back to any
        // non-terminal enrollment for the contact.
        let enrollment = match touch
            .as_ref()
            .and_then(|t| self.enrollments.get(&t.enrollment_id))
            .or_else(|| {
                self.enrollments
                    .list_by_contact(&response.contact_id)
                    .into_iter()
                    .find(|e| !e.status.is_terminal())
            }) {
            Some(e) => e,
            None => {
                debug!(contact_id = %response.contact_id, "Inbound reply with no enrollment");
                return Ok(false);
            }
        };

        let first_response = enrollment.responded_at.is_none();
        if first_response {
            self.enrollments.update(&enrollment.id, |e| {
                e.responded_at = Some(response.occurred_at);
                e.response_channel = Some(response.channel);
                e.response_body = Some(response.body.clone());
                Ok(())
            })?;
            self.campaigns.bump(&enrollment.campaign_id, CounterKind::Responded);
            self.events.emit(make_event(
                EventType::ResponseReceived,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                touch.as_ref().map(|t| t.id),
                Some(enrollment.contact_id.clone()),
                Some(response.channel),
            ));
            info!(
                enrollment_id = %enrollment.id,
                contact_id = %enrollment.contact_id,
                channel = %response.channel,
                "Response received"
            );
        }

        let campaign = match self.campaigns.get(&enrollment.campaign_id) {
            Some(c) => c,
            None => return Ok(true),
        };

        // Flag-driven transitions apply only while the enrollment is still
        // active; the ingestor never pulls an enrollment out of pause.
        if enrollment.status != EnrollmentStatus::Active {
            return Ok(true);
        }

        if campaign.auto_convert_on_response && is_conversion_signal(&normalized) {
            self.enrollments.update(&enrollment.id, |e| {
                e.converted_at = Some(response.occurred_at);
                Ok(())
            })?;
            self.cancel_open_touches(&enrollment.id, now)?;
            self.enrollments
                .transition(&enrollment.id, EnrollmentStatus::Converted, now)?;
            self.campaigns.bump(&enrollment.campaign_id, CounterKind::Converted);
            self.events.emit(make_event(
                EventType::ConversionRecorded,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                None,
                Some(enrollment.contact_id.clone()),
                Some(response.channel),
            ));
        } else if campaign.auto_pause_on_response {
            self.cancel_open_touches(&enrollment.id, now)?;
            self.enrollments
                .pause(&enrollment.id, Some("response received".into()), now)?;
            self.events.emit(make_event(
                EventType::EnrollmentPaused,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                None,
                Some(enrollment.contact_id.clone()),
                None,
            ));
        }
        // With neither flag set the enrollment keeps sequencing; steps with
        // `skip_if_responded` will now skip, and the run finishes in
        // `responded` when the steps run out.

        Ok(true)
    }

    // ------------------------------------------------------------------
    // Opt-outs
    // ------------------------------------------------------------------

    /// Register an opt-out from the consent source of truth and terminate
    /// the affected active enrollments. Returns how many enrollments moved
    /// to `opted_out`.
    pub fn handle_opt_out(
        &self,
        contact_id: &str,
        channel: Channel,
        reason: OptOutReason,
        source: OptOutSource,
        now: DateTime<Utc>,
    ) -> DripResult<usize> {
        self.optout.register(contact_id, channel, reason, source);
        self.events.emit(make_event(
            EventType::OptOutRegistered,
            None,
            None,
            None,
            Some(contact_id.to_string()),
            Some(channel),
        ));

        let mut terminated = 0;
        for enrollment in self.enrollments.list_by_contact(contact_id) {
            if enrollment.status != EnrollmentStatus::Active {
                continue;
            }
            let applies = self.config.optout_any_channel
                || enrollment.last_touch_channel == Some(channel);
            if !applies {
                continue;
            }
            self.cancel_open_touches(&enrollment.id, now)?;
            self.enrollments
                .transition(&enrollment.id, EnrollmentStatus::OptedOut, now)?;
            self.campaigns.bump(&enrollment.campaign_id, CounterKind::OptedOut);
            self.events.emit(make_event(
                EventType::EnrollmentOptedOut,
                Some(enrollment.campaign_id),
                Some(enrollment.id),
                None,
                Some(contact_id.to_string()),
                Some(channel),
            ));
            terminated += 1;
        }

        info!(contact_id, channel = %channel, terminated, "Opt-out applied");
        Ok(terminated)
    }

    /// Cancel in-flight touches for an enrollment leaving `Active`, giving
    /// any escrowed direct-mail credits back first.
    fn cancel_open_touches(&self, enrollment_id: &uuid::Uuid, now: DateTime<Utc>) -> DripResult<()> {
        if let Some(open) = self.touches.open_for_enrollment(enrollment_id) {
            if let Some(reservation_id) = open.reservation_id {
                self.ledger.release(reservation_id, "enrollment terminated")?;
            }
            self.touches.cancel_open(enrollment_id, now);
        }
        Ok(())
    }
}

fn is_conversion_signal(normalized_body: &str) -> bool {
    CONVERSION_KEYWORDS
        .iter()
        .any(|k| normalized_body.contains(k))
}
