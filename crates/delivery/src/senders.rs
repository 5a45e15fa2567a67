//! Channel sender seam — the contract this engine expects from messaging
//! providers, plus simulated providers for development and tests. Real
//! carrier integrations implement `ChannelSender` and report delivery
//! through the event ingestor's webhooks.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use drip_core::types::Channel;

/// Rendered, ready-to-dispatch message for one touch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub touch_id: Uuid,
    pub enrollment_id: Uuid,
    pub contact_id: String,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
}

/// What a provider hands back on successful dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_message_id: String,
    /// Synchronous providers confirm delivery in the send call itself.
    pub delivered: bool,
    /// Direct-mail vendors return a tracking number with the receipt.
    pub tracking_number: Option<String>,
}

/// Send failures, split by whether a retry can possibly help.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("transient send failure: {0}")]
    Transient(String),
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

/// One provider for one channel. Implementations must be cheap to call
/// concurrently; the executor never serializes sends across enrollments.
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;
    fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError>;
}

/// Channel -> sender lookup used by the executor.
pub struct SenderRegistry {
    senders: DashMap<Channel, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
        }
    }

    pub fn register(&self, sender: Arc<dyn ChannelSender>) {
        tracing::info!(channel = %sender.channel(), "Channel sender registered");
        self.senders.insert(sender.channel(), sender);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(&channel).map(|s| Arc::clone(s.value()))
    }

    /// Registry with a simulated provider on every channel.
    pub fn simulated() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SimulatedSender::sms()));
        registry.register(Arc::new(SimulatedSender::email()));
        registry.register(Arc::new(SimulatedSender::direct_mail()));
        registry.register(Arc::new(SimulatedSender::social_dm()));
        registry.register(Arc::new(SimulatedSender::phone_reminder()));
        registry
    }
}

impl Default for SenderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated provider — accepts every message and fabricates provider ids
/// in the carrier's format. Stands in for Twilio/SMTP/mail-vendor calls in
/// development.
pub struct SimulatedSender {
    channel: Channel,
    id_prefix: &'static str,
    confirms_delivery: bool,
}

impl SimulatedSender {
    pub fn sms() -> Self {
        Self { channel: Channel::Sms, id_prefix: "SM", confirms_delivery: false }
    }

    pub fn email() -> Self {
        Self { channel: Channel::Email, id_prefix: "EM", confirms_delivery: false }
    }

    pub fn direct_mail() -> Self {
        Self { channel: Channel::DirectMail, id_prefix: "DM", confirms_delivery: false }
    }

    pub fn social_dm() -> Self {
        Self { channel: Channel::SocialDm, id_prefix: "SD", confirms_delivery: false }
    }

    /// Phone reminders are created directly on the agent's task list, so the
    /// "send" confirms synchronously.
    pub fn phone_reminder() -> Self {
        Self { channel: Channel::PhoneReminder, id_prefix: "PR", confirms_delivery: true }
    }
}

impl ChannelSender for SimulatedSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        let provider_message_id = format!(
            "{}{}",
            self.id_prefix,
            Uuid::new_v4().to_string().replace('-', "")
        );

        tracing::info!(
            touch_id = %message.touch_id,
            contact_id = %message.contact_id,
            channel = %self.channel,
            provider_id = %provider_message_id,
            "Message dispatched"
        );
        metrics::counter!("sender.dispatched", "channel" => self.channel.display_name())
            .increment(1);

        let tracking_number = match self.channel {
            Channel::DirectMail => Some(format!("TRK{}", &provider_message_id[2..14])),
            _ => None,
        };

        Ok(SendReceipt {
            provider_message_id,
            delivered: self.confirms_delivery,
            tracking_number,
        })
    }
}

/// Provider that hard-bounces every message. Useful for exercising bounce
/// policies in demos and tests.
pub struct HardBouncingSender {
    channel: Channel,
}

impl HardBouncingSender {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

impl ChannelSender for HardBouncingSender {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        Err(SendError::Permanent(format!(
            "recipient {} is invalid",
            message.contact_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: Channel) -> OutboundMessage {
        OutboundMessage {
            touch_id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            contact_id: "c-1".into(),
            channel,
            subject: None,
            body: "hello".into(),
        }
    }

    #[test]
    fn test_simulated_sender_fabricates_provider_ids() {
        let sender = SimulatedSender::sms();
        let receipt = sender.send(&message(Channel::Sms)).unwrap();
        assert!(receipt.provider_message_id.starts_with("SM"));
        assert!(!receipt.delivered);
        assert!(receipt.tracking_number.is_none());
    }

    #[test]
    fn test_direct_mail_receipt_carries_tracking() {
        let sender = SimulatedSender::direct_mail();
        let receipt = sender.send(&message(Channel::DirectMail)).unwrap();
        assert!(receipt.tracking_number.is_some());
    }

    #[test]
    fn test_phone_reminder_confirms_synchronously() {
        let sender = SimulatedSender::phone_reminder();
        let receipt = sender.send(&message(Channel::PhoneReminder)).unwrap();
        assert!(receipt.delivered);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SenderRegistry::simulated();
        assert!(registry.get(Channel::Email).is_some());

        let empty = SenderRegistry::new();
        assert!(empty.get(Channel::Email).is_none());
    }
}
