//! Per-topic subscriptions delivering decoded push messages.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{ChannelError, Result};
use crate::message::PushMessage;

/// Callback type for handling received push messages.
pub type PushCallback = Arc<dyn Fn(PushMessage) -> Result<()> + Send + Sync>;

/// A subscription to one push topic.
#[derive(Clone)]
pub struct TopicSubscription {
    /// Topic this subscription receives, e.g. `sensor_data`.
    pub topic: String,
    callback: Option<PushCallback>,
    message_tx: Option<mpsc::Sender<PushMessage>>,
}

impl TopicSubscription {
    /// Create a subscription with callback-based delivery.
    pub fn with_callback(topic: impl Into<String>, callback: PushCallback) -> Self {
        Self {
            topic: topic.into(),
            callback: Some(callback),
            message_tx: None,
        }
    }

    /// Create a subscription that receives messages on a bounded channel.
    pub fn with_channel(topic: impl Into<String>) -> (Self, mpsc::Receiver<PushMessage>) {
        let (tx, rx) = mpsc::channel(1000);
        let subscription = Self {
            topic: topic.into(),
            callback: None,
            message_tx: Some(tx),
        };
        (subscription, rx)
    }

    /// Create a subscription that forwards into an existing sender, so
    /// several topics can share one consumer loop.
    pub fn with_sender(topic: impl Into<String>, message_tx: mpsc::Sender<PushMessage>) -> Self {
        Self {
            topic: topic.into(),
            callback: None,
            message_tx: Some(message_tx),
        }
    }

    /// Handle a received message.
    pub fn deliver(&self, message: PushMessage) -> Result<()> {
        if let Some(callback) = &self.callback {
            callback(message.clone())?;
        }

        if let Some(tx) = &self.message_tx {
            tx.try_send(message).map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => ChannelError::Subscription(
                    "message channel full - consumer too slow".to_string(),
                ),
                mpsc::error::TrySendError::Closed(_) => {
                    ChannelError::Subscription("message channel closed".to_string())
                }
            })?;
        }

        Ok(())
    }
}
