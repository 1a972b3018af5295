//! [`Channel`] implementation for the WebSocket transport.

use async_trait::async_trait;

use cropwatch_channel::{ChannelConnection, TopicSubscription};

use crate::supervisor::Channel;

#[async_trait]
impl Channel for ChannelConnection {
    async fn connect(&self) -> cropwatch_channel::Result<()> {
        self.connect().await
    }

    async fn disconnect(&self) -> cropwatch_channel::Result<()> {
        self.disconnect().await
    }

    async fn is_connected(&self) -> bool {
        self.is_connected().await
    }

    async fn subscribe(&self, subscription: TopicSubscription) {
        self.subscribe(subscription).await;
    }

    async fn unsubscribe(&self, topic: &str) {
        self.unsubscribe(topic).await;
    }

    async fn request_sensor_data(&self, manual: bool) -> cropwatch_channel::Result<bool> {
        self.request_sensor_data(manual).await
    }

    async fn request_thresholds(&self) -> cropwatch_channel::Result<bool> {
        self.request_thresholds().await
    }

    async fn ping(&self) -> cropwatch_channel::Result<()> {
        self.ping().await
    }
}
