//! End-to-end supervisor behavior against a scripted channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::time;

use cropwatch_channel::{ChannelError, PushMessage, TopicSubscription, decode_push_message};
use cropwatch_core::{Reading, ReadingStatus, SensorKind};
use cropwatch_engine::{
    Channel, EngineConfig, EngineError, EngineHandle, SharedIdentity, StaticIdentity, SyncEngine,
    UserProfile,
};

/// Scripted transport double: connects on demand, fails the first N
/// attempts, and lets tests inject push messages through the registered
/// subscriptions.
#[derive(Default)]
struct MockChannel {
    connected: AtomicBool,
    fail_next_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    pings: AtomicUsize,
    data_requests: AtomicUsize,
    threshold_requests: AtomicUsize,
    subscriptions: Mutex<HashMap<String, TopicSubscription>>,
}

impl MockChannel {
    fn failing_first(attempts: usize) -> Self {
        let channel = Self::default();
        channel.fail_next_connects.store(attempts, Ordering::SeqCst);
        channel
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, TopicSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: PushMessage) -> anyhow::Result<()> {
        let subscription = self.subscriptions().get(message.topic()).cloned();
        let subscription = subscription
            .ok_or_else(|| anyhow::anyhow!("no subscription for {}", message.topic()))?;
        subscription
            .deliver(message)
            .map_err(|error| anyhow::anyhow!("delivery failed: {error}"))
    }

    fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn connect(&self) -> cropwatch_channel::Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining_failures = self.fail_next_connects.load(Ordering::SeqCst);
        if remaining_failures > 0 {
            self.fail_next_connects
                .store(remaining_failures - 1, Ordering::SeqCst);
            return Err(ChannelError::Connection("server unreachable".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> cropwatch_channel::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, subscription: TopicSubscription) {
        self.subscriptions()
            .insert(subscription.topic.clone(), subscription);
    }

    async fn unsubscribe(&self, topic: &str) {
        self.subscriptions().remove(topic);
    }

    async fn request_sensor_data(&self, _manual: bool) -> cropwatch_channel::Result<bool> {
        self.data_requests.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn request_thresholds(&self) -> cropwatch_channel::Result<bool> {
        self.threshold_requests.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn ping(&self) -> cropwatch_channel::Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn reading(id: i64, sensor_id: &str, kind: SensorKind, value: f64) -> Reading {
    Reading {
        id,
        sensor_id: sensor_id.to_string(),
        kind,
        value,
        unit: "%".to_string(),
        location_id: "loc1".to_string(),
        device_id: None,
        status: ReadingStatus::Normal,
        timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single()
            .unwrap_or_default(),
        metadata: None,
        owner_id: None,
    }
}

fn config_in(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        cache_dir: Some(dir.to_path_buf()),
        ..EngineConfig::default()
    }
}

async fn settle() {
    time::sleep(Duration::from_millis(20)).await;
}

async fn shutdown(handle: &EngineHandle) -> anyhow::Result<()> {
    handle
        .shutdown()
        .await
        .map_err(|error| anyhow::anyhow!("shutdown failed: {error}"))
}

#[tokio::test(start_paused = true)]
async fn connects_subscribes_and_primes_on_start() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::authenticated(UserProfile::with_id(42))),
        config_in(temp.path()),
    );
    settle().await;

    assert_eq!(channel.connect_attempts(), 1);
    assert!(handle.is_connected());
    assert!(channel.subscriptions().contains_key("sensor_data"));
    assert_eq!(channel.threshold_requests.load(Ordering::SeqCst), 1);
    assert_eq!(channel.data_requests.load(Ordering::SeqCst), 1);

    shutdown(&handle).await?;
    assert!(channel.subscriptions().is_empty());
    assert!(!handle.is_connected());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn guest_scenario_pushed_reading_lands_with_backfill() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::guest()),
        config_in(temp.path()),
    );
    settle().await;
    assert!(handle.is_connected());

    let frame = r#"{
        "type": "sensor_data",
        "data": {
            "id": 1,
            "sensor_id": "humidity_loc1",
            "type": "humidity",
            "value": 55,
            "unit": "%",
            "location_id": "loc1",
            "status": "normal",
            "timestamp": "2024-01-01T00:00:00Z"
        }
    }"#;
    let message = decode_push_message(frame)
        .map_err(|error| anyhow::anyhow!("decode failed: {error}"))?
        .ok_or_else(|| anyhow::anyhow!("frame not recognized"))?;
    channel.push(message)?;
    settle().await;

    let latest = handle.latest();
    let entry = latest
        .get("humidity_loc1")
        .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
    assert_eq!(entry.value, 55.0);
    assert_eq!(handle.history().len(), 6);
    assert_eq!(handle.sensor_history("humidity_loc1").len(), 6);
    assert_eq!(handle.counts().get(&SensorKind::Humidity), Some(&1));
    assert_eq!(handle.of_kind(SensorKind::Humidity).len(), 1);
    assert_eq!(handle.at_location("loc1").len(), 1);
    assert!(handle.by_location().contains_key("loc1"));

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn reconnects_once_per_health_tick_until_connected() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::failing_first(3));
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::authenticated(UserProfile::with_id(42))),
        config_in(temp.path()),
    );
    settle().await;

    // The initial attempt failed and surfaced a transient error.
    assert_eq!(channel.connect_attempts(), 1);
    assert!(!handle.is_connected());
    assert!(handle.connection_error().is_some());

    // Exactly one retry per 5-second health tick.
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(channel.connect_attempts(), 2);
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(channel.connect_attempts(), 3);

    // Fourth attempt succeeds and clears the error.
    time::sleep(Duration::from_secs(5)).await;
    assert_eq!(channel.connect_attempts(), 4);
    assert!(handle.is_connected());
    assert!(handle.connection_error().is_none());

    // Once connected the health tick only pings.
    time::sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.connect_attempts(), 4);
    assert!(channel.pings.load(Ordering::SeqCst) >= 2);

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn transient_errors_expire_when_no_new_errors_occur() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::failing_first(1));
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::authenticated(UserProfile::with_id(42))),
        config_in(temp.path()),
    );
    settle().await;
    assert!(handle.connection_error().is_some());

    // Pause the channel so the health loop stops producing fresh errors.
    handle
        .toggle_connection()
        .await
        .map_err(|error| anyhow::anyhow!("toggle failed: {error}"))?;
    settle().await;

    time::sleep(Duration::from_secs(31)).await;
    assert!(handle.connection_error().is_none());

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn identity_switch_rescopes_without_data_bleed() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let identity = SharedIdentity::new(Some(UserProfile::with_id(42)));
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(identity.clone()),
        config_in(temp.path()),
    );
    settle().await;

    channel.push(PushMessage::SensorData(reading(
        1,
        "42_humidity_1",
        SensorKind::Humidity,
        55.0,
    )))?;
    settle().await;
    assert_eq!(handle.latest().len(), 1);

    // Switch accounts: the next health tick drops the socket, swaps the
    // live view and reconnects after the grace delay.
    identity.set_user(UserProfile::with_id(7));
    time::sleep(Duration::from_secs(8)).await;

    assert!(handle.latest().is_empty());
    assert!(handle.history().is_empty());
    assert!(handle.is_connected());

    // Switching back reloads the first user's persisted snapshots.
    identity.set_user(UserProfile::with_id(42));
    time::sleep(Duration::from_secs(8)).await;

    let latest = handle.latest();
    let entry = latest
        .get("42_humidity_1")
        .ok_or_else(|| anyhow::anyhow!("missing reloaded entry"))?;
    assert_eq!(entry.value, 55.0);
    // Only the measured sample is durable, not the synthetic backfill.
    assert_eq!(handle.history().len(), 1);

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn toggle_connection_pauses_and_resumes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::authenticated(UserProfile::with_id(42))),
        config_in(temp.path()),
    );
    settle().await;
    assert!(handle.is_connected());
    assert_eq!(channel.connect_attempts(), 1);

    handle
        .toggle_connection()
        .await
        .map_err(|error| anyhow::anyhow!("toggle failed: {error}"))?;
    settle().await;
    assert!(!handle.is_connected());

    // Paused: health ticks must not reconnect.
    time::sleep(Duration::from_secs(12)).await;
    assert_eq!(channel.connect_attempts(), 1);

    handle
        .toggle_connection()
        .await
        .map_err(|error| anyhow::anyhow!("toggle failed: {error}"))?;
    settle().await;
    assert_eq!(channel.connect_attempts(), 2);
    assert!(handle.is_connected());

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn alerts_forward_to_the_wired_sink() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let (alert_tx, mut alert_rx) = tokio::sync::mpsc::channel(8);
    let handle = SyncEngine::start_with_alerts(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::authenticated(UserProfile::with_id(42))),
        config_in(temp.path()),
        Some(alert_tx),
    );
    settle().await;

    let frame = r#"{
        "type": "sensor_alert",
        "data": {
            "id": 9,
            "sensor_id": "42_ph_1",
            "sensor_type": "ph",
            "alert_type": "high",
            "value": 8.4,
            "threshold_value": 8.0,
            "unit": "pH",
            "location_id": "location_42_1",
            "message": "Sensor 42_ph_1 value (8.4 pH) is above maximum threshold (8.0 pH)",
            "timestamp": "2024-01-01T06:00:00",
            "is_active": true,
            "user_id": 42
        }
    }"#;
    let message = decode_push_message(frame)
        .map_err(|error| anyhow::anyhow!("decode failed: {error}"))?
        .ok_or_else(|| anyhow::anyhow!("frame not recognized"))?;
    channel.push(message)?;
    settle().await;

    let alert = alert_rx
        .try_recv()
        .map_err(|error| anyhow::anyhow!("no alert forwarded: {error}"))?;
    assert_eq!(alert.sensor_id, "42_ph_1");
    assert_eq!(alert.value, 8.4);

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn thresholds_push_restamps_the_live_view() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::guest()),
        config_in(temp.path()),
    );
    settle().await;

    channel.push(PushMessage::SensorData(reading(
        1,
        "ph_a",
        SensorKind::Ph,
        8.4,
    )))?;
    settle().await;

    let frame = r#"{
        "type": "thresholds_data",
        "data": {
            "thresholds": [
                {"id":"1","sensorType":"ph","min":5.25,"max":8.25,"unit":"pH","isActive":true}
            ]
        }
    }"#;
    let message = decode_push_message(frame)
        .map_err(|error| anyhow::anyhow!("decode failed: {error}"))?
        .ok_or_else(|| anyhow::anyhow!("frame not recognized"))?;
    channel.push(message)?;
    settle().await;

    let latest = handle.latest();
    let entry = latest
        .get("ph_a")
        .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
    assert_eq!(entry.status, ReadingStatus::High);
    assert_eq!(handle.thresholds().len(), 1);

    shutdown(&handle).await
}

#[tokio::test(start_paused = true)]
async fn commands_after_shutdown_report_disposed() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let channel = Arc::new(MockChannel::default());
    let handle = SyncEngine::start(
        Arc::clone(&channel) as Arc<dyn Channel>,
        Arc::new(StaticIdentity::guest()),
        config_in(temp.path()),
    );
    settle().await;
    shutdown(&handle).await?;

    let result = handle.refresh().await;
    assert!(matches!(result, Err(EngineError::Disposed)));
    Ok(())
}
