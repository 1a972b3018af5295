//! Single push-channel connection management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ChannelError, Result};
use crate::message::{ClientFrame, PushMessage, RequestTarget, decode_push_message};
use crate::subscription::TopicSubscription;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel connection configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    /// Minimum spacing between `request_data` frames of the same target;
    /// calls inside the window are coalesced rather than sent.
    pub request_min_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_min_interval: Duration::from_secs(5),
        }
    }
}

/// Credentials and group memberships presented at connect time.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub token: Option<String>,
    pub user_id: Option<i64>,
    /// Extra broadcast groups to join; the server always adds `sensor:all`
    /// and the caller's `user:<id>` group on its own.
    pub groups: Vec<String>,
}

/// Duplex channel connection to the telemetry server.
pub struct ChannelConnection {
    url: Url,
    options: ConnectOptions,
    config: ChannelConfig,
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    incoming_tx: mpsc::UnboundedSender<PushMessage>,
    incoming_rx: Arc<Mutex<mpsc::UnboundedReceiver<PushMessage>>>,
    subscriptions: Arc<Mutex<HashMap<String, TopicSubscription>>>,
    recv_task: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
    last_request: Arc<Mutex<HashMap<&'static str, Instant>>>,
}

impl ChannelConnection {
    /// Create a new connection with default config.
    pub fn new(url: &str, options: ConnectOptions) -> Result<Self> {
        Self::with_config(url, options, ChannelConfig::default())
    }

    /// Create a new connection with custom config.
    pub fn with_config(url: &str, options: ConnectOptions, config: ChannelConfig) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ChannelError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Ok(Self {
            url: parsed_url,
            options,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            incoming_tx,
            incoming_rx: Arc::new(Mutex::new(incoming_rx)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Arc::new(Mutex::new(None)),
            last_request: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Endpoint URL as string, without credentials.
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Whether the channel currently holds an open socket.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Connect and start the background receive loop.
    pub async fn connect(&self) -> Result<()> {
        let mut state_guard = self.state.write().await;
        if *state_guard == ConnectionState::Connected {
            return Err(ChannelError::AlreadyConnected);
        }
        *state_guard = ConnectionState::Connecting;
        drop(state_guard);

        let connect_url = connect_url(&self.url, &self.options);
        let connect_result = timeout(self.config.connect_timeout, connect_async(connect_url.as_str()))
            .await
            .map_err(|_| {
                ChannelError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                ))
            });
        let connect_result = match connect_result {
            Ok(inner) => inner.map_err(|error| ChannelError::WebSocket(error.to_string())),
            Err(error) => Err(error),
        };
        let (stream, _response) = match connect_result {
            Ok(ok) => ok,
            Err(error) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(error);
            }
        };

        let (writer, mut reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.state.write().await = ConnectionState::Connected;

        let incoming_tx = self.incoming_tx.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        let state = Arc::clone(&self.state);
        let endpoint = self.url.to_string();

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match decode_push_message(text.as_str()) {
                        Ok(Some(message)) => {
                            let subscription =
                                { subscriptions.lock().await.get(message.topic()).cloned() };
                            match subscription {
                                Some(subscription) => {
                                    if let Err(error) = subscription.deliver(message) {
                                        warn!(
                                            "subscription delivery error on {}: {}",
                                            endpoint, error
                                        );
                                    }
                                }
                                // Unclaimed topics fall through to recv().
                                None => {
                                    if incoming_tx.send(message).is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            debug!("dropping frame with unrecognized type from {}", endpoint);
                        }
                        Err(error) => {
                            warn!("protocol decode error on {}: {}", endpoint, error);
                        }
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", endpoint, payload.len());
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Err(error) => {
                        warn!("websocket read error on {}: {}", endpoint, error);
                        break;
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
        });

        *self.recv_task.lock().await = Some(task);
        Ok(())
    }

    /// Close the socket and stop background tasks. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!("close frame not delivered: {}", error);
        }

        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }

        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    /// Register local dispatch for a push topic.
    ///
    /// Registration survives reconnects; delivery resumes as soon as a new
    /// socket is up.
    pub async fn subscribe(&self, subscription: TopicSubscription) {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.topic.clone(), subscription);
    }

    /// Drop local dispatch for a push topic.
    pub async fn unsubscribe(&self, topic: &str) {
        self.subscriptions.lock().await.remove(topic);
    }

    /// Join extra broadcast groups on the live connection.
    pub async fn join_groups(&self, groups: Vec<String>) -> Result<()> {
        self.send_frame(&ClientFrame::Subscribe { groups }).await
    }

    /// Ask the server to regenerate and push sensor data.
    ///
    /// Returns `Ok(false)` when the call was coalesced by the throttle.
    pub async fn request_sensor_data(&self, manual: bool) -> Result<bool> {
        self.throttled_request(RequestTarget::SensorData { manual })
            .await
    }

    /// Ask the server for the caller's active alert thresholds.
    ///
    /// Returns `Ok(false)` when the call was coalesced by the throttle.
    pub async fn request_thresholds(&self) -> Result<bool> {
        self.throttled_request(RequestTarget::Thresholds).await
    }

    /// Send a keepalive ping; the server answers on the `pong` topic.
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(&ClientFrame::Ping).await
    }

    /// Receive the next push message that no topic subscription claimed.
    pub async fn recv(&self) -> Option<PushMessage> {
        self.incoming_rx.lock().await.recv().await
    }

    async fn throttled_request(&self, target: RequestTarget) -> Result<bool> {
        let now = Instant::now();
        {
            let mut last_request = self.last_request.lock().await;
            let last = last_request.get(target.as_str()).copied();
            if !request_window_open(last, now, self.config.request_min_interval) {
                debug!("coalescing throttled {} request", target.as_str());
                return Ok(false);
            }
            last_request.insert(target.as_str(), now);
        }
        self.send_frame(&ClientFrame::RequestData { target }).await?;
        Ok(true)
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        if self.state().await != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let text = serde_json::to_string(&frame.to_value())?;
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ChannelError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ChannelError::WebSocket(error.to_string()))
    }
}

/// Endpoint URL with credentials and group memberships as query parameters.
fn connect_url(base: &Url, options: &ConnectOptions) -> Url {
    let mut url = base.clone();
    if options.token.is_none() && options.user_id.is_none() && options.groups.is_empty() {
        return url;
    }
    {
        let mut query = url.query_pairs_mut();
        if let Some(token) = &options.token {
            query.append_pair("token", token);
        }
        if let Some(user_id) = options.user_id {
            query.append_pair("user_id", &user_id.to_string());
        }
        for group in &options.groups {
            query.append_pair("groups", group);
        }
    }
    url
}

/// Whether enough time has passed since the previous request of this target.
fn request_window_open(last: Option<Instant>, now: Instant, min_interval: Duration) -> bool {
    match last {
        Some(last) => now.duration_since(last) >= min_interval,
        None => true,
    }
}
