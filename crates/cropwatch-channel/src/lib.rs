//! Duplex push-channel transport for the cropwatch telemetry client.
//!
//! This crate intentionally exposes a small surface:
//! - a single WebSocket connection with reconnect-friendly lifecycle
//! - per-topic subscriptions over the typed frame envelope
//! - throttled data-refresh requests

pub mod connection;
pub mod error;
pub mod message;
pub mod subscription;

pub use connection::{ChannelConfig, ChannelConnection, ConnectOptions, ConnectionState};
pub use error::{ChannelError, Result};
pub use message::{
    ClientFrame, Envelope, PushMessage, RequestReceipt, RequestTarget, SystemNotice, WelcomeInfo,
    decode_push_message,
};
pub use subscription::{PushCallback, TopicSubscription};
