//! Domain model shared by the cropwatch telemetry client.
//!
//! This crate intentionally exposes a small surface:
//! - sensor readings and their kind/status vocabulary
//! - alert thresholds and alert events as the platform broadcasts them
//! - lenient timestamp decoding for server-emitted instants

pub mod alert;
pub mod reading;
pub mod threshold;
pub mod timefmt;

pub use alert::{AlertKind, SensorAlert};
pub use reading::{InvalidReading, Reading, ReadingStatus, SensorKind, UnknownSensorKind};
pub use threshold::AlertThreshold;
