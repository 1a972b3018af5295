//! Telemetry synchronization engine for the cropwatch dashboard client.
//!
//! The engine owns the push-channel lifecycle and a bounded, per-identity
//! live view of sensor telemetry:
//! - readings are filtered for ownership before they touch any state
//! - a freshly-seen sensor gets a short synthetic backfill so trend views
//!   render immediately
//! - latest-by-sensor and a 500-sample rolling history persist per
//!   identity and reload wholesale when the session user changes
//! - a supervisor task polls connection health and reconnects on its own
//!
//! Consumers hold an [`EngineHandle`] and read derived snapshots; all
//! mutation stays inside the supervisor task.

pub mod cache;
pub mod error;
pub mod facade;
pub mod identity;
pub mod ownership;
pub mod store;
pub mod supervisor;
pub mod synth;
mod transport;

pub use cache::{HISTORY_SNAPSHOT_CAP, SnapshotKind, SnapshotStore};
pub use error::{EngineError, Result};
pub use facade::QueryFacade;
pub use identity::{
    CacheScope, IdentityProvider, SharedIdentity, StaticIdentity, UserId, UserProfile,
    resolve_user_id,
};
pub use ownership::apply_ownership;
pub use store::{HISTORY_CAPACITY, IngestOutcome, TelemetryStore};
pub use supervisor::{Channel, EngineConfig, EngineHandle, SyncEngine};
pub use synth::{BACKFILL_POINTS, HistorySynthesizer};
