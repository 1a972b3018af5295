//! In-memory telemetry state: latest-by-sensor, bounded history, counters.
//!
//! The store is owned exclusively by the supervisor task; consumers only
//! ever see cloned snapshots. Every accepted reading mutates the maps,
//! bumps the generation counter and persists both snapshots best-effort —
//! storage failures are logged and never roll back the live view.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use tracing::{debug, warn};

use cropwatch_core::{AlertThreshold, Reading, SensorKind};

use crate::cache::SnapshotStore;
use crate::identity::CacheScope;
use crate::ownership::apply_ownership;
use crate::synth::HistorySynthesizer;

/// Default bound on the in-memory history buffer.
pub const HISTORY_CAPACITY: usize = 500;

/// What `ingest` did with a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { backfilled: bool },
    RejectedOwnership,
    RejectedInvalid,
}

/// The engine's mutable state for one identity.
pub struct TelemetryStore {
    scope: CacheScope,
    snapshots: SnapshotStore,
    synthesizer: HistorySynthesizer<StdRng>,
    simulate_noise: bool,
    capacity: usize,
    latest: HashMap<String, Reading>,
    history: VecDeque<Reading>,
    counts: HashMap<SensorKind, usize>,
    thresholds: HashMap<SensorKind, AlertThreshold>,
    generation: u64,
}

impl TelemetryStore {
    /// Open the store for an identity, rehydrating persisted snapshots.
    pub fn open(
        scope: CacheScope,
        snapshots: SnapshotStore,
        synthesizer: HistorySynthesizer<StdRng>,
        capacity: usize,
        simulate_noise: bool,
    ) -> Self {
        let mut store = Self {
            scope,
            snapshots,
            synthesizer,
            simulate_noise,
            capacity,
            latest: HashMap::new(),
            history: VecDeque::new(),
            counts: HashMap::new(),
            thresholds: HashMap::new(),
            generation: 0,
        };
        store.rehydrate();
        store
    }

    pub fn scope(&self) -> CacheScope {
        self.scope
    }

    /// Monotonic change counter; bumped on every mutation of the live view.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn latest(&self) -> &HashMap<String, Reading> {
        &self.latest
    }

    pub fn history(&self) -> impl Iterator<Item = &Reading> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn counts(&self) -> &HashMap<SensorKind, usize> {
        &self.counts
    }

    pub fn thresholds(&self) -> &HashMap<SensorKind, AlertThreshold> {
        &self.thresholds
    }

    /// History of one sensor, oldest first.
    pub fn sensor_history(&self, sensor_id: &str) -> Vec<Reading> {
        self.history
            .iter()
            .filter(|reading| reading.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    /// Run one pushed reading through validation, ownership filtering,
    /// first-sighting backfill and the live-view mutation.
    pub fn ingest(&mut self, mut reading: Reading) -> IngestOutcome {
        if let Err(error) = reading.validate() {
            debug!("dropping invalid reading: {}", error);
            return IngestOutcome::RejectedInvalid;
        }
        if !apply_ownership(&mut reading, self.scope.user_id()) {
            return IngestOutcome::RejectedOwnership;
        }

        let first_sighting = !self
            .history
            .iter()
            .any(|sample| sample.sensor_id == reading.sensor_id);
        if first_sighting {
            for point in self.synthesizer.backfill(&reading) {
                self.push_history(point);
            }
        } else if self.simulate_noise {
            reading.value = self.synthesizer.maybe_jitter(reading.value);
        }

        if let Some(threshold) = self.thresholds.get(&reading.kind) {
            reading.status = threshold.evaluate(reading.value);
        }

        self.push_history(reading.clone());
        self.latest.insert(reading.sensor_id.clone(), reading);
        self.recompute_counts();
        self.generation += 1;
        self.persist();

        IngestOutcome::Accepted {
            backfilled: first_sighting,
        }
    }

    /// Replace the live view with the snapshots of another identity.
    pub fn reset(&mut self, scope: CacheScope) {
        self.scope = scope;
        self.rehydrate();
    }

    /// Replace the threshold map and re-stamp every latest entry, so a
    /// stale status never survives a threshold edit.
    pub fn apply_thresholds(&mut self, thresholds: Vec<AlertThreshold>) {
        self.thresholds = thresholds
            .into_iter()
            .map(|threshold| (threshold.sensor_kind, threshold))
            .collect();
        for reading in self.latest.values_mut() {
            if let Some(threshold) = self.thresholds.get(&reading.kind) {
                reading.status = threshold.evaluate(reading.value);
            }
        }
        self.generation += 1;
        self.persist_latest();
    }

    fn rehydrate(&mut self) {
        self.latest = self.snapshots.load_latest(self.scope);
        self.history = self.snapshots.load_history(self.scope).into();
        self.thresholds.clear();
        self.recompute_counts();
        self.generation += 1;
    }

    fn push_history(&mut self, reading: Reading) {
        self.history.push_back(reading);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }

    fn recompute_counts(&mut self) {
        let mut sensors_by_kind: HashMap<SensorKind, HashSet<&str>> = HashMap::new();
        for reading in self.latest.values() {
            sensors_by_kind
                .entry(reading.kind)
                .or_default()
                .insert(reading.sensor_id.as_str());
        }
        self.counts = sensors_by_kind
            .into_iter()
            .map(|(kind, sensors)| (kind, sensors.len()))
            .collect();
    }

    fn persist(&self) {
        self.persist_latest();
        // Synthetic backfill is a presentation affordance; only measured
        // samples are durable.
        let durable: Vec<Reading> = self
            .history
            .iter()
            .filter(|reading| !reading.is_synthetic())
            .cloned()
            .collect();
        if let Err(error) = self.snapshots.save_history(self.scope, &durable) {
            warn!("history snapshot write failed: {}", error);
        }
    }

    fn persist_latest(&self) {
        if let Err(error) = self.snapshots.save_latest(self.scope, &self.latest) {
            warn!("latest snapshot write failed: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use cropwatch_core::ReadingStatus;

    use super::*;

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
                .unwrap_or_default()
                + Duration::seconds(id),
            metadata: None,
            owner_id: None,
        }
    }

    fn store_at(dir: &std::path::Path, scope: CacheScope) -> TelemetryStore {
        TelemetryStore::open(
            scope,
            SnapshotStore::open(dir.to_path_buf()),
            HistorySynthesizer::seeded(7),
            HISTORY_CAPACITY,
            false,
        )
    }

    #[test]
    fn first_sighting_backfills_then_appends_the_real_point() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);

        let outcome = store.ingest(reading(1, "humidity_loc1", SensorKind::Humidity, 55.0));
        assert_eq!(outcome, IngestOutcome::Accepted { backfilled: true });

        let entry = store
            .latest()
            .get("humidity_loc1")
            .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
        assert_eq!(entry.value, 55.0);
        assert_eq!(store.history_len(), 6);

        let run = store.sensor_history("humidity_loc1");
        assert_eq!(run.len(), 6);
        assert!(run[..5].iter().all(Reading::is_synthetic));
        assert!(!run[5].is_synthetic());
        Ok(())
    }

    #[test]
    fn repeat_sightings_do_not_backfill() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);

        store.ingest(reading(1, "humidity_loc1", SensorKind::Humidity, 55.0));
        let outcome = store.ingest(reading(2, "humidity_loc1", SensorKind::Humidity, 56.0));
        assert_eq!(outcome, IngestOutcome::Accepted { backfilled: false });
        assert_eq!(store.history_len(), 7);

        // Noise simulation is off by default, so the value is untouched.
        let entry = store
            .latest()
            .get("humidity_loc1")
            .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
        assert_eq!(entry.value, 56.0);
        Ok(())
    }

    #[test]
    fn history_is_bounded_to_the_most_recent_500() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);

        // One synthetic run for the first sighting, then 600 real samples.
        for id in 1..=600 {
            let outcome = store.ingest(reading(id, "humidity_loc1", SensorKind::Humidity, 50.0));
            assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        }

        assert_eq!(store.history_len(), 500);
        let ids: Vec<i64> = store.history().map(|sample| sample.id).collect();
        assert_eq!(ids.first().copied(), Some(101));
        assert_eq!(ids.last().copied(), Some(600));
        Ok(())
    }

    #[test]
    fn foreign_readings_leave_the_view_untouched() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::User(42));

        let mut foreign = reading(1, "7_humidity_1", SensorKind::Humidity, 50.0);
        foreign.owner_id = Some(7);
        assert_eq!(store.ingest(foreign), IngestOutcome::RejectedOwnership);
        assert!(store.latest().is_empty());
        assert_eq!(store.history_len(), 0);
        assert!(store.counts().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_readings_are_rejected_before_mutation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);

        let mut sample = reading(1, "humidity_loc1", SensorKind::Humidity, f64::INFINITY);
        assert_eq!(store.ingest(sample.clone()), IngestOutcome::RejectedInvalid);

        sample.value = 50.0;
        sample.sensor_id.clear();
        assert_eq!(store.ingest(sample), IngestOutcome::RejectedInvalid);
        assert_eq!(store.history_len(), 0);
        Ok(())
    }

    #[test]
    fn counts_track_distinct_sensors_per_kind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);

        store.ingest(reading(1, "temp_a", SensorKind::Temperature, 20.0));
        store.ingest(reading(2, "temp_b", SensorKind::Temperature, 21.0));
        store.ingest(reading(3, "temp_a", SensorKind::Temperature, 22.0));
        store.ingest(reading(4, "ph_a", SensorKind::Ph, 6.8));

        assert_eq!(store.counts().get(&SensorKind::Temperature), Some(&2));
        assert_eq!(store.counts().get(&SensorKind::Ph), Some(&1));
        Ok(())
    }

    #[test]
    fn reset_switches_identity_without_bleed() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::User(42));
        store.ingest(reading(1, "42_humidity_1", SensorKind::Humidity, 55.0));
        assert!(!store.latest().is_empty());

        store.reset(CacheScope::User(7));
        assert!(store.latest().is_empty());
        assert_eq!(store.history_len(), 0);
        assert!(store.counts().is_empty());

        // The first user's snapshots are intact and reload wholesale.
        store.reset(CacheScope::User(42));
        assert_eq!(store.latest().len(), 1);
        assert_eq!(store.history_len(), 1);
        Ok(())
    }

    #[test]
    fn synthetic_points_are_not_persisted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);
        store.ingest(reading(1, "humidity_loc1", SensorKind::Humidity, 55.0));
        assert_eq!(store.history_len(), 6);

        store.reset(CacheScope::Guest);
        assert_eq!(store.history_len(), 1);
        let persisted = store.sensor_history("humidity_loc1");
        assert!(!persisted[0].is_synthetic());
        Ok(())
    }

    #[test]
    fn thresholds_restamp_latest_statuses() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);
        store.ingest(reading(1, "temp_a", SensorKind::Temperature, 40.0));

        store.apply_thresholds(vec![AlertThreshold {
            id: "1".to_string(),
            sensor_kind: SensorKind::Temperature,
            min: 13.0,
            max: 37.0,
            unit: "°C".to_string(),
            is_active: true,
        }]);

        let entry = store
            .latest()
            .get("temp_a")
            .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
        assert_eq!(entry.status, ReadingStatus::High);

        // Subsequent in-range samples go back to normal.
        store.ingest(reading(2, "temp_a", SensorKind::Temperature, 25.0));
        let entry = store
            .latest()
            .get("temp_a")
            .ok_or_else(|| anyhow::anyhow!("missing latest entry"))?;
        assert_eq!(entry.status, ReadingStatus::Normal);
        Ok(())
    }

    #[test]
    fn generation_bumps_on_every_mutation() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut store = store_at(temp.path(), CacheScope::Guest);
        let initial = store.generation();

        store.ingest(reading(1, "temp_a", SensorKind::Temperature, 20.0));
        let after_ingest = store.generation();
        assert!(after_ingest > initial);

        let mut foreign = reading(2, "7_temp_1", SensorKind::Temperature, 20.0);
        foreign.owner_id = Some(7);
        let mut scoped = store_at(temp.path(), CacheScope::User(42));
        let scoped_generation = scoped.generation();
        scoped.ingest(foreign);
        assert_eq!(scoped.generation(), scoped_generation);
        Ok(())
    }
}
