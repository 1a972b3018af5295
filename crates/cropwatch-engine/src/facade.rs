//! Derived read-only views over the latest-by-sensor map.
//!
//! Derivations are memoized on the store's generation counter so a burst
//! of queries between two mutations never recomputes, and consumers
//! polling an idle engine see stable data without churn.

use std::collections::HashMap;

use cropwatch_core::{Reading, SensorKind};

use crate::store::TelemetryStore;

/// Memoized groupings of the latest readings.
#[derive(Debug, Default)]
pub struct QueryFacade {
    generation: Option<u64>,
    by_kind: HashMap<SensorKind, Vec<Reading>>,
    by_location: HashMap<String, Vec<Reading>>,
    #[cfg(test)]
    recomputes: usize,
}

impl QueryFacade {
    /// Bring the derived views up to date with the store, if it changed.
    pub fn refresh(&mut self, store: &TelemetryStore) {
        if self.generation == Some(store.generation()) {
            return;
        }

        self.by_kind.clear();
        self.by_location.clear();
        for reading in store.latest().values() {
            self.by_kind
                .entry(reading.kind)
                .or_default()
                .push(reading.clone());
            self.by_location
                .entry(reading.location_id.clone())
                .or_default()
                .push(reading.clone());
        }
        for group in self.by_kind.values_mut() {
            group.sort_by(|left, right| left.sensor_id.cmp(&right.sensor_id));
        }
        for group in self.by_location.values_mut() {
            group.sort_by(|left, right| left.sensor_id.cmp(&right.sensor_id));
        }

        self.generation = Some(store.generation());
        #[cfg(test)]
        {
            self.recomputes += 1;
        }
    }

    pub fn by_kind(&self) -> &HashMap<SensorKind, Vec<Reading>> {
        &self.by_kind
    }

    pub fn by_location(&self) -> &HashMap<String, Vec<Reading>> {
        &self.by_location
    }

    pub fn of_kind(&self, kind: SensorKind) -> &[Reading] {
        self.by_kind.get(&kind).map_or(&[], Vec::as_slice)
    }

    pub fn at_location(&self, location_id: &str) -> &[Reading] {
        self.by_location
            .get(location_id)
            .map_or(&[], Vec::as_slice)
    }

    #[cfg(test)]
    fn recompute_count(&self) -> usize {
        self.recomputes
    }
}
