//! Synthetic history backfill and optional demo noise.
//!
//! A freshly-registered sensor must render a non-empty trend line before
//! five real samples have accumulated, so its first sighting fabricates a
//! short run of plausible past points. The RNG is injected so tests can
//! seed it.

use chrono::Duration;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use cropwatch_core::{Reading, ReadingStatus};

/// Number of fabricated points prepended on first sighting.
pub const BACKFILL_POINTS: i64 = 5;
/// Spacing between fabricated points.
const BACKFILL_STEP_MINUTES: i64 = 10;
/// Fabricated values stay within this fraction of the real value.
const BACKFILL_SPREAD: f64 = 0.15;
/// Fraction of repeat updates the demo-noise path perturbs.
const NOISE_CHANCE: f64 = 0.2;
/// Demo noise stays within this fraction of the real value.
const NOISE_SPREAD: f64 = 0.05;

/// Fabricates trend history and, when enabled, demo noise.
#[derive(Debug)]
pub struct HistorySynthesizer<R: Rng> {
    rng: R,
}

impl HistorySynthesizer<StdRng> {
    /// Entropy-seeded synthesizer for production use.
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// Deterministic synthesizer for tests and reproducible demos.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> HistorySynthesizer<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Fabricate the backfill run for a sensor's first sighting.
    ///
    /// Points are returned oldest first, spaced ten minutes apart behind
    /// the real reading, each tagged synthetic and clamped non-negative.
    pub fn backfill(&mut self, reading: &Reading) -> Vec<Reading> {
        let mut points = Vec::with_capacity(BACKFILL_POINTS as usize);
        for offset in (1..=BACKFILL_POINTS).rev() {
            let drift = self.rng.random_range(-BACKFILL_SPREAD..BACKFILL_SPREAD);
            let mut point = reading.clone();
            point.id = reading.id - offset;
            point.timestamp =
                reading.timestamp - Duration::minutes(BACKFILL_STEP_MINUTES * offset);
            point.value = (reading.value * (1.0 + drift)).max(0.0);
            point.status = ReadingStatus::Normal;
            point.mark_synthetic();
            points.push(point);
        }
        points
    }

    /// Perturb a repeat update's value on roughly every fifth call.
    ///
    /// Models sensor noise for demo installations; callers gate this behind
    /// an explicit configuration flag.
    pub fn maybe_jitter(&mut self, value: f64) -> f64 {
        if self.rng.random::<f64>() < NOISE_CHANCE {
            let drift = self.rng.random_range(-NOISE_SPREAD..NOISE_SPREAD);
            (value * (1.0 + drift)).max(0.0)
        } else {
            value
        }
    }
}
