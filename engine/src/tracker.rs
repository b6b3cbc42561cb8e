//! Rolling per-zone temperature history and trend estimation.

use crate::config::TrackerConfig;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub target: Option<f64>,
}

pub struct TemperatureTracker {
    config: TrackerConfig,
    samples: RwLock<HashMap<String, VecDeque<TemperatureSample>>>,
}

impl TemperatureTracker {
    pub fn new(config: TrackerConfig) -> Self {
        TemperatureTracker {
            config,
            samples: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, VecDeque<TemperatureSample>>> {
        match self.samples.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, VecDeque<TemperatureSample>>> {
        match self.samples.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn window(&self) -> Duration {
        Duration::minutes(self.config.trend_window_minutes)
    }

    pub fn record_sample(
        &self,
        zone_id: &str,
        temperature: f64,
        target: Option<f64>,
        at: DateTime<Utc>,
    ) {
        let mut samples = self.write();
        let ring = samples
            .entry(zone_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.config.max_samples));
        while ring.len() >= self.config.max_samples {
            ring.pop_front();
        }
        ring.push_back(TemperatureSample {
            timestamp: at,
            temperature,
            target,
        });
    }

    /// Samples of `zone_id` no older than the trend window, oldest first.
    fn in_window(&self, zone_id: &str, now: DateTime<Utc>) -> Vec<TemperatureSample> {
        let samples = self.read();
        let cutoff = now - self.window();
        samples
            .get(zone_id)
            .map(|ring| {
                ring.iter()
                    .filter(|s| s.timestamp >= cutoff && s.timestamp <= now)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest(&self, zone_id: &str) -> Option<TemperatureSample> {
        self.read().get(zone_id).and_then(|ring| ring.back().copied())
    }

    pub fn sample_count(&self, zone_id: &str) -> usize {
        self.read().get(zone_id).map_or(0, |ring| ring.len())
    }

    /// Slope in °C/hour between the first and last sample inside the window.
    pub fn trend(&self, zone_id: &str, now: DateTime<Utc>) -> Option<f64> {
        let window = self.in_window(zone_id, now);
        if window.len() < 2 {
            return None;
        }
        let first = window.first()?;
        let last = window.last()?;
        let hours = (last.timestamp - first.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        if hours <= 0.0 {
            return None;
        }
        Some((last.temperature - first.temperature) / hours)
    }

    /// Minutes until the zone falls to `threshold` at the current trend.
    ///
    /// `Some(0.0)` when already at or below it; `None` when the trend is
    /// unknown or not falling.
    pub fn predict_time_to_temperature(
        &self,
        zone_id: &str,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let current = self.latest(zone_id)?.temperature;
        if current <= threshold {
            return Some(0.0);
        }
        let trend = self.trend(zone_id, now)?;
        if trend >= 0.0 {
            return None;
        }
        Some((current - threshold) / -trend * 60.0)
    }

    /// Advisory 0..1 score mixing in-window sample count and time coverage.
    pub fn confidence(&self, zone_id: &str, now: DateTime<Utc>) -> f64 {
        let window = self.in_window(zone_id, now);
        if window.is_empty() {
            return 0.0;
        }
        let full = self.config.full_confidence_samples.max(1) as f64;
        let count_score = (window.len() as f64 / full).min(1.0);
        let coverage = match (window.first(), window.last()) {
            (Some(first), Some(last)) => {
                let covered = (last.timestamp - first.timestamp).num_seconds() as f64;
                let span = self.window().num_seconds().max(1) as f64;
                (covered / span).clamp(0.0, 1.0)
            }
            _ => 0.0,
        };
        (count_score + coverage) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 6, 0, 0).unwrap()
    }

    fn tracker() -> TemperatureTracker {
        TemperatureTracker::new(TrackerConfig::default())
    }

    #[test]
    fn trend_from_first_and_last_sample() {
        let tr = tracker();
        tr.record_sample("z", 20.0, None, t0());
        tr.record_sample("z", 21.0, None, t0() + Duration::minutes(20));
        let trend = tr.trend("z", t0() + Duration::minutes(20)).unwrap();
        assert!((trend - 3.0).abs() < 1e-9, "trend {trend}");
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let tr = tracker();
        let now = t0() + Duration::minutes(60);
        tr.record_sample("z", 15.0, None, t0());
        tr.record_sample("z", 20.0, None, now - Duration::minutes(20));
        tr.record_sample("z", 21.0, None, now);
        let trend = tr.trend("z", now).unwrap();
        assert!((trend - 3.0).abs() < 1e-9, "trend {trend}");
    }

    #[test]
    fn trend_needs_two_samples_in_window() {
        let tr = tracker();
        tr.record_sample("z", 20.0, None, t0());
        assert_eq!(tr.trend("z", t0()), None);
        tr.record_sample("z", 20.5, None, t0() + Duration::minutes(45));
        assert_eq!(tr.trend("z", t0() + Duration::minutes(45)), None);
        assert_eq!(tr.trend("other", t0()), None);
    }

    #[test]
    fn ring_is_bounded() {
        let tr = TemperatureTracker::new(TrackerConfig {
            max_samples: 5,
            ..TrackerConfig::default()
        });
        for i in 0..12 {
            tr.record_sample("z", 20.0 + i as f64, None, t0() + Duration::minutes(i));
        }
        assert_eq!(tr.sample_count("z"), 5);
        assert_eq!(tr.latest("z").map(|s| s.temperature), Some(31.0));
    }

    #[test]
    fn time_to_threshold_on_falling_trend() {
        let tr = tracker();
        let now = t0() + Duration::minutes(30);
        tr.record_sample("z", 21.0, None, t0());
        tr.record_sample("z", 20.5, None, now);
        // -1.0 °C/h, 0.5 °C above threshold
        let minutes = tr.predict_time_to_temperature("z", 20.0, now).unwrap();
        assert!((minutes - 30.0).abs() < 1e-6);
        assert_eq!(tr.predict_time_to_temperature("z", 20.7, now), Some(0.0));
    }

    #[test]
    fn no_prediction_on_rising_trend() {
        let tr = tracker();
        let now = t0() + Duration::minutes(10);
        tr.record_sample("z", 20.0, None, t0());
        tr.record_sample("z", 20.2, None, now);
        assert_eq!(tr.predict_time_to_temperature("z", 19.5, now), None);
    }

    #[test]
    fn confidence_grows_with_samples_and_coverage() {
        let tr = tracker();
        assert_eq!(tr.confidence("z", t0()), 0.0);
        tr.record_sample("z", 20.0, None, t0());
        let low = tr.confidence("z", t0());
        for i in 1..=10 {
            tr.record_sample("z", 20.0, None, t0() + Duration::minutes(i * 3));
        }
        let high = tr.confidence("z", t0() + Duration::minutes(30));
        assert!(low < high);
        assert!((high - 1.0).abs() < 1e-9);
    }
}
