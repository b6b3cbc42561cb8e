//! Heating-episode learning.
//!
//! Every heating (or cooling) run the cycle engine starts and stops becomes a
//! candidate [`HeatingEvent`]. Episodes that are too short or too flat are
//! dropped as noise; the rest go to the event store and feed the per-zone
//! average heating rate used for time-to-target prediction.

use crate::error::StoreError;
use crate::interfaces::{EventStore, WeatherAccessor};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const MIN_EPISODE_MINUTES: f64 = 5.0;
pub const MIN_EPISODE_DELTA: f64 = 0.1;
/// Qualifying events needed before predictions are made.
pub const MIN_EVENTS_FOR_PREDICTION: usize = 20;
pub const PREDICTION_WINDOW_DAYS: i64 = 30;
/// Cooling events needed before the learned loss rate replaces the live trend.
pub const MIN_EVENTS_FOR_COOLING_RATE: usize = 3;

const OVERNIGHT_MINUTES: f64 = 480.0;
const PASSIVE_LOSS_FRACTION: f64 = 0.05;
const MAX_BOOST_OFFSET: f64 = 3.0;
const MIN_BOOST_OFFSET: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatingEvent {
    pub zone_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_temp: f64,
    pub end_temp: f64,
    pub outdoor_temp: Option<f64>,
}

impl HeatingEvent {
    pub fn duration_minutes(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 60_000.0
    }

    pub fn temperature_delta(&self) -> f64 {
        self.end_temp - self.start_temp
    }

    /// °C per minute; zero for a zero-length event.
    pub fn heating_rate(&self) -> f64 {
        let minutes = self.duration_minutes();
        if minutes <= 0.0 {
            return 0.0;
        }
        self.temperature_delta() / minutes
    }

    fn is_noise(&self) -> bool {
        self.duration_minutes() < MIN_EPISODE_MINUTES
            || self.temperature_delta().abs() < MIN_EPISODE_DELTA
    }
}

#[derive(Debug, Clone, Copy)]
struct Episode {
    start_time: DateTime<Utc>,
    start_temp: f64,
    outdoor_temp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningStats {
    pub zone_id: String,
    pub sample_count: usize,
    pub average_rate: Option<f64>,
    pub min_rate: Option<f64>,
    pub max_rate: Option<f64>,
    pub ready: bool,
}

pub struct LearningEngine {
    store: Arc<dyn EventStore>,
    weather: Arc<dyn WeatherAccessor>,
    episodes: Mutex<HashMap<String, Episode>>,
}

/// Multiplier on the learned rate for the current outdoor temperature.
pub fn outdoor_rate_factor(outdoor: Option<f64>) -> f64 {
    match outdoor {
        None => 1.0,
        Some(t) if t >= 15.0 => 1.1,
        Some(t) if t >= 5.0 => 1.0,
        Some(t) if t >= 0.0 => 0.9,
        Some(_) => 0.8,
    }
}

impl LearningEngine {
    pub fn new(store: Arc<dyn EventStore>, weather: Arc<dyn WeatherAccessor>) -> Self {
        LearningEngine {
            store,
            weather,
            episodes: Mutex::new(HashMap::new()),
        }
    }

    fn episodes(&self) -> MutexGuard<'_, HashMap<String, Episode>> {
        match self.episodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn start_episode(&self, zone_id: &str, current_temp: f64, now: DateTime<Utc>) {
        let episode = Episode {
            start_time: now,
            start_temp: current_temp,
            outdoor_temp: self.weather.current_outdoor_temperature(),
        };
        self.episodes().insert(zone_id.to_string(), episode);
        debug!("{}: episode started at {:.1}°C", zone_id, current_temp);
    }

    pub fn has_episode(&self, zone_id: &str) -> bool {
        self.episodes().contains_key(zone_id)
    }

    /// Closes the running episode. Returns the event if it was kept.
    pub async fn end_episode(
        &self,
        zone_id: &str,
        current_temp: f64,
        now: DateTime<Utc>,
    ) -> Option<HeatingEvent> {
        let episode = self.episodes().remove(zone_id)?;
        let event = HeatingEvent {
            zone_id: zone_id.to_string(),
            start_time: episode.start_time,
            end_time: now,
            start_temp: episode.start_temp,
            end_temp: current_temp,
            outdoor_temp: episode.outdoor_temp,
        };
        if event.is_noise() {
            debug!(
                "{}: discarding episode ({:.1} min, {:+.2}°C)",
                zone_id,
                event.duration_minutes(),
                event.temperature_delta()
            );
            return None;
        }
        if let Err(e) = self.store.record_event(zone_id, &event).await {
            warn!("{}: failed to persist heating event: {}", zone_id, e);
        } else {
            info!(
                "{}: learned {:.3}°C/min over {:.0} min",
                zone_id,
                event.heating_rate(),
                event.duration_minutes()
            );
        }
        Some(event)
    }

    /// Signed rates of every event inside the prediction window.
    async fn recent_rates(&self, zone_id: &str, now: DateTime<Utc>) -> Vec<f64> {
        let since = now - Duration::days(PREDICTION_WINDOW_DAYS);
        match self.store.query_events(zone_id, Some(since)).await {
            Ok(events) => events.iter().map(HeatingEvent::heating_rate).collect(),
            Err(e) => {
                warn!("{}: failed to load heating events: {}", zone_id, e);
                Vec::new()
            }
        }
    }

    /// Average heating rate over the prediction window, if enough data exists.
    pub async fn average_heating_rate(&self, zone_id: &str, now: DateTime<Utc>) -> Option<f64> {
        let rates: Vec<f64> = self
            .recent_rates(zone_id, now)
            .await
            .into_iter()
            .filter(|r| *r > 0.0)
            .collect();
        if rates.len() < MIN_EVENTS_FOR_PREDICTION {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Average speed of the zone's cooling episodes in °C per minute,
    /// reported as a positive number.
    pub async fn average_cooling_rate(&self, zone_id: &str, now: DateTime<Utc>) -> Option<f64> {
        let rates: Vec<f64> = self
            .recent_rates(zone_id, now)
            .await
            .into_iter()
            .filter(|r| *r < 0.0)
            .map(f64::abs)
            .collect();
        if rates.len() < MIN_EVENTS_FOR_COOLING_RATE {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }

    /// Minutes to heat from `current_temp` to `target_temp`.
    ///
    /// `Some(0)` when already there, `None` while data is insufficient.
    pub async fn predict_heating_time(
        &self,
        zone_id: &str,
        current_temp: f64,
        target_temp: f64,
        now: DateTime<Utc>,
    ) -> Option<u32> {
        if current_temp >= target_temp {
            return Some(0);
        }
        let rate = self.average_heating_rate(zone_id, now).await?;
        let adjusted = rate * outdoor_rate_factor(self.weather.current_outdoor_temperature());
        if adjusted <= 0.0 {
            return None;
        }
        Some(((target_temp - current_temp) / adjusted).ceil() as u32)
    }

    /// Expected overnight loss to pre-compensate, in °C.
    pub async fn predict_boost_offset(&self, zone_id: &str, now: DateTime<Utc>) -> Option<f64> {
        let rate = self.average_heating_rate(zone_id, now).await?;
        let mut offset = rate * OVERNIGHT_MINUTES * PASSIVE_LOSS_FRACTION;
        if let Some(outdoor) = self.weather.current_outdoor_temperature() {
            if outdoor < 10.0 {
                offset *= (1.0 + (10.0 - outdoor) / 20.0).min(1.5);
            }
        }
        let offset = offset.min(MAX_BOOST_OFFSET);
        if offset < MIN_BOOST_OFFSET {
            return None;
        }
        Some((offset * 10.0).round() / 10.0)
    }

    pub async fn statistics(&self, zone_id: &str) -> Result<LearningStats, StoreError> {
        let events = self.store.query_events(zone_id, None).await?;
        let rates: Vec<f64> = events
            .iter()
            .map(HeatingEvent::heating_rate)
            .filter(|r| *r > 0.0)
            .collect();
        let average_rate = if rates.is_empty() {
            None
        } else {
            Some(rates.iter().sum::<f64>() / rates.len() as f64)
        };
        Ok(LearningStats {
            zone_id: zone_id.to_string(),
            sample_count: rates.len(),
            average_rate,
            min_rate: rates.iter().copied().reduce(f64::min),
            max_rate: rates.iter().copied().reduce(f64::max),
            ready: rates.len() >= MIN_EVENTS_FOR_PREDICTION,
        })
    }
}

/// Event store kept in memory; used when no persistent store is configured.
#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<HashMap<String, Vec<HeatingEvent>>>,
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn record_event(&self, zone_id: &str, event: &HeatingEvent) -> Result<(), StoreError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::NotFound("event store lock".into()))?;
        let list = events.entry(zone_id.to_string()).or_default();
        list.push(event.clone());
        list.sort_by_key(|e| e.start_time);
        Ok(())
    }

    async fn query_events(
        &self,
        zone_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HeatingEvent>, StoreError> {
        let events = self
            .events
            .lock()
            .map_err(|_| StoreError::NotFound("event store lock".into()))?;
        Ok(events
            .get(zone_id)
            .map(|list| {
                list.iter()
                    .filter(|e| since.map_or(true, |s| e.start_time >= s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{seed_events, FixedWeather};
    use super::*;
    use crate::interfaces::NoWeather;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 7, 0, 0).unwrap()
    }

    fn engine(store: Arc<MemoryEventStore>, outdoor: Option<f64>) -> LearningEngine {
        LearningEngine::new(store, Arc::new(FixedWeather(outdoor)))
    }

    #[tokio::test]
    async fn short_flat_episode_is_discarded() {
        let store = Arc::new(MemoryEventStore::default());
        let le = engine(store.clone(), None);
        le.start_episode("z", 20.0, now());
        let event = le.end_episode("z", 20.05, now() + Duration::minutes(3)).await;
        assert!(event.is_none());
        assert!(store.query_events("z", None).await.unwrap().is_empty());
        assert!(!le.has_episode("z"));
    }

    #[tokio::test]
    async fn ten_minute_episode_is_kept() -> anyhow::Result<()> {
        let store = Arc::new(MemoryEventStore::default());
        let le = engine(store.clone(), Some(4.0));
        le.start_episode("z", 18.0, now());
        let event = le
            .end_episode("z", 20.0, now() + Duration::minutes(10))
            .await
            .unwrap();
        assert!((event.heating_rate() - 0.2).abs() < 1e-9);
        assert_eq!(event.outdoor_temp, Some(4.0));
        assert_eq!(store.query_events("z", None).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn end_without_start_is_ignored() {
        let le = engine(Arc::new(MemoryEventStore::default()), None);
        assert!(le.end_episode("z", 21.0, now()).await.is_none());
    }

    #[test]
    fn zero_length_event_has_zero_rate() {
        let event = HeatingEvent {
            zone_id: "z".into(),
            start_time: now(),
            end_time: now(),
            start_temp: 18.0,
            end_temp: 19.0,
            outdoor_temp: None,
        };
        assert_eq!(event.heating_rate(), 0.0);
    }

    #[tokio::test]
    async fn prediction_needs_twenty_events() {
        let store = Arc::new(MemoryEventStore::default());
        seed_events(&store, "z", 19, 64, 1.0, now()).await;
        let le = engine(store.clone(), None);
        assert_eq!(le.predict_heating_time("z", 19.0, 20.0, now()).await, None);
        assert_eq!(le.predict_heating_time("z", 20.0, 20.0, now()).await, Some(0));

        seed_events(&store, "other", 25, 64, 1.0, now()).await;
        assert_eq!(le.predict_heating_time("other", 19.0, 20.0, now()).await, Some(64));
    }

    #[tokio::test]
    async fn old_events_do_not_count() {
        let store = Arc::new(MemoryEventStore::default());
        seed_events(&store, "z", 25, 64, 1.0, now() - Duration::days(40)).await;
        let le = engine(store, None);
        assert_eq!(le.average_heating_rate("z", now()).await, None);
    }

    #[tokio::test]
    async fn outdoor_temperature_scales_prediction() {
        let store = Arc::new(MemoryEventStore::default());
        // 0.125 °C/min
        seed_events(&store, "z", 20, 8, 1.0, now()).await;
        let mild = engine(store.clone(), Some(8.0));
        assert_eq!(mild.predict_heating_time("z", 18.5, 20.0, now()).await, Some(12));
        let cold = engine(store.clone(), Some(-5.0));
        assert_eq!(cold.predict_heating_time("z", 18.5, 20.0, now()).await, Some(15));
        let warm = engine(store, Some(18.0));
        assert_eq!(warm.predict_heating_time("z", 18.5, 20.0, now()).await, Some(11));
    }

    #[test]
    fn outdoor_factor_bands() {
        assert_eq!(outdoor_rate_factor(Some(20.0)), 1.1);
        assert_eq!(outdoor_rate_factor(Some(15.0)), 1.1);
        assert_eq!(outdoor_rate_factor(Some(10.0)), 1.0);
        assert_eq!(outdoor_rate_factor(Some(2.0)), 0.9);
        assert_eq!(outdoor_rate_factor(Some(-3.0)), 0.8);
        assert_eq!(outdoor_rate_factor(None), 1.0);
    }

    #[tokio::test]
    async fn boost_offset_scales_and_caps() {
        let store = Arc::new(MemoryEventStore::default());
        // 0.05 °C/min -> 0.05 * 480 * 0.05 = 1.2
        seed_events(&store, "z", 20, 20, 1.0, now()).await;
        let mild = LearningEngine::new(store.clone(), Arc::new(NoWeather));
        assert_eq!(mild.predict_boost_offset("z", now()).await, Some(1.2));
        let freezing = engine(store.clone(), Some(-10.0));
        assert_eq!(freezing.predict_boost_offset("z", now()).await, Some(1.8));

        // 0.5 °C/min would give 6.0, capped at 3.0
        seed_events(&store, "fast", 20, 10, 5.0, now()).await;
        assert_eq!(mild.predict_boost_offset("fast", now()).await, Some(3.0));
    }

    #[tokio::test]
    async fn tiny_boost_offset_is_suppressed() {
        let store = Arc::new(MemoryEventStore::default());
        // 0.002 °C/min -> 0.048
        seed_events(&store, "z", 20, 100, 0.2, now()).await;
        let le = engine(store, None);
        assert_eq!(le.predict_boost_offset("z", now()).await, None);
    }

    #[tokio::test]
    async fn cooling_rate_comes_from_falling_events() {
        let store = Arc::new(MemoryEventStore::default());
        seed_events(&store, "z", 20, 10, 1.0, now()).await;
        let le = engine(store.clone(), None);
        assert_eq!(le.average_cooling_rate("z", now()).await, None);

        // -0.1 °C/min
        seed_events(&store, "z", 3, 10, -1.0, now()).await;
        let rate = le.average_cooling_rate("z", now()).await.unwrap();
        assert!((rate - 0.1).abs() < 1e-9, "rate {rate}");
        assert!((le.average_heating_rate("z", now()).await.unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn poisoned_lock_keeps_episodes_working() {
        let le = Arc::new(engine(Arc::new(MemoryEventStore::default()), None));
        let poisoner = le.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.episodes.lock().unwrap();
            panic!("poisoning the episode lock");
        })
        .join();
        assert!(le.episodes.is_poisoned());
        le.start_episode("z", 18.0, now());
        assert!(le.has_episode("z"));
    }

    #[tokio::test]
    async fn statistics_summarise_all_events() -> anyhow::Result<()> {
        let store = Arc::new(MemoryEventStore::default());
        seed_events(&store, "z", 3, 10, 1.0, now()).await;
        seed_events(&store, "z", 2, 20, 1.0, now() - Duration::days(60)).await;
        let le = engine(store, None);
        let stats = le.statistics("z").await?;
        assert_eq!(stats.sample_count, 5);
        assert!(!stats.ready);
        assert_eq!(stats.max_rate, Some(0.1));
        assert_eq!(stats.min_rate, Some(0.05));
        Ok(())
    }
}
