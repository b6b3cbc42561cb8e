//! File-backed persistence for zone/global settings and heating events.

use crate::config::GlobalConfig;
use crate::error::StoreError;
use crate::interfaces::{ConfigStore, EventStore};
use crate::learning::HeatingEvent;
use crate::zone::Zone;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const ZONES_FILE: &str = "zones.json";
pub const GLOBAL_FILE: &str = "global.json";
pub const EVENTS_EXTENSION: &str = "jsonl";

/// Writes `value` to a sibling temp file, then renames it over `path` so
/// readers never see a half-written document.
async fn write_atomically<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.new");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// `zones.json` and `global.json` in one directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonFileStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read(&self, name: &str) -> Result<Option<String>, StoreError> {
        match tokio::fs::read_to_string(self.dir.join(name)).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    /// A missing file is an empty installation, not an error.
    async fn load_zones(&self) -> Result<Vec<Zone>, StoreError> {
        match self.read(ZONES_FILE).await? {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save_zones(&self, zones: &[Zone]) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomically(&self.dir.join(ZONES_FILE), zones).await
    }

    async fn load_global(&self) -> Result<GlobalConfig, StoreError> {
        match self.read(GLOBAL_FILE).await? {
            Some(s) => Ok(serde_json::from_str(&s)?),
            None => Ok(GlobalConfig::default()),
        }
    }

    async fn save_global(&self, config: &GlobalConfig) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        write_atomically(&self.dir.join(GLOBAL_FILE), config).await
    }
}

/// Append-only event logs, one `<zone>.jsonl` file per zone with one JSON
/// object per line.
pub struct JsonLinesEventStore {
    dir: PathBuf,
    write: Mutex<()>,
}

impl JsonLinesEventStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonLinesEventStore {
            dir: dir.into(),
            write: Mutex::new(()),
        }
    }

    fn path_for(&self, zone_id: &str) -> PathBuf {
        let name: String = zone_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.{}", name, EVENTS_EXTENSION))
    }
}

#[async_trait]
impl EventStore for JsonLinesEventStore {
    async fn record_event(&self, zone_id: &str, event: &HeatingEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let _guard = self.write.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(zone_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query_events(
        &self,
        zone_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<HeatingEvent>, StoreError> {
        let content = match tokio::fs::read_to_string(self.path_for(zone_id)).await {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let event: HeatingEvent = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(e) => {
                    // A torn trailing line after a crash; skip it.
                    debug!("skipping unreadable event line: {}", e);
                    continue;
                }
            };
            if since.map_or(true, |s| event.start_time >= s) {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.start_time);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::HvacMode;
    use chrono::{Duration, TimeZone};

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("heating-store-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn missing_files_load_defaults() -> anyhow::Result<()> {
        let store = JsonFileStore::new(scratch_dir("empty"));
        assert!(store.load_zones().await?.is_empty());
        assert_eq!(store.load_global().await?, GlobalConfig::default());
        Ok(())
    }

    #[tokio::test]
    async fn zones_round_trip_without_runtime_state() -> anyhow::Result<()> {
        let dir = scratch_dir("zones");
        let store = JsonFileStore::new(&dir);
        let mut zone = Zone::new("kids", "Kids room");
        zone.hvac_mode = HvacMode::HeatCool;
        zone.hysteresis = Some(0.3);
        zone.trvs.push("trv.kids".into());
        zone.current_temperature = Some(19.2);
        store.save_zones(&[zone.clone()]).await?;

        let loaded = store.load_zones().await?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].hvac_mode, HvacMode::HeatCool);
        assert_eq!(loaded[0].hysteresis, Some(0.3));
        assert_eq!(loaded[0].current_temperature, None);
        assert!(!dir.join("zones.json.new").exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_global_is_an_error() -> anyhow::Result<()> {
        let dir = scratch_dir("corrupt");
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(GLOBAL_FILE), "{ not json")?;
        let store = JsonFileStore::new(&dir);
        assert!(matches!(store.load_global().await, Err(StoreError::Json(_))));
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[tokio::test]
    async fn event_log_filters_by_zone_and_time() -> anyhow::Result<()> {
        let dir = scratch_dir("events");
        let store = JsonLinesEventStore::new(dir.join("events"));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap();
        for (zone, hours) in [("a", 0), ("b", 1), ("a", 2), ("a", -30 * 24)] {
            let start = t0 + Duration::hours(hours);
            let event = HeatingEvent {
                zone_id: zone.into(),
                start_time: start,
                end_time: start + Duration::minutes(30),
                start_temp: 18.0,
                end_temp: 19.5,
                outdoor_temp: Some(3.0),
            };
            store.record_event(zone, &event).await?;
        }
        assert_eq!(store.query_events("a", None).await?.len(), 3);
        let recent = store.query_events("a", Some(t0 - Duration::days(1))).await?;
        assert_eq!(recent.len(), 2);
        assert!(recent[0].start_time < recent[1].start_time);
        assert!(store.query_events("c", None).await?.is_empty());
        assert!(dir.join("events").join("a.jsonl").exists());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
