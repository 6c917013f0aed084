use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const ACTIVE_ALERT_KEY: &str = "activeAlert";
pub const SETTINGS_KEY: &str = "settings";

pub const DEFAULT_CHECK_INTERVAL: u32 = 3;
pub const MIN_CHECK_INTERVAL: u32 = 1;
pub const MAX_CHECK_INTERVAL: u32 = 10;

/// Checks that `interval` (minutes) lies within the supported range.
pub fn validate_check_interval(interval: u32) -> Result<(), String> {
    if (MIN_CHECK_INTERVAL..=MAX_CHECK_INTERVAL).contains(&interval) {
        Ok(())
    } else {
        Err(format!(
            "check interval must be between {MIN_CHECK_INTERVAL} and {MAX_CHECK_INTERVAL} minutes, got {interval}"
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalAlert {
    pub goal: String,
    pub enabled: bool,
    /// Milliseconds since the Unix epoch.
    pub started_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherSettings {
    pub check_interval: u32,
    pub enabled: bool,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            enabled: false,
        }
    }
}

/// Durable key/value storage scoped to the watcher.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Stores every key in a single JSON object on disk.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous state intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read store {}", self.path.display()));
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }

        match serde_json::from_slice::<Value>(&bytes)
            .with_context(|| format!("store {} is not valid JSON", self.path.display()))?
        {
            Value::Object(map) => Ok(map),
            _ => bail!("store {} does not contain a JSON object", self.path.display()),
        }
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_vec_pretty(map).context("failed to serialize store")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace store {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(key.to_string(), value);
        self.write_all(&map).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        if map.remove(key).is_some() {
            self.write_all(&map).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: std::sync::Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .values
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))?
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store mutex poisoned"))?
            .remove(key);
        Ok(())
    }
}

/// Typed accessors for the goal alert and watcher settings records.
#[derive(Clone)]
pub struct SettingsStore {
    backend: Arc<dyn KeyValueStore>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub async fn get_active_alert(&self) -> Result<Option<GoalAlert>> {
        match self.backend.get(ACTIVE_ALERT_KEY).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .context("stored active alert is malformed"),
        }
    }

    pub async fn set_active_alert(&self, alert: &GoalAlert) -> Result<()> {
        let value = serde_json::to_value(alert).context("failed to encode active alert")?;
        self.backend.set(ACTIVE_ALERT_KEY, value).await
    }

    pub async fn clear_active_alert(&self) -> Result<()> {
        self.backend.remove(ACTIVE_ALERT_KEY).await
    }

    pub async fn get_watcher_settings(&self) -> Result<WatcherSettings> {
        match self.backend.get(SETTINGS_KEY).await? {
            None | Some(Value::Null) => Ok(WatcherSettings::default()),
            Some(value) => {
                serde_json::from_value(value).context("stored watcher settings are malformed")
            }
        }
    }

    pub async fn set_watcher_settings(&self, settings: WatcherSettings) -> Result<()> {
        let value = serde_json::to_value(settings).context("failed to encode watcher settings")?;
        self.backend.set(SETTINGS_KEY, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::{
        GoalAlert, JsonFileStore, SettingsStore, WatcherSettings, validate_check_interval,
    };
    use std::sync::Arc;
    use tempfile::tempdir;

    fn alert(goal: &str) -> GoalAlert {
        GoalAlert {
            goal: goal.to_string(),
            enabled: true,
            started_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn check_interval_bounds_are_inclusive() {
        assert!(validate_check_interval(1).is_ok());
        assert!(validate_check_interval(10).is_ok());
        let err = validate_check_interval(11).expect_err("above range");
        assert!(err.contains("between 1 and 10"));
        assert!(validate_check_interval(0).is_err());
    }

    #[tokio::test]
    async fn defaults_when_nothing_stored() {
        let store = SettingsStore::in_memory();
        assert_eq!(store.get_active_alert().await.expect("get"), None);
        assert_eq!(
            store.get_watcher_settings().await.expect("get"),
            WatcherSettings {
                check_interval: 3,
                enabled: false
            }
        );
    }

    #[tokio::test]
    async fn alert_set_and_clear() {
        let store = SettingsStore::in_memory();
        store
            .set_active_alert(&alert("Study React"))
            .await
            .expect("set");
        assert_eq!(
            store.get_active_alert().await.expect("get"),
            Some(alert("Study React"))
        );

        store.clear_active_alert().await.expect("clear");
        assert_eq!(store.get_active_alert().await.expect("get"), None);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("state.json");

        let store = SettingsStore::new(Arc::new(JsonFileStore::new(&path)));
        store
            .set_active_alert(&alert("Write thesis"))
            .await
            .expect("set alert");
        store
            .set_watcher_settings(WatcherSettings {
                check_interval: 7,
                enabled: true,
            })
            .await
            .expect("set settings");

        let reopened = SettingsStore::new(Arc::new(JsonFileStore::new(&path)));
        assert_eq!(
            reopened.get_active_alert().await.expect("get"),
            Some(alert("Write thesis"))
        );
        assert_eq!(
            reopened.get_watcher_settings().await.expect("get").check_interval,
            7
        );

        let raw = std::fs::read_to_string(&path).expect("read raw");
        assert!(raw.contains("\"activeAlert\""));
        assert!(raw.contains("\"checkInterval\": 7"));
        assert!(raw.contains("\"startedAt\""));
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        std::fs::write(&path, "{not json").expect("write");

        let store = SettingsStore::new(Arc::new(JsonFileStore::new(&path)));
        let err = store.get_active_alert().await.expect_err("should fail");
        assert!(format!("{err:#}").contains("not valid JSON"));
    }
}
