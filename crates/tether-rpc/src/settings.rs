//! Per-app settings documents.
//!
//! Each app's settings live in one JSON file under the data directory and
//! behind one [`StateCell`], which publishes every effective change on the
//! topic `app-settings/<appId>`. Clients fetch `GetAppSettings` as the
//! snapshot half of a topic query.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_core::{JsonFileStore, Snapshot, StateCell, TetherError, TopicId, TopicRegistry};
use tokio::sync::Mutex;
use tracing::info;

/// One app's settings document.
pub type Settings = Map<String, Value>;

pub const SETTINGS_CATEGORY: &str = "app-settings";

pub struct SettingsStore {
    dir: PathBuf,
    registry: TopicRegistry,
    cells: Mutex<HashMap<String, Arc<StateCell<Settings>>>>,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>, registry: TopicRegistry) -> Self {
        Self {
            dir: dir.into(),
            registry,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Topic carrying `app_id`'s settings changes.
    pub fn topic_for(app_id: &str) -> TopicId {
        TopicId::new(SETTINGS_CATEGORY, app_id)
    }

    /// Open the cells of `app_ids` up front so their topics exist before
    /// anyone subscribes.
    pub async fn preload(&self, app_ids: &[String]) -> tether_core::Result<()> {
        for app_id in app_ids {
            self.cell(app_id).await?;
        }
        Ok(())
    }

    pub async fn snapshot(&self, app_id: &str) -> tether_core::Result<Snapshot<Settings>> {
        Ok(self.cell(app_id).await?.snapshot().await)
    }

    /// Replace `app_id`'s settings. Returns whether anything changed.
    pub async fn update(&self, app_id: &str, settings: Settings) -> tether_core::Result<bool> {
        self.cell(app_id)
            .await?
            .mutate(move |current| *current = settings)
            .await
    }

    async fn cell(&self, app_id: &str) -> tether_core::Result<Arc<StateCell<Settings>>> {
        validate_app_id(app_id)?;

        let mut cells = self.cells.lock().await;
        if let Some(cell) = cells.get(app_id) {
            return Ok(cell.clone());
        }

        let topic = self.registry.create_topic(Self::topic_for(app_id))?;
        let store = JsonFileStore::new(self.dir.join(format!("{}.json", app_id)));
        let cell = Arc::new(StateCell::open(store, topic, Settings::new()).await?);
        info!("Opened settings for {}", app_id);

        cells.insert(app_id.to_string(), cell.clone());
        Ok(cell)
    }
}

/// App ids double as file names, so keep them to a safe alphabet.
fn validate_app_id(app_id: &str) -> tether_core::Result<()> {
    let valid = !app_id.is_empty()
        && !app_id.starts_with('.')
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TetherError::Validation {
            field: "appId".to_string(),
            message: format!("'{}' is not a valid app id", app_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings(value: Value) -> Settings {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    #[tokio::test]
    async fn test_update_publishes_and_persists() {
        let dir = TempDir::new().unwrap();
        let registry = TopicRegistry::new();
        let store = SettingsStore::new(dir.path(), registry.clone());
        store.preload(&["notes".to_string()]).await.unwrap();

        let mut sub = registry
            .subscribe(&SettingsStore::topic_for("notes"))
            .unwrap();
        assert!(store
            .update("notes", settings(json!({"theme": "dark"})))
            .await
            .unwrap());
        assert!(!store
            .update("notes", settings(json!({"theme": "dark"})))
            .await
            .unwrap());

        let message = sub.recv().await.unwrap();
        assert_eq!(message.message_id, 1);
        assert_eq!(message.data, json!({"theme": "dark"}));

        let snapshot = store.snapshot("notes").await.unwrap();
        assert_eq!(snapshot.counter, 1);
        assert!(dir.path().join("notes.json").exists());
    }

    #[tokio::test]
    async fn test_settings_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = SettingsStore::new(dir.path(), TopicRegistry::new());
            store
                .update("notes", settings(json!({"fontSize": 14})))
                .await
                .unwrap();
        }

        let store = SettingsStore::new(dir.path(), TopicRegistry::new());
        let snapshot = store.snapshot("notes").await.unwrap();
        assert_eq!(snapshot.state, settings(json!({"fontSize": 14})));
        assert_eq!(snapshot.counter, 0);
    }

    #[tokio::test]
    async fn test_rejects_path_like_app_ids() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path(), TopicRegistry::new());
        for bad in ["", "../etc", ".hidden", "a/b"] {
            assert!(matches!(
                store.snapshot(bad).await,
                Err(TetherError::Validation { .. })
            ));
        }
    }
}
