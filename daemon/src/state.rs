// Daemon state persistence (spec.md §4.15). Grounded on
// `original_source/ccbt/daemon/state_models.py` (field shape) and
// `state_manager.py` (atomic write + backup + version-migration policy),
// re-expressed with `serde_derive` structs and `rmp-serde` as the compact
// packed-map codec, matching the teacher's `store.rs`
// `#[derive(Deserialize, Serialize)]` idiom.
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde_derive::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{DaemonError, Result};

pub const STATE_VERSION: &str = "1.0";

fn now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentState {
    pub dht_enabled: bool,
    pub dht_nodes: usize,
    pub nat_enabled: bool,
    pub nat_mapped_ports: HashMap<String, u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentState {
    pub info_hash: String,
    pub name: String,
    pub status: String,
    pub progress: f64,
    pub output_dir: String,
    pub added_at: f64,
    pub paused: bool,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub num_peers: usize,
    pub total_size: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub torrent_file_path: Option<String>,
    pub magnet_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub started_at: f64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    pub global_download_rate: f64,
    pub global_upload_rate: f64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self { started_at: now(), total_downloaded: 0, total_uploaded: 0, global_download_rate: 0.0, global_upload_rate: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonState {
    pub version: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub torrents: HashMap<String, TorrentState>,
    pub session: SessionState,
    pub components: ComponentState,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Default for DaemonState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            created_at: now(),
            updated_at: now(),
            torrents: HashMap::new(),
            session: SessionState::default(),
            components: ComponentState::default(),
            metadata: HashMap::new(),
        }
    }
}

impl DaemonState {
    // Versions are compared as dotted numeric tuples, matching the
    // original's `[int(x) for x in version.split(".")]` comparison.
    fn parsed_version(&self) -> Option<Vec<u32>> {
        self.version.split('.').map(|part| part.parse().ok()).collect()
    }

    fn validate(&self) -> bool {
        self.torrents.values().all(|t| (0.0..=1.0).contains(&t.progress))
    }
}

pub struct StateManager {
    state_file: PathBuf,
    backup_file: PathBuf,
    json_export_file: PathBuf,
    lock: Mutex<()>,
}

impl StateManager {
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            state_file: state_dir.join("state.msgpack"),
            backup_file: state_dir.join("state.msgpack.backup"),
            json_export_file: state_dir.join("state.json.export"),
            lock: Mutex::new(()),
        })
    }

    // Writes `state` atomically (temp file + rename), keeping a `.backup`
    // copy of whatever was on disk before.
    pub async fn save(&self, state: &DaemonState) -> Result<()> {
        let _guard = self.lock.lock().await;

        if self.state_file.exists() {
            fs::copy(&self.state_file, &self.backup_file)?;
        }

        let bytes = rmp_serde::to_vec_named(state)?;
        let temp_file = self.state_file.with_extension("tmp");
        fs::write(&temp_file, bytes)?;
        fs::rename(&temp_file, &self.state_file)?;
        tracing::debug!("state saved to {}", self.state_file.display());
        Ok(())
    }

    // Tries the primary file, migrates forward if the on-disk version is
    // older, falls back to the backup on any read/validation failure, and
    // returns `None` (a fresh daemon) if neither exists.
    pub async fn load(&self) -> Result<Option<DaemonState>> {
        let _guard = self.lock.lock().await;

        if !self.state_file.exists() {
            return Ok(None);
        }

        match self.read_and_migrate(&self.state_file) {
            Ok(state) if state.validate() => Ok(Some(state)),
            Ok(_) | Err(_) if self.backup_file.exists() => {
                tracing::warn!("primary state invalid, falling back to backup");
                Ok(Some(self.read_and_migrate(&self.backup_file)?))
            }
            Err(e) => Err(e),
            Ok(_) => Ok(None),
        }
    }

    fn read_and_migrate(&self, path: &Path) -> Result<DaemonState> {
        let bytes = fs::read(path)?;
        let mut state: DaemonState = rmp_serde::from_slice(&bytes)?;

        let current = Self::version_parts(STATE_VERSION);
        match state.parsed_version() {
            Some(on_disk) if on_disk > current => {
                return Err(DaemonError::State(format!(
                    "state version {} is newer than daemon version {STATE_VERSION}; upgrade the daemon first",
                    state.version
                )));
            }
            Some(on_disk) if on_disk < current => {
                tracing::info!("migrating state from version {} to {STATE_VERSION}", state.version);
                state.version = STATE_VERSION.to_string();
                state.updated_at = now();
            }
            _ => {}
        }

        Ok(state)
    }

    fn version_parts(version: &str) -> Vec<u32> {
        version.split('.').filter_map(|p| p.parse().ok()).collect()
    }

    // Dumps the current state to pretty JSON for operator inspection.
    pub async fn export_to_json(&self) -> Result<PathBuf> {
        let state = self.load().await?.ok_or_else(|| DaemonError::State("no state to export".to_string()))?;
        let json = serde_json::to_string_pretty(&state)?;
        fs::write(&self.json_export_file, json)?;
        Ok(self.json_export_file.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        let mut state = DaemonState::default();
        state.torrents.insert(
            "aabb".to_string(),
            TorrentState {
                info_hash: "aabb".to_string(),
                name: "test".to_string(),
                status: "downloading".to_string(),
                progress: 0.5,
                output_dir: "/tmp".to_string(),
                added_at: now(),
                paused: false,
                download_rate: 0.0,
                upload_rate: 0.0,
                num_peers: 0,
                total_size: 0,
                downloaded: 0,
                uploaded: 0,
                torrent_file_path: None,
                magnet_uri: None,
            },
        );

        manager.save(&state).await.unwrap();
        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.torrents.len(), 1);
    }

    #[tokio::test]
    async fn load_with_no_state_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        assert!(manager.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn falls_back_to_backup_when_primary_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        manager.save(&DaemonState::default()).await.unwrap();
        manager.save(&DaemonState::default()).await.unwrap();

        fs::write(dir.path().join("state.msgpack"), b"not valid msgpack").unwrap();
        assert!(manager.load().await.unwrap().is_some());
    }

    #[test]
    fn newer_on_disk_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(dir.path()).unwrap();
        let mut state = DaemonState::default();
        state.version = "99.0".to_string();
        assert!(manager.read_and_migrate_for_test(&state).is_err());
    }

    impl StateManager {
        fn read_and_migrate_for_test(&self, state: &DaemonState) -> Result<DaemonState> {
            let bytes = rmp_serde::to_vec_named(state)?;
            let path = self.state_file.with_extension("test");
            fs::write(&path, bytes)?;
            let result = self.read_and_migrate(&path);
            let _ = fs::remove_file(&path);
            result
        }
    }
}
