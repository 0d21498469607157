//! Per-session snapshot file: `<user_file_path>/<key>.json`

use std::path::{Path, PathBuf};
use tracing::debug;

use super::engine::PersistedState;
use crate::core::Result;

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: &Path, key: &str) -> Self {
        Self { path: dir.join(format!("{}.json", key)) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no snapshot was written yet.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write through a temp file and rename, so readers never see half a file.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::channel::tests::scratch_dir;
    use crate::sim::model::TradeData;

    #[test]
    fn test_missing_then_saved_then_loaded() {
        let dir = scratch_dir("store").join("users");
        let store = SnapshotStore::new(&dir, "sim_alice");
        assert!(store.load().unwrap().is_none());

        let state = PersistedState {
            data: TradeData::new("alice", "CNY", 500.0),
            last_seq_no: 12,
            transfer_seq: 3,
        };
        store.save(&state).unwrap();
        assert!(store.path().ends_with("sim_alice.json"));

        let back = store.load().unwrap().unwrap();
        assert_eq!(back.last_seq_no, 12);
        assert_eq!(back.transfer_seq, 3);
        assert_eq!(back.data.account.static_balance, 500.0);
        assert_eq!(back.data.user_id, "alice");
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = scratch_dir("store");
        std::fs::write(dir.join("k.json"), "{not json").unwrap();
        assert!(SnapshotStore::new(&dir, "k").load().is_err());
    }
}
