use crate::tunables::{PolicyBounds, Tunables};
use log::{info, warn};
use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};

/// On-disk form: attribute name to value.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct SavedTunables {
    tunables: BTreeMap<String, u32>,
}

/// Keeps runtime tunable writes across restarts as JSON.
#[derive(Debug, Clone)]
pub struct TunableStore {
    path: PathBuf,
}

impl TunableStore {
    /// `<cache dir>/sublime-governor/tunables.json`, `/tmp` when there is
    /// no cache dir.
    pub fn new() -> Self {
        let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        path.push("sublime-governor");
        path.push("tunables.json");
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replays the saved values through the validating setters. A missing
    /// file is not an error; values that no longer validate are skipped.
    /// Returns how many values were applied.
    pub fn restore(&self, tunables: &mut Tunables, bounds: &PolicyBounds) -> Result<usize, IoError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let saved: SavedTunables = serde_json::from_str(&content)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("{}: {e}", self.path.display())))?;

        let entries: Vec<(&str, String)> = saved
            .tunables
            .iter()
            .map(|(name, value)| (name.as_str(), value.to_string()))
            .collect();
        let errors = tunables.store_all(&entries, bounds);
        for error in &errors {
            warn!("saved tunables: {error}, skipped");
        }
        let applied = entries.len() - errors.len();
        info!("{applied} saved tunable(s) restored from {}", self.path.display());
        Ok(applied)
    }

    pub fn save(&self, tunables: &Tunables) -> Result<(), IoError> {
        let saved = SavedTunables {
            tunables: tunables
                .entries()
                .into_iter()
                .filter_map(|(name, value)| value.parse().ok().map(|v| (name.to_string(), v)))
                .collect(),
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&saved)
            .map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
        std::fs::write(&self.path, json)
    }
}

impl Default for TunableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: PolicyBounds = PolicyBounds::new(300_000, 1_800_000);

    /// Store in a fresh directory that does not exist yet.
    fn temp_store(dir: &tempfile::TempDir) -> TunableStore {
        TunableStore::with_path(dir.path().join("sublime-governor").join("tunables.json"))
    }

    #[test]
    fn missing_file_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let mut t = Tunables::default();
        assert_eq!(store.restore(&mut t, &BOUNDS).unwrap(), 0);
        assert_eq!(t, Tunables::default());
    }

    #[test]
    fn saved_values_come_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        let mut t = Tunables::default();
        t.set_down_threshold(15).unwrap();
        t.set_freq_step(12);
        t.set_ignore_nice_load(1);
        store.save(&t).unwrap();

        let mut restored = Tunables::default();
        assert_eq!(store.restore(&mut restored, &BOUNDS).unwrap(), 13);
        assert_eq!(restored, t);
    }

    #[test]
    fn invalid_saved_values_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = temp_store(&dir);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{ "tunables": { "down_threshold": 3, "freq_step": 20, "bogus": 1 } }"#,
        )
        .unwrap();

        let mut t = Tunables::default();
        assert_eq!(store.restore(&mut t, &BOUNDS).unwrap(), 1);
        assert_eq!(t.freq_step(), 20);
        assert_eq!(t.down_threshold(), crate::constants::DEF_DOWN_THRESHOLD);

        std::fs::write(store.path(), "not json").unwrap();
        let err = store.restore(&mut t, &BOUNDS).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
