//! Durable record of transfer ids that have already been evaluated.
//!
//! The document is a JSON object keyed by chain (`"tron"`, `"bsc"`), each value
//! an array of transfer ids. It is rewritten wholesale on every save through a
//! temporary sibling file and a rename, so a crash mid-write leaves either the
//! previous document or the new one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::StateError;
use crate::models::Chain;

/// Transfer ids already evaluated on one chain. Ids are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenSet {
    ids: BTreeSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns `true` if the id was not present before.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for SeenSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

pub type SeenState = HashMap<Chain, SeenSet>;

/// Total number of ids across chains.
pub fn total_seen(state: &SeenState) -> usize {
    state.values().map(SeenSet::len).sum()
}

/// JSON file holding the [`SeenState`] between runs.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the previous run's state.
    ///
    /// Never fails: a missing file is a first run, and an unreadable or corrupt
    /// one is logged, moved aside and replaced by an empty state. The latter
    /// means transfers may be baselined again, so it is logged loudly.
    pub fn load(&self) -> SeenState {
        match self.try_load() {
            Ok(Some(state)) => {
                for chain in Chain::ALL {
                    let count = state.get(&chain).map_or(0, SeenSet::len);
                    info!("[State] loaded {} {} transfer ids", count, chain);
                }
                state
            }
            Ok(None) => {
                info!("[State] no state file at {:?}, starting fresh", self.path);
                SeenState::new()
            }
            Err(e) => {
                error!("[State] discarding unusable state: {}", e);
                if let StateError::Corrupt { .. } = e {
                    self.quarantine();
                }
                SeenState::new()
            }
        }
    }

    pub fn try_load(&self) -> Result<Option<SeenState>, StateError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let document: HashMap<String, Vec<String>> =
            serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
                path: self.path.clone(),
                source,
            })?;

        let mut state = SeenState::new();
        for (key, ids) in document {
            match Chain::from_key(&key) {
                Some(chain) => {
                    state.entry(chain).or_default().ids.extend(ids);
                }
                None => warn!("[State] ignoring unknown chain key {:?}", key),
            }
        }
        Ok(Some(state))
    }

    /// Atomically replaces the state file with `state`.
    pub fn save(&self, state: &SeenState) -> Result<(), StateError> {
        let document: BTreeMap<&str, Vec<&str>> = Chain::ALL
            .into_iter()
            .map(|chain| {
                let ids = state
                    .get(&chain)
                    .map(|set| set.iter().collect())
                    .unwrap_or_default();
                (chain.key(), ids)
            })
            .collect();
        let contents = serde_json::to_string_pretty(&document)?;

        let tmp = self.tmp_path();
        self.write_synced(&tmp, contents.as_bytes())
            .and_then(|_| fs::rename(&tmp, &self.path))
            .map_err(|source| {
                let _ = fs::remove_file(&tmp);
                StateError::Io {
                    path: self.path.clone(),
                    source,
                }
            })
    }

    fn write_synced(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(bytes)?;
        file.sync_all()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn quarantine(&self) {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".corrupt");
        let target = self.path.with_file_name(name);
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!("[State] moved corrupt state to {:?}", target),
            Err(e) => warn!("[State] could not move corrupt state aside: {}", e),
        }
    }
}
