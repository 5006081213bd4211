//! State file persistence
//!
//! The engine's [`State`] is wrapped in a small envelope that records when
//! and how often it was written. Every save keeps the previous file next to
//! the new one as `<name>.backup`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use declarative::State;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Envelope format written by this version
pub const FORMAT_VERSION: u32 = 1;

/// A state snapshot as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    /// Incremented on every save
    pub serial: u64,
    /// Last time the state was written
    pub last_updated: DateTime<Utc>,
    pub state: State,
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new(State::new())
    }
}

impl StateFile {
    pub fn new(state: State) -> Self {
        Self {
            version: FORMAT_VERSION,
            serial: 0,
            last_updated: Utc::now(),
            state,
        }
    }

    /// Load a state file, or an empty state if it does not exist yet
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("State file {} does not exist, starting empty", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let file: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        if file.version > FORMAT_VERSION {
            bail!(
                "State file {} has format version {}, this build supports up to {}",
                path.display(),
                file.version,
                FORMAT_VERSION
            );
        }

        log::debug!("Loaded state serial {} from {}", file.serial, path.display());
        Ok(file)
    }

    /// Replace the state and write it out
    pub fn save(&mut self, path: &Path, state: State) -> Result<()> {
        self.state = state;
        self.serial += 1;
        self.last_updated = Utc::now();
        self.version = FORMAT_VERSION;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        }

        if path.exists() {
            let backup = backup_path(path);
            fs::copy(path, &backup)
                .with_context(|| format!("Failed to back up state to {}", backup.display()))?;
        }

        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace state file: {}", path.display()))?;

        log::debug!("Saved state serial {} to {}", self.serial, path.display());
        Ok(())
    }
}

/// Where the previous state is kept
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}
