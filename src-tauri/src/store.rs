use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::settings::{self, Settings};

/// How the document on disk looked when it was loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Repaired,
    Created,
    RecoveredFromCorrupt,
}

/// Single owner of the settings file. Every mutation is written back before
/// the in-memory copy is replaced.
pub struct SettingsStore {
    path: PathBuf,
    defaults: Settings,
    current: Mutex<Settings>,
}

impl SettingsStore {
    /// Loads (and heals) the document at `path`. Never fails: when the file
    /// cannot be read or written the store runs on in-memory defaults.
    pub fn open(path: impl Into<PathBuf>, defaults: Settings) -> Self {
        let path = path.into();
        let (settings, outcome) = load_from_disk(&path, &defaults);
        info!(path = %path.display(), ?outcome, "settings loaded");
        Self {
            path,
            defaults,
            current: Mutex::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Settings {
        self.current.lock().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.current.lock())
    }

    pub fn save(&self, settings: Settings) -> Result<()> {
        let mut current = self.current.lock();
        write_atomic(&self.path, &settings)?;
        *current = settings;
        Ok(())
    }

    /// Runs `f` against a copy and persists it. The in-memory state only
    /// changes once the write succeeded, and nothing is written if `f` fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut Settings) -> Result<R>) -> Result<R> {
        let mut current = self.current.lock();
        let mut next = current.clone();
        let out = f(&mut next)?;
        write_atomic(&self.path, &next)?;
        *current = next;
        Ok(out)
    }

    /// Re-reads the file, discarding the in-memory copy.
    pub fn reload(&self) -> LoadOutcome {
        let (settings, outcome) = load_from_disk(&self.path, &self.defaults);
        *self.current.lock() = settings;
        outcome
    }
}

pub fn load_from_disk(path: &Path, defaults: &Settings) -> (Settings, LoadOutcome) {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file; writing defaults");
            persist_or_warn(path, defaults);
            return (defaults.clone(), LoadOutcome::Created);
        }
        Err(err) => {
            warn!(path = %path.display(), "failed to read settings file: {err}");
            return (defaults.clone(), LoadOutcome::RecoveredFromCorrupt);
        }
    };

    let raw = match serde_json::from_str::<Value>(&contents) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), "settings file is not valid JSON: {err}");
            set_aside_corrupt(path);
            persist_or_warn(path, defaults);
            return (defaults.clone(), LoadOutcome::RecoveredFromCorrupt);
        }
    };

    let healed = settings::heal(raw, defaults);
    if healed.repaired {
        persist_or_warn(path, &healed.settings);
        (healed.settings, LoadOutcome::Repaired)
    } else {
        (healed.settings, LoadOutcome::Loaded)
    }
}

/// Keeps a copy of an unparseable file next to the original.
fn set_aside_corrupt(path: &Path) {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    let target = path.with_file_name(name);
    match fs::rename(path, &target) {
        Ok(()) => warn!(target = %target.display(), "moved corrupt settings aside"),
        Err(err) => warn!("failed to move corrupt settings aside: {err}"),
    }
}

fn persist_or_warn(path: &Path, settings: &Settings) {
    if let Err(err) = write_atomic(path, settings) {
        warn!("failed to persist settings: {err:#}");
    }
}

/// Serializes `settings` to a sibling temp file, syncs it, then renames it
/// over `path`.
pub fn write_atomic(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!(
                "Failed to create settings directory at {}",
                parent.display()
            )
        })?;
    }

    let data = serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;
    let file_name = path
        .file_name()
        .context("Settings path has no file name")?
        .to_string_lossy();
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    tmp.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tmp.sync_all()
        .with_context(|| format!("Failed to sync {}", tmp_path.display()))?;
    drop(tmp);

    fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to write settings file at {}", path.display()))?;
    Ok(())
}
