//! Avatar id → directory map.
//!
//! Stored as a flat JSON object, e.g. `{"anna": "anna_v2", "bob": "/srv/bob"}`.
//! Relative directories resolve against the avatars root.

use crate::error::{RenderError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct AvatarCatalog {
    root: PathBuf,
    path: Option<PathBuf>,
    entries: BTreeMap<String, PathBuf>,
}

impl AvatarCatalog {
    /// Catalog with no backing file.
    pub fn in_memory(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            path: None,
            entries: BTreeMap::new(),
        }
    }

    /// Load the catalog at `path`. A missing file yields an empty catalog.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Config` if the file exists but is not a JSON
    /// object of strings.
    pub fn load(path: &Path, root: &Path) -> Result<Self> {
        let mut catalog = Self {
            root: root.to_path_buf(),
            path: Some(path.to_path_buf()),
            entries: BTreeMap::new(),
        };
        catalog.reload()?;
        Ok(catalog)
    }

    /// Re-read the backing file, replacing all entries.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Config` on malformed JSON; entries are left
    /// untouched in that case.
    pub fn reload(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            warn!("avatar catalog {} not found, starting empty", path.display());
            self.entries.clear();
            return Ok(());
        }
        let raw = std::fs::read_to_string(path)?;
        let entries: BTreeMap<String, PathBuf> = serde_json::from_str(&raw).map_err(|e| {
            RenderError::Config(format!("malformed avatar catalog {}: {e}", path.display()))
        })?;
        info!("avatar catalog loaded: {} entries", entries.len());
        self.entries = entries;
        Ok(())
    }

    /// Write the catalog back to its file, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| RenderError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Register or replace an avatar. Returns the previous directory, if any.
    pub fn insert(&mut self, id: impl Into<String>, dir: impl Into<PathBuf>) -> Option<PathBuf> {
        self.entries.insert(id.into(), dir.into())
    }

    pub fn remove(&mut self, id: &str) -> Option<PathBuf> {
        self.entries.remove(id)
    }

    /// Resolve an id to its avatar directory.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::InvalidAvatarId` for ids not in the catalog.
    pub fn resolve(&self, id: &str) -> Result<PathBuf> {
        let dir = self
            .entries
            .get(id)
            .ok_or_else(|| RenderError::InvalidAvatarId(id.to_owned()))?;
        Ok(if dir.is_absolute() {
            dir.clone()
        } else {
            self.root.join(dir)
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
