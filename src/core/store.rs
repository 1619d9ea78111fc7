//! Store handle for a Vigil governance workspace.
//!
//! A Store is the logical container for all governed state: agent records,
//! decision audit trail, dialectic sessions, calibration samples, and leases.
//! Everything under one workspace shares one data root.

use crate::core::error::VigilError;
use std::path::{Path, PathBuf};

/// Handle to a governance workspace rooted at `<workspace>/.vigil/data/`.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the data root directory.
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve the store for a workspace directory, creating the data root if
    /// needed.
    pub fn open(workspace: &Path) -> Result<Self, VigilError> {
        let root = workspace.join(".vigil").join("data");
        std::fs::create_dir_all(&root).map_err(VigilError::IoError)?;
        Ok(Self { root })
    }

    /// Walk upward from `start` looking for an existing `.vigil` directory.
    pub fn discover(start: &Path) -> Option<Self> {
        let mut dir = Some(start);
        while let Some(d) = dir {
            let candidate = d.join(".vigil").join("data");
            if candidate.is_dir() {
                return Some(Self { root: candidate });
            }
            dir = d.parent();
        }
        None
    }
}
