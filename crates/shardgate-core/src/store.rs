//! Filesystem persistence for the [`TestMapping`] blob.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

use crate::domain::{Result, ShardgateError, TestMapping, MAPPING_SCHEMA_VERSION};

/// JSON-blob store for the test mapping.
///
/// Writes are atomic (temp file in the same directory, then rename), so a
/// reader never sees a half-written mapping.
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the mapping. Missing, unreadable or corrupt blobs are reported as
    /// [`ShardgateError::MappingUnavailable`].
    pub fn load(&self) -> Result<TestMapping> {
        let bytes = fs::read(&self.path).map_err(|e| {
            ShardgateError::MappingUnavailable(format!("read {}: {e}", self.path.display()))
        })?;
        let mapping: TestMapping = serde_json::from_slice(&bytes).map_err(|e| {
            ShardgateError::MappingUnavailable(format!("parse {}: {e}", self.path.display()))
        })?;
        if mapping.schema_version != MAPPING_SCHEMA_VERSION {
            return Err(ShardgateError::MappingUnavailable(format!(
                "unsupported mapping schema version {} (expected {})",
                mapping.schema_version, MAPPING_SCHEMA_VERSION
            )));
        }
        Ok(mapping)
    }

    /// Load the mapping, or `None` with a warning when it is unavailable.
    pub fn load_last_known(&self) -> Option<TestMapping> {
        match self.load() {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "no last known-good mapping");
                None
            }
        }
    }

    pub fn save(&self, mapping: &TestMapping) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_vec_pretty(mapping)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}
