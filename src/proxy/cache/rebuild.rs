use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::store::TEMP_SUFFIX;
use super::{CacheEntry, CacheKey};

#[derive(Debug, Default)]
pub(super) struct RebuildOutcome {
    pub entries: Vec<CacheEntry>,
    pub temp_removed: usize,
    pub foreign: usize,
}

/// Scans the top level of the cache directory. Leftover temp files are deleted, every other
/// regular file becomes an entry sized from its length and aged from its mtime.
/// Subdirectories are left alone.
pub(super) fn scan_cache_dir(dir: &Path) -> Result<RebuildOutcome> {
    let mut outcome = RebuildOutcome::default();
    let listing =
        fs::read_dir(dir).with_context(|| format!("failed to read cache dir {}", dir.display()))?;

    for dir_entry in listing {
        let dir_entry =
            dir_entry.with_context(|| format!("failed to read cache dir {}", dir.display()))?;
        let path = dir_entry.path();
        let file_type = dir_entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if !file_type.is_file() {
            continue;
        }

        let name = dir_entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(TEMP_SUFFIX) {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed leftover temp file");
                    outcome.temp_removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove temp file {}", path.display()));
                }
            }
            continue;
        }

        let metadata = dir_entry
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let last_used = metadata.modified().unwrap_or_else(|_| SystemTime::now());
        let key = match CacheKey::from_file_name(&name) {
            Some(key) => key,
            None => {
                warn!(
                    path = %path.display(),
                    "unrecognised file in cache dir; counting it toward the budget"
                );
                outcome.foreign += 1;
                CacheKey::foreign(&name)
            }
        };
        outcome
            .entries
            .push(CacheEntry::new(key, metadata.len(), last_used));
    }

    Ok(outcome)
}
