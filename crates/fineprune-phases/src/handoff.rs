//! Pruning-configuration hand-off file.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use fineprune_core::Result;
use tempfile::NamedTempFile;

/// Persist `config` as a single JSON object `{layer: ratio}` at `path`.
///
/// The pruner never observes a half-written file: the object is written to a
/// temp file in the same directory and renamed over `path`.
pub fn write_pruning_config(path: &Path, config: &BTreeMap<String, f64>) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let bytes = serde_json::to_vec(config)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Read a hand-off file back.
pub fn read_pruning_config(path: &Path) -> Result<BTreeMap<String, f64>> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
