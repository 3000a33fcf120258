//! Model snapshots.
//!
//! Snapshots are opaque [`bincode`] blobs of any [`Serialize`] model. Gradients
//! are not saved.
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

/// Writes `model` to `dir/name`, creating `dir` if needed.
///
/// Returns the path of the snapshot.
pub fn save<T: Serialize>(model: &T, dir: impl AsRef<Path>, name: &str) -> Result<PathBuf> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory: {dir:?}"))?;
    let path = dir.join(name);
    let file = File::create(&path).with_context(|| format!("Failed to create snapshot: {path:?}"))?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, model)
        .with_context(|| format!("Failed to write snapshot: {path:?}"))?;
    writer
        .flush()
        .with_context(|| format!("Failed to write snapshot: {path:?}"))?;
    tracing::debug!(path = %path.display(), "Saved snapshot");
    Ok(path)
}

/// Reads a snapshot written by [`save()`].
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open snapshot: {path:?}"))?;
    bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("Failed to read snapshot: {path:?}"))
}
