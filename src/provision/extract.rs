//! Model archive extraction
//!
//! Archives ship their content under a single top-level directory (e.g.
//! `some-model-0.15/...`); entries are extracted with that segment
//! dropped, so the model lands directly in the model directory.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::{Error, Result};

/// Extract a model archive into `model_dir`.
///
/// Entries are streamed one at a time in archive order (directories are
/// assumed to be listed before their contents). Every destination path
/// is resolved and verified to be a descendant of the model directory
/// before any byte of the entry is written.
///
/// A failure leaves the model directory in a possibly-partial state;
/// re-provisioning overwrites it.
///
/// # Errors
///
/// Returns [`Error::PathTraversal`] for an entry that would land outside
/// the model directory, or another error when the archive is unreadable
/// or the filesystem fails.
pub fn extract_archive(archive_path: &Path, model_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    fs::create_dir_all(model_dir)?;
    let model_root = model_dir.canonicalize()?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;

        let Some(entry_path) = entry.enclosed_name() else {
            return Err(Error::PathTraversal(entry.name().to_string()));
        };

        // drop the archive's single top-level directory segment
        let stripped: PathBuf = entry_path.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let destination = model_dir.join(&stripped);

        verify_inside(&destination, &model_root, entry.name())?;

        if entry.is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            let mut output = File::create(&destination)?;
            io::copy(&mut entry, &mut output)?;
        }
    }

    tracing::debug!(path = %model_dir.display(), "archive extracted");
    Ok(())
}

/// Verify that `destination` resolves to a descendant of `root`,
/// creating its parent directories along the way.
fn verify_inside(destination: &Path, root: &Path, entry_name: &str) -> Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| Error::PathTraversal(entry_name.to_string()))?;
    fs::create_dir_all(parent)?;

    let resolved = parent.canonicalize().map_err(|e| {
        Error::Extraction(format!("cannot resolve {}: {e}", parent.display()))
    })?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(Error::PathTraversal(entry_name.to_string()))
    }
}
