use std::fs;

use crate::common::error::DocumentError;

use super::document::{write_tom, TomTree};

/// Creates a fresh tom at `tom_id`: an XML document holding a single empty
/// `tom/root` subtree.
///
/// Returns `false` without touching the filesystem when a file already
/// exists at `tom_id`.
pub fn create_empty_tom(tom_id: &str) -> Result<bool, DocumentError> {
    if fs::metadata(tom_id).is_ok() {
        return Ok(false);
    }

    let mut tree = TomTree::new();
    tree.ensure("tom/root");
    write_tom(tom_id, &tree)?;
    Ok(true)
}

/// Deletes the tom at `tom_id`. Returns `false` when no file exists there.
pub fn remove_tom(tom_id: &str) -> Result<bool, DocumentError> {
    if fs::metadata(tom_id).is_err() {
        return Ok(false);
    }

    fs::remove_file(tom_id).map_err(|e| DocumentError::io(tom_id, e))?;
    Ok(true)
}
