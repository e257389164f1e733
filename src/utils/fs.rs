//! Best-effort file helpers
//!
//! Delete/move failures on the fixed clip paths never block the caller;
//! they are logged and the operation carries on.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Remove a file, logging anything other than "not found".
pub fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(error) if error.kind() == ErrorKind::NotFound => true,
        Err(error) => {
            tracing::warn!(path = %path.display(), "Failed to delete file: {error}");
            false
        }
    }
}

/// Replace `target` with `source`, falling back to copy+delete when a rename
/// is not possible. Returns whether `target` now holds the new content.
pub fn replace_quietly(source: &Path, target: &Path) -> bool {
    remove_quietly(target);

    match fs::rename(source, target) {
        Ok(()) => true,
        Err(rename_error) => match fs::copy(source, target) {
            Ok(_) => {
                remove_quietly(source);
                true
            }
            Err(copy_error) => {
                tracing::warn!(
                    source = %source.display(),
                    target = %target.display(),
                    "Failed to settle file. rename error: {rename_error}; copy error: {copy_error}"
                );
                false
            }
        },
    }
}
