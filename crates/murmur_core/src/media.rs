//! Storing received attachments.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::info;

/// Make `name` safe to use as a single path component.
///
/// Separators and parent references are replaced so the result always
/// stays inside the directory it is joined onto.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Write an attachment from `peer` under `storage_root/<peer>/`.
///
/// Only the last component of the sender-supplied `filename` is used.
/// Returns the path written.
pub fn save_attachment(
    storage_root: &Path,
    peer: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let Some(base) = Path::new(filename).file_name() else {
        bail!("Attachment name {filename:?} does not name a file");
    };

    let dir = storage_root.join(sanitize_component(peer));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let path = dir.join(base);
    std::fs::write(&path, bytes)
        .with_context(|| format!("Failed to write attachment: {}", path.display()))?;
    info!("Saved {} bytes from {peer} to {}", bytes.len(), path.display());
    Ok(path)
}
