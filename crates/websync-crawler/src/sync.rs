use std::fs;
use std::path::Path;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Download,
}

/// Download when the local copy is missing or strictly older than the remote
/// one. An unknown remote timestamp always downloads; ties keep the local
/// copy so repeated runs stay idempotent.
pub fn decide(remote: Option<SystemTime>, local: Option<SystemTime>) -> Decision {
    match (remote, local) {
        (_, None) => Decision::Download,
        (None, Some(_)) => Decision::Download,
        (Some(remote), Some(local)) if remote > local => Decision::Download,
        _ => Decision::Skip,
    }
}

/// Mtime of the mirrored file, `None` when it doesn't exist or its metadata
/// can't be read.
pub fn local_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
