// Snapshot files: one file per document holding the raw bytes of a
// full-state update. No header, no checksum — the file is exactly what
// `SharedDoc::encode_state` produced.

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::doc::SharedDoc;

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file exists but its bytes do not decode as a document update.
    /// Distinct from "missing" so callers can log possible data loss instead
    /// of silently starting the room empty.
    #[error("snapshot is corrupt")]
    Corrupt(#[source] anyhow::Error),
    #[error("snapshot i/o failed")]
    Io(#[from] io::Error),
}

/// Read and decode the snapshot at `path`. A missing file is `Ok(None)`.
pub fn load_snapshot(path: &Path) -> Result<Option<SharedDoc>, SnapshotError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(SnapshotError::Io(error)),
    };
    let doc = SharedDoc::from_state(&bytes).map_err(SnapshotError::Corrupt)?;
    Ok(Some(doc))
}

/// Overwrite the snapshot with the document's full current state.
pub fn write_snapshot(path: &Path, doc: &SharedDoc) -> io::Result<()> {
    std::fs::write(path, doc.encode_state())
}
