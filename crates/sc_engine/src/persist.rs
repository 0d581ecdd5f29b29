//! Session metadata persistence.
//!
//! Only `SessionMetadata` is written: ids, state, sequence counters and the
//! key fingerprint. Keys and DH state have no serde impls and never reach
//! disk. The file is replaced atomically (temp file in the same directory,
//! then rename).

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::error::PersistError;
use crate::session::SessionMetadata;

pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MetadataFile {
    version: u32,
    saved_at: DateTime<Utc>,
    sessions: Vec<SessionMetadata>,
}

pub fn save_metadata(path: &Path, sessions: &[SessionMetadata]) -> Result<(), PersistError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let file = MetadataFile {
        version: METADATA_VERSION,
        saved_at: Utc::now(),
        sessions: sessions.to_vec(),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, &file)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;

    info!(
        target: "sc_engine",
        event = "metadata_saved",
        path = %path.display(),
        sessions = sessions.len(),
    );
    Ok(())
}

pub fn load_metadata(path: &Path) -> Result<Vec<SessionMetadata>, PersistError> {
    let raw = std::fs::read(path)?;
    let file: MetadataFile = serde_json::from_slice(&raw)?;
    if file.version != METADATA_VERSION {
        return Err(PersistError::UnsupportedVersion(file.version));
    }
    Ok(file.sessions)
}
