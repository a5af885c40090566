use crate::devices::intc::IntcSnapshot;
use crate::devices::uart::UartSnapshot;
use crate::ptimer::PtimerSnapshot;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// Register-visible state of the fixed peripherals.
///
/// Raw devices are not captured; their state lives inside the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocSnapshot {
    pub version: String,
    pub intc: IntcSnapshot,
    pub timer: PtimerSnapshot,
    pub uart: UartSnapshot,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

impl SocSnapshot {
    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snap: Self = bincode::deserialize(bytes)?;
        snap.check_version()?;
        Ok(snap)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        log::info!("[Snapshot] saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let reader = BufReader::new(File::open(path)?);
        let snap: Self = bincode::deserialize_from(reader)?;
        snap.check_version()?;
        log::info!("[Snapshot] loaded from {}", path.display());
        Ok(snap)
    }
}
