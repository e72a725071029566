//! Error taxonomy for the snapshot engine.
//!
//! Every public operation returns one of these kinds. Failures inside the
//! block-mapper and image-manager backends are wrapped with the device name
//! and the stage that failed, so a multi-layer mapping error still tells the
//! caller which leg of the stack broke.

use std::io;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SnapshotError {
    #[error("could not acquire state lock: {source}")]
    LockFailed {
        #[source]
        source: io::Error,
    },

    #[error("state store is corrupt: {reason}")]
    CorruptState { reason: String },

    #[error("operation {op} is not allowed in state {state}")]
    InvalidTransition { op: &'static str, state: String },

    #[error("{what} ({value}) is not a multiple of the sector size")]
    SizeUnaligned { what: &'static str, value: u64 },

    #[error("partition metadata is invalid: {reason}")]
    MetadataInvalid { reason: String },

    #[error("block mapper failed on {name} during {stage}: {source}")]
    MapperFailure {
        name: String,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("image manager failed on {name} during {stage}: {source}")]
    ImageFailure {
        name: String,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("mapping {name} exceeded its time budget")]
    Timeout { name: String },

    #[error("snapshot {name} has not finished merging")]
    NotMerged { name: String },

    #[error("booted back into the pre-update slot")]
    RollbackDetected,
}

impl SnapshotError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        SnapshotError::CorruptState {
            reason: reason.into(),
        }
    }

    pub(crate) fn metadata(reason: impl Into<String>) -> Self {
        SnapshotError::MetadataInvalid {
            reason: reason.into(),
        }
    }

    pub(crate) fn mapper(name: impl Into<String>, stage: &'static str, source: anyhow::Error) -> Self {
        SnapshotError::MapperFailure {
            name: name.into(),
            stage,
            source,
        }
    }

    pub(crate) fn image(name: impl Into<String>, stage: &'static str, source: anyhow::Error) -> Self {
        SnapshotError::ImageFailure {
            name: name.into(),
            stage,
            source,
        }
    }
}
