//! Error taxonomy for the ingestion server.
//!
//! Each failure domain gets its own `thiserror` enum, mirroring the way the
//! tape subsystem this crate is built from keeps `TapeLockError`, `BlockReadError`
//! and friends separate rather than funneling everything into one god-enum.
//! [`RequestError`] is the only variant that crosses the HTTP boundary; it
//! composes the domain errors into the exact status code the transport layer
//! must return.

use std::time::Duration;

use thiserror::Error;

/// Failures while admitting a stream onto one or more drives.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("timeout waiting to acquire drive after {0:?}")]
    AcquireTimeout(Duration),
    #[error("timeout waiting to acquire all drives of group '{group}' after {timeout:?}")]
    ParallelAcquireTimeout { group: String, timeout: Duration },
    #[error("no scratch volume available in library '{0}'")]
    NoScratchAvailable(String),
    #[error("unknown library '{0}'")]
    UnknownLibrary(String),
    #[error("unknown write group '{0}'")]
    UnknownWriteGroup(String),
    #[error("drive could not be made ready: {0}")]
    DriveUnavailable(String),
}

/// Failures originating from the physical media / drive layer.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("drive out of space")]
    OutOfSpace,
    #[error("media marked suspect: {0}")]
    SuspectMedia(String),
    #[error("failed to format volume: {0}")]
    FormatFailed(String),
    #[error("failed to mount LTFS filesystem: {0}")]
    MountFailed(String),
    #[error("changer operation failed: {0}")]
    ChangerFailed(String),
}

/// Failures from the persistent inventory/catalog backing stores.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("inventory unavailable: {0}")]
    Inventory(String),
    #[error("catalog unavailable: {0}")]
    Catalog(String),
}

/// A write that terminated after some prefix of the stream was durably
/// acknowledged. `written` is the cumulative number of bytes the client
/// should treat as safely stored.
#[derive(Error, Debug)]
#[error("short write: {written} bytes durably accepted before failure: {cause}")]
pub struct ShortWrite {
    pub written: u64,
    pub cause: String,
}

/// Top-level error returned to the transport layer. Each variant maps to
/// exactly one HTTP status code (see `api::error_response`).
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    ShortWrite(#[from] ShortWrite),
    #[error("not implemented")]
    NotImplemented,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Errors raised while loading the configuration file. Always fatal at
/// startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("parse error at byte {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("unknown chunkstore type '{0}' (expected \"kv\")")]
    UnknownChunkstoreType(String),
    #[error("unknown inventory type '{0}' (expected \"sqlite3\")")]
    UnknownInventoryType(String),
    #[error("unknown changer type '{0}' (expected \"mtx\" or \"mock\")")]
    UnknownChangerType(String),
    #[error("unknown drive type '{0}' (expected \"read\" or \"write\")")]
    UnknownDriveType(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
}
