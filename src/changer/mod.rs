//! Media changer abstraction: serialized status/load/unload/transfer against
//! one robotic changer, with an external-subprocess (`mtx`) implementation
//! and an in-memory mock for tests.

pub mod mock;
pub mod mtx;

use std::sync::Mutex;

use crate::error::MediaError;

/// Status of one changer element (a drive or a storage slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementStatus {
    Empty,
    Full,
    VolumeTag(String),
}

/// Status of one drive element inside the changer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveStatus {
    pub loaded_slot: Option<u64>,
    pub status: ElementStatus,
}

/// Full changer status: every drive element and every storage slot, in
/// element-number order. `slots[i].0` marks an import/export ("mail") slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MtxStatus {
    pub drives: Vec<DriveStatus>,
    pub slots: Vec<(bool, ElementStatus)>,
}

/// One robotic changer operation implementation. All methods are expected to
/// take as long as the physical (or simulated) operation does; callers never
/// invoke two of these concurrently against the same changer -- see
/// [`Changer`].
pub trait ChangerDriver: Send {
    fn status(&mut self) -> Result<MtxStatus, MediaError>;
    fn load(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError>;
    fn unload(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError>;
    fn transfer(&mut self, from: u64, to: u64) -> Result<(), MediaError>;
}

/// Serializes all operations against one changer behind a single mutex held
/// for the entire operation. Not re-entrant: a changer operation started
/// from inside another changer operation on the same changer deadlocks by
/// design, matching the "exactly one operation in flight" invariant.
pub struct Changer {
    inner: Mutex<Box<dyn ChangerDriver>>,
}

impl Changer {
    pub fn new(driver: Box<dyn ChangerDriver>) -> Self {
        Changer {
            inner: Mutex::new(driver),
        }
    }

    pub fn status(&self) -> Result<MtxStatus, MediaError> {
        self.inner.lock().unwrap().status()
    }

    pub fn load(&self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        self.inner.lock().unwrap().load(slot, drive_slot)
    }

    pub fn unload(&self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        self.inner.lock().unwrap().unload(slot, drive_slot)
    }

    pub fn transfer(&self, from: u64, to: u64) -> Result<(), MediaError> {
        self.inner.lock().unwrap().transfer(from, to)
    }
}
