//! In-memory changer used by tests and `--mock` server runs. Holds a fixed
//! array of storage slots plus drive elements and simulates load/unload/
//! transfer latency instead of talking to real hardware.
//!
//! Each instance is configured with its own serial prefix and slot capacity
//! so multiple mock changers in one test run produce distinct, reproducible
//! cartridge serials rather than drawing from a shared global counter.

use std::thread::sleep;
use std::time::Duration;

use crate::changer::{ChangerDriver, DriveStatus, ElementStatus, MtxStatus};
use crate::error::MediaError;

#[derive(Clone, Copy, Default)]
pub struct MockTimings {
    pub load: Duration,
    pub unload: Duration,
}

pub struct MockChanger {
    /// `(home_slot, serial)` of whatever is loaded in each drive element, or
    /// `None` if the drive is empty. A cartridge is either here or in
    /// `slots`, never both -- loading moves it out of its slot, unloading
    /// moves it back.
    drives: Vec<Option<(u64, String)>>,
    slots: Vec<Option<String>>,
    timings: MockTimings,
}

impl MockChanger {
    /// Build a changer with `drive_count` drive elements and `slot_count`
    /// storage slots, prefilled with cartridges named `"{prefix}{slot:04}"`.
    pub fn new(prefix: &str, drive_count: u64, slot_count: u64) -> Self {
        Self::with_timings(prefix, drive_count, slot_count, MockTimings::default())
    }

    pub fn with_timings(
        prefix: &str,
        drive_count: u64,
        slot_count: u64,
        timings: MockTimings,
    ) -> Self {
        let slots = (0..slot_count)
            .map(|i| Some(format!("{prefix}{:04}", i + 1)))
            .collect();

        MockChanger {
            drives: vec![None; drive_count as usize],
            slots,
            timings,
        }
    }

    fn drive_index(&self, drive_slot: u64) -> Result<usize, MediaError> {
        let idx = drive_slot as usize;
        if idx >= self.drives.len() {
            return Err(MediaError::ChangerFailed(format!(
                "no such drive element {drive_slot}"
            )));
        }
        Ok(idx)
    }

    fn slot_index(&self, slot: u64) -> Result<usize, MediaError> {
        let idx = slot.checked_sub(1).map(|s| s as usize).ok_or_else(|| {
            MediaError::ChangerFailed("slot numbers are 1-based".to_string())
        })?;
        if idx >= self.slots.len() {
            return Err(MediaError::ChangerFailed(format!("no such slot {slot}")));
        }
        Ok(idx)
    }
}

impl ChangerDriver for MockChanger {
    fn status(&mut self) -> Result<MtxStatus, MediaError> {
        let drives = self
            .drives
            .iter()
            .map(|loaded| match loaded {
                None => DriveStatus {
                    loaded_slot: None,
                    status: ElementStatus::Empty,
                },
                Some((slot, serial)) => DriveStatus {
                    loaded_slot: Some(*slot),
                    status: ElementStatus::VolumeTag(serial.clone()),
                },
            })
            .collect();

        let slots = self
            .slots
            .iter()
            .map(|serial| {
                let status = match serial {
                    Some(s) => ElementStatus::VolumeTag(s.clone()),
                    None => ElementStatus::Empty,
                };
                (false, status)
            })
            .collect();

        Ok(MtxStatus { drives, slots })
    }

    fn load(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        let drive_idx = self.drive_index(drive_slot)?;
        let slot_idx = self.slot_index(slot)?;

        if self.drives[drive_idx].is_some() {
            return Err(MediaError::ChangerFailed(format!(
                "drive {drive_slot} already loaded"
            )));
        }
        if self.slots[slot_idx].is_none() {
            return Err(MediaError::ChangerFailed(format!("slot {slot} is empty")));
        }

        sleep(self.timings.load);

        let serial = self.slots[slot_idx].take().expect("checked Some above");
        self.drives[drive_idx] = Some((slot, serial));
        Ok(())
    }

    fn unload(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        let drive_idx = self.drive_index(drive_slot)?;
        let slot_idx = self.slot_index(slot)?;

        match &self.drives[drive_idx] {
            Some((loaded_slot, _)) if *loaded_slot == slot => {}
            _ => {
                return Err(MediaError::ChangerFailed(format!(
                    "drive {drive_slot} does not hold slot {slot}"
                )))
            }
        }
        if self.slots[slot_idx].is_some() {
            return Err(MediaError::ChangerFailed(format!(
                "target slot {slot} is not actually empty"
            )));
        }

        sleep(self.timings.unload);

        let (_, serial) = self.drives[drive_idx].take().expect("checked Some above");
        self.slots[slot_idx] = Some(serial);
        Ok(())
    }

    fn transfer(&mut self, from: u64, to: u64) -> Result<(), MediaError> {
        let from_idx = self.slot_index(from)?;
        let to_idx = self.slot_index(to)?;

        if self.slots[from_idx].is_none() {
            return Err(MediaError::ChangerFailed(format!("source slot {from} is empty")));
        }
        if self.slots[to_idx].is_some() {
            return Err(MediaError::ChangerFailed(format!("target slot {to} is occupied")));
        }

        self.slots[to_idx] = self.slots[from_idx].take();
        Ok(())
    }
}
