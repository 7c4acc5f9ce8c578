//! # Device Records
//!
//! One record per firmware device handle the host knows about: physical SAS
//! targets found through topology events and RAID volumes found through IR
//! configuration events. The slot a record occupies is the target number the
//! upper layers address it by.

use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    /// What a device record stands for
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u32 {
        /// Not exposed to the upper layers
        const HIDDEN = 0x0004;
        /// RAID volume
        const VOLUME = 0x0010;
        /// Member disk of a RAID volume
        const VOLUME_DISK = 0x0020;
        /// Hot spare
        const HOT_SPARE = 0x0040;
    }
}

/// One known device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Device {
    pub handle: u16,
    /// Target number; the preferred slot on insertion
    pub slot: u16,
    pub phy_num: u8,
    pub physical_port: u8,
    pub enclosure: u16,
    pub expander: u16,
    pub flags: DeviceFlags,
    /// Resync progress of a volume
    pub percent: u8,
}

/// Why an insertion was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// A record with the same handle exists
    Duplicate,
    /// No free slot at or above the preferred one
    Full,
}

/// Where the two kinds of target start in the slot space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetMap {
    /// First slot of physical disks; a phy number is added to it
    pub pd_id_start: u16,
    /// Slot of volume 0
    pub vd_id_low: u16,
}

/// Fixed-size table of device records, under one lock
pub struct DeviceTable {
    slots: Mutex<Vec<Option<Device>>>,
    map: Mutex<TargetMap>,
}

impl DeviceTable {
    pub fn new(max_devices: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; max_devices]),
            map: Mutex::new(TargetMap::default()),
        }
    }

    pub fn target_map(&self) -> TargetMap {
        *self.map.lock()
    }

    pub fn set_target_map(&self, map: TargetMap) {
        *self.map.lock() = map;
    }

    /// Volume record for volume number `volid`
    pub fn volume(&self, volid: u16) -> Option<Device> {
        let slot = self.target_map().vd_id_low.checked_add(volid)?;
        self.at_slot(slot)
            .filter(|d| d.flags.contains(DeviceFlags::VOLUME))
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Stores `dev` at the first free slot at or above `dev.slot`.
    ///
    /// Returns the slot it landed in.
    pub fn insert(&self, mut dev: Device) -> Result<u16, InsertError> {
        let mut slots = self.slots.lock();
        if slots.iter().flatten().any(|d| d.handle == dev.handle) {
            return Err(InsertError::Duplicate);
        }

        let start = dev.slot as usize;
        let slot = (start..slots.len())
            .find(|&i| slots[i].is_none())
            .ok_or(InsertError::Full)?;

        dev.slot = slot as u16;
        slots[slot] = Some(dev);
        Ok(dev.slot)
    }

    /// Removes the record for `handle`
    pub fn remove(&self, handle: u16) -> Option<Device> {
        let mut slots = self.slots.lock();
        slots
            .iter_mut()
            .find(|d| matches!(d, Some(dev) if dev.handle == handle))
            .and_then(Option::take)
    }

    /// Looks up a record by handle
    pub fn find(&self, handle: u16) -> Option<Device> {
        self.slots
            .lock()
            .iter()
            .flatten()
            .find(|d| d.handle == handle)
            .copied()
    }

    /// Record at a target number
    pub fn at_slot(&self, slot: u16) -> Option<Device> {
        self.slots.lock().get(slot as usize).copied().flatten()
    }

    /// Applies `f` to the record for `handle`; false if there is none
    pub fn update<F: FnOnce(&mut Device)>(&self, handle: u16, f: F) -> bool {
        let mut slots = self.slots.lock();
        match slots.iter_mut().flatten().find(|d| d.handle == handle) {
            Some(dev) => {
                f(dev);
                true
            }
            None => false,
        }
    }

    /// Copy of every record in slot order
    pub fn snapshot(&self) -> Vec<Device> {
        self.slots.lock().iter().flatten().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
