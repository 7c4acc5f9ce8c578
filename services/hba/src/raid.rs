//! # RAID Inventory
//!
//! Read-only view of integrated RAID volumes and their disks for management
//! tools, plus the volume write cache switch. Everything is answered from
//! config pages; the device table only supplies volume handles and resync
//! progress.
//!
//! Disks of a volume are numbered members first, then the hot spares of the
//! volume's hot spare pool in configuration page order.

use std::sync::Arc;

use crate::config::*;
use crate::devices::{Device, DeviceFlags, DeviceTable};
use crate::dispatch::{Dispatcher, SubmitMode};
use crate::mpi::{
    RaidActionReply, RaidActionRequest, IOCSTATUS_SUCCESS, RAID_ACTION_CHANGE_VOL_WRITE_CACHE,
    RAID_VOL_WRITE_CACHE_DISABLE, RAID_VOL_WRITE_CACHE_ENABLE, RAID_VOL_WRITE_CACHE_MASK,
};
use crate::{HbaError, HbaResult};

/// Controller summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inquiry {
    pub name: String,
    pub volumes: usize,
}

/// Health of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Online,
    Rebuilding,
    Degraded,
    Offline,
    Building,
    Invalid,
}

/// One volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub status: VolumeStatus,
    /// RAID level; `None` for layouts without a classic level
    pub level: Option<u8>,
    /// Members plus hot spares of the volume's pool
    pub disks: usize,
    /// Size in bytes
    pub size: u64,
    /// Resync progress, only while rebuilding
    pub percent: Option<u8>,
}

/// Health of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    Online,
    Failed,
    Offline,
    Rebuilding,
    HotSpare,
    Unused,
    Invalid,
}

/// One disk of a volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    /// Physical disk number
    pub target: u8,
    pub status: DiskStatus,
    /// Size in bytes
    pub size: u64,
    /// Vendor and product
    pub vendor: String,
    pub serial: String,
}

/// Maps a volume state to its status. `resync` is the resync status bit.
pub fn volume_status(state: u8, resync: bool) -> VolumeStatus {
    match state {
        RAID_VOL_STATE_ONLINE | RAID_VOL_STATE_OPTIMAL => VolumeStatus::Online,
        RAID_VOL_STATE_DEGRADED if resync => VolumeStatus::Rebuilding,
        RAID_VOL_STATE_DEGRADED => VolumeStatus::Degraded,
        RAID_VOL_STATE_FAILED => VolumeStatus::Offline,
        RAID_VOL_STATE_INITIALIZING => VolumeStatus::Building,
        _ => VolumeStatus::Invalid,
    }
}

/// RAID level of a volume type
pub fn raid_level(volume_type: u8) -> Option<u8> {
    match volume_type {
        RAID_VOL_TYPE_RAID0 => Some(0),
        RAID_VOL_TYPE_RAID1 => Some(1),
        RAID_VOL_TYPE_RAID1E | RAID_VOL_TYPE_RAID10 => Some(10),
        _ => None,
    }
}

/// Maps a physical disk state and offline reason to its status
pub fn disk_status(state: u8, offline_reason: u8) -> DiskStatus {
    match state {
        RAID_PD_STATE_ONLINE | RAID_PD_STATE_OPTIMAL => DiskStatus::Online,
        RAID_PD_STATE_OFFLINE => match offline_reason {
            RAID_PD_OFFLINE_FAILED | RAID_PD_OFFLINE_FAILED_REQUESTED => DiskStatus::Failed,
            _ => DiskStatus::Offline,
        },
        RAID_PD_STATE_DEGRADED => DiskStatus::Failed,
        RAID_PD_STATE_REBUILDING => DiskStatus::Rebuilding,
        RAID_PD_STATE_HOT_SPARE => DiskStatus::HotSpare,
        RAID_PD_STATE_NOT_CONFIGURED => DiskStatus::Unused,
        _ => DiskStatus::Invalid,
    }
}

/// RAID queries against one controller
pub struct Raid {
    name: String,
    pages: Arc<ConfigPages>,
    devices: Arc<DeviceTable>,
    dispatcher: Arc<Dispatcher>,
}

impl Raid {
    pub fn new(
        name: &str,
        pages: Arc<ConfigPages>,
        devices: Arc<DeviceTable>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            name: name.to_string(),
            pages,
            devices,
            dispatcher,
        }
    }

    /// Volume record for volume number `volid`
    pub fn find_volume(&self, volid: u16) -> Option<Device> {
        self.devices.volume(volid)
    }

    fn volume_page(&self, volid: u16, mode: SubmitMode) -> HbaResult<(Device, RaidVolumePage0)> {
        let dev = self.find_volume(volid).ok_or(HbaError::NoDevice)?;
        let page = self
            .pages
            .read_sized::<RaidVolumePage0>(RAID_VOLUME_ADDR_HANDLE | dev.handle as u32, mode)
            .inspect_err(|e| {
                log::warn!("{}: unable to fetch raid volume page 0: {}", self.name, e)
            })?;
        Ok((dev, page))
    }

    pub fn inquiry(&self) -> Inquiry {
        let volumes = self
            .devices
            .snapshot()
            .iter()
            .filter(|d| d.flags.contains(DeviceFlags::VOLUME))
            .count();
        Inquiry {
            name: self.name.clone(),
            volumes,
        }
    }

    pub fn volume(&self, volid: u16) -> HbaResult<VolumeInfo> {
        let (dev, page) = self.volume_page(volid, SubmitMode::Wait)?;

        let status = volume_status(page.state, page.status_flags & RAID_VOL_STATUS_RESYNC != 0);
        let spares = self.hot_spares(page.hot_spare_pool)?;

        Ok(VolumeInfo {
            status,
            level: raid_level(page.volume_type),
            disks: page.members.len() + spares.len(),
            size: page.max_lba * page.block_size as u64,
            percent: (status == VolumeStatus::Rebuilding).then_some(dev.percent),
        })
    }

    /// Status only, polled; used for periodic refresh
    pub fn volume_state(&self, volid: u16) -> HbaResult<VolumeStatus> {
        let (_, page) = self.volume_page(volid, SubmitMode::Poll)?;
        Ok(volume_status(page.state, page.status_flags & RAID_VOL_STATUS_RESYNC != 0))
    }

    pub fn disk(&self, volid: u16, diskid: usize) -> HbaResult<DiskInfo> {
        let (_, page) = self.volume_page(volid, SubmitMode::Wait)?;

        let number = match page.members.get(diskid) {
            Some(number) => *number,
            None => {
                let spares = self.hot_spares(page.hot_spare_pool)?;
                *spares
                    .get(diskid - page.members.len())
                    .ok_or(HbaError::NoDevice)?
            }
        };
        self.physical_disk(number)
    }

    fn hot_spares(&self, pool: u8) -> HbaResult<Vec<u8>> {
        let config = self.pages.raid_config(SubmitMode::Wait).inspect_err(|e| {
            log::warn!("{}: unable to fetch raid config page 0: {}", self.name, e)
        })?;
        Ok(config.hot_spares(pool))
    }

    fn physical_disk(&self, number: u8) -> HbaResult<DiskInfo> {
        let page: RaidPhysDiskPage0 = self
            .pages
            .read(RAID_PHYSDISK_ADDR_NUMBER | number as u32, SubmitMode::Wait)
            .inspect_err(|e| {
                log::warn!("{}: unable to fetch raid drive page 0: {}", self.name, e)
            })?;

        if self.devices.find(page.dev_handle).is_none() {
            return Ok(DiskInfo {
                target: page.phys_disk_num,
                status: DiskStatus::Invalid,
                size: 0,
                vendor: String::new(),
                serial: String::new(),
            });
        }

        let vendor = format!("{} {}", ascii_field(&page.vendor), ascii_field(&page.product));
        Ok(DiskInfo {
            target: page.phys_disk_num,
            status: disk_status(page.state, page.offline_reason),
            size: page.max_lba * page.block_size as u64,
            vendor: vendor.trim().to_string(),
            serial: ascii_field(&page.serial),
        })
    }

    // =========================================================================
    // Cache
    // =========================================================================

    pub fn write_cache(&self, volid: u16) -> HbaResult<bool> {
        let (_, page) = self.volume_page(volid, SubmitMode::Wait)?;
        Ok(page.settings & RAID_VOL_SETTINGS_CACHE_MASK == RAID_VOL_SETTINGS_CACHE_ENABLED)
    }

    /// Switches the volume write cache. The IOC echoes the resulting setting,
    /// which must match what was asked for.
    pub fn set_write_cache(&self, volid: u16, enable: bool) -> HbaResult<()> {
        let (dev, page) = self.volume_page(volid, SubmitMode::Wait)?;
        let enabled = page.settings & RAID_VOL_SETTINGS_CACHE_MASK == RAID_VOL_SETTINGS_CACHE_ENABLED;
        if enabled == enable {
            return Ok(());
        }

        let wanted = if enable {
            RAID_VOL_WRITE_CACHE_ENABLE
        } else {
            RAID_VOL_WRITE_CACHE_DISABLE
        };

        let mut cmd = self.dispatcher.pool().acquire().ok_or(HbaError::NoCommandSlot)?;
        cmd.encode(&RaidActionRequest {
            action: RAID_ACTION_CHANGE_VOL_WRITE_CACHE,
            vol_handle: dev.handle,
            action_data: wanted,
        });
        let cmd = self.dispatcher.submit(cmd, SubmitMode::Wait)?;

        let reply = cmd.reply().ok_or(HbaError::NoReply)?;
        let reply = RaidActionReply::decode(&reply.bytes());
        let status = reply.header.status();
        if status != IOCSTATUS_SUCCESS {
            return Err(HbaError::IocStatus(status));
        }
        if reply.action_data & RAID_VOL_WRITE_CACHE_MASK != wanted {
            log::warn!("{}: volume {} write cache change not applied", self.name, volid);
            return Err(HbaError::NotApplied);
        }
        log::info!(
            "{}: volume {} write cache {}",
            self.name,
            volid,
            if enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::Harness;
    use crate::mpi::{EventReply, IrOperationStatus, EVENT_IR_OPERATION_STATUS, IR_RAIDOP_RESYNC};

    #[test]
    fn test_status_tables() {
        assert_eq!(volume_status(RAID_VOL_STATE_OPTIMAL, false), VolumeStatus::Online);
        assert_eq!(volume_status(RAID_VOL_STATE_DEGRADED, true), VolumeStatus::Rebuilding);
        assert_eq!(volume_status(RAID_VOL_STATE_DEGRADED, false), VolumeStatus::Degraded);
        assert_eq!(volume_status(RAID_VOL_STATE_MISSING, false), VolumeStatus::Invalid);
        assert_eq!(raid_level(RAID_VOL_TYPE_RAID1E), Some(10));
        assert_eq!(raid_level(0x09), None);
        assert_eq!(
            disk_status(RAID_PD_STATE_OFFLINE, RAID_PD_OFFLINE_FAILED_REQUESTED),
            DiskStatus::Failed
        );
        assert_eq!(
            disk_status(RAID_PD_STATE_OFFLINE, RAID_PD_OFFLINE_MISSING),
            DiskStatus::Offline
        );
        assert_eq!(disk_status(RAID_PD_STATE_NOT_COMPATIBLE, 0), DiskStatus::Invalid);
    }

    #[test]
    fn test_inquiry_and_volume() {
        let hx = Harness::attach();
        let inq = hx.hba.inquiry();
        assert_eq!(inq.name, hx.hba.name());
        assert_eq!(inq.volumes, 1);

        let vol = hx.hba.volume(0).unwrap();
        assert_eq!(vol.status, VolumeStatus::Online);
        assert_eq!(vol.level, Some(1));
        // two members and one hot spare
        assert_eq!(vol.disks, 3);
        assert_eq!(vol.size, hx.sim.volume_size(0));
        assert_eq!(vol.percent, None);

        assert_eq!(hx.hba.volume(1), Err(HbaError::NoDevice));
    }

    #[test]
    fn test_rebuilding_reports_progress() {
        let hx = Harness::attach();
        let handle = hx.sim.volumes()[0];
        hx.sim
            .set_volume_state(handle, RAID_VOL_STATE_DEGRADED, RAID_VOL_STATUS_RESYNC);
        hx.sim.inject_event(EventReply {
            event: EVENT_IR_OPERATION_STATUS,
            data: IrOperationStatus {
                vol_dev_handle: handle,
                operation: IR_RAIDOP_RESYNC,
                percent: 17,
            }
            .encode(),
            ..Default::default()
        });

        let vol = hx.hba.volume(0).unwrap();
        assert_eq!(vol.status, VolumeStatus::Rebuilding);
        assert_eq!(vol.percent, Some(17));
        assert_eq!(hx.hba.volume_state(0), Ok(VolumeStatus::Rebuilding));
    }

    #[test]
    fn test_disks_then_hot_spares() {
        let hx = Harness::attach();
        let first = hx.hba.disk(0, 0).unwrap();
        assert_eq!(first.status, DiskStatus::Online);
        assert_eq!(first.target, 0);
        assert!(first.vendor.starts_with("SPLAX"));
        assert!(!first.serial.is_empty());

        let spare = hx.hba.disk(0, 2).unwrap();
        assert_eq!(spare.status, DiskStatus::HotSpare);
        assert_eq!(spare.target, 2);

        assert_eq!(hx.hba.disk(0, 3), Err(HbaError::NoDevice));
    }

    #[test]
    fn test_failed_disk() {
        let hx = Harness::attach();
        hx.sim
            .set_disk_state(1, RAID_PD_STATE_OFFLINE, RAID_PD_OFFLINE_FAILED);
        assert_eq!(hx.hba.disk(0, 1).unwrap().status, DiskStatus::Failed);
    }

    #[test]
    fn test_write_cache_toggle() {
        let hx = Harness::attach();
        assert_eq!(hx.hba.write_cache(0), Ok(false));
        hx.hba.set_write_cache(0, true).unwrap();
        assert_eq!(hx.hba.write_cache(0), Ok(true));
        // already in the wanted state: no request sent
        hx.hba.set_write_cache(0, true).unwrap();
        hx.hba.set_write_cache(0, false).unwrap();
        assert_eq!(hx.hba.write_cache(0), Ok(false));
    }

    #[test]
    fn test_write_cache_change_refused() {
        let hx = Harness::attach();
        let handle = hx.sim.volumes()[0];
        hx.sim.pin_write_cache(handle, true);
        assert_eq!(hx.hba.set_write_cache(0, true), Err(HbaError::NotApplied));
        assert_eq!(hx.hba.write_cache(0), Ok(false));
        assert!(hx.hba.set_write_cache(0, false).is_ok());

        hx.sim.pin_write_cache(handle, false);
        hx.hba.set_write_cache(0, true).unwrap();
        assert_eq!(hx.hba.write_cache(0), Ok(true));
    }
}
