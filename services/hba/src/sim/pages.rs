//! Devices and configuration pages of the simulated IOC

use crate::config::{
    ConfigPage, IocPage1, IocPage8, ManufacturingPage0, RaidConfigElement, RaidConfigPage0,
    RaidPhysDiskPage0, RaidVolumePage0, EXT_PAGE_TYPE_RAID_CONFIG, IOC1_REPLY_COALESCING,
    PAGE_TYPE_EXTENDED, PAGE_TYPE_IOC, PAGE_TYPE_MANUFACTURING, PAGE_TYPE_RAID_PHYSDISK,
    PAGE_TYPE_RAID_VOLUME, RAID_CONFIG_ACTIVE, RAID_CONFIG_ELEMENT_HSP_PHYS_DISK,
    RAID_CONFIG_ELEMENT_VOLUME, RAID_CONFIG_ELEMENT_VOL_PHYS_DISK, RAID_PD_STATE_HOT_SPARE,
    RAID_PD_STATE_ONLINE, RAID_PHYSDISK_ADDR_NUMBER, RAID_VOLUME_ADDR_HANDLE,
    RAID_VOL_STATE_OPTIMAL, RAID_VOL_TYPE_RAID1,
};
use crate::mpi::{
    ConfigRequest, IrConfigChangeList, IrConfigElement, TopologyChangeList, TopologyEntry,
    IR_CFG_ELEMENT_HOT_SPARE, IR_CFG_ELEMENT_VOLUME, IR_CFG_ELEMENT_VOLUME_DISK, IR_CFG_RC_ADDED,
    IR_CFG_RC_HIDE, IR_CFG_RC_PD_CREATED, TOPO_PHY_RC_TARG_ADDED,
};

use super::SimConfig;

pub(super) const VOLUME_HANDLE: u16 = 0x140;

const ADDR_FORM_MASK: u32 = 0xF000_0000;
const ADDR_VALUE_MASK: u32 = 0x0FFF_FFFF;

const DISK_BLOCKS: u64 = 0x0020_0000;
const VOLUME_BLOCKS: u64 = 0x0010_0000;
const BLOCK_SIZE: u16 = 512;
const HOT_SPARE_POOL: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub(super) struct SimTarget {
    pub handle: u16,
    pub phy: u8,
}

#[derive(Debug, Clone, Copy)]
pub(super) struct SimDisk {
    pub num: u8,
    pub handle: u16,
    pub state: u8,
    pub offline_reason: u8,
}

#[derive(Debug, Clone)]
pub(super) struct SimVolume {
    pub handle: u16,
    pub state: u8,
    pub status_flags: u32,
    pub settings: u16,
    pub members: Vec<u8>,
    /// Write cache changes are refused
    pub cache_pinned: bool,
}

impl SimVolume {
    pub fn size(&self) -> u64 {
        VOLUME_BLOCKS * BLOCK_SIZE as u64
    }
}

/// Everything the IOC knows about the SAS domain
pub(super) struct Model {
    pub targets: Vec<SimTarget>,
    pub next_phy: u8,
    pub disks: Vec<SimDisk>,
    pub volumes: Vec<SimVolume>,
    pub ioc1: IocPage1,
    pub ioc8: IocPage8,
}

impl Model {
    /// Four targets; the first two mirrored, the third a spare
    pub fn new(config: &SimConfig) -> Self {
        let targets: Vec<SimTarget> = (0..4u8)
            .map(|phy| SimTarget {
                handle: 0x09 + phy as u16,
                phy,
            })
            .collect();
        let disks = vec![
            SimDisk { num: 0, handle: targets[0].handle, state: RAID_PD_STATE_ONLINE, offline_reason: 0 },
            SimDisk { num: 1, handle: targets[1].handle, state: RAID_PD_STATE_ONLINE, offline_reason: 0 },
            SimDisk { num: 2, handle: targets[2].handle, state: RAID_PD_STATE_HOT_SPARE, offline_reason: 0 },
        ];
        Self {
            next_phy: targets.len() as u8,
            targets,
            disks,
            volumes: vec![SimVolume {
                handle: VOLUME_HANDLE,
                state: RAID_VOL_STATE_OPTIMAL,
                status_flags: 0,
                settings: 0,
                members: vec![0, 1],
                cache_pinned: false,
            }],
            ioc1: IocPage1 {
                flags: IOC1_REPLY_COALESCING,
                coalescing_timeout: 10,
                coalescing_depth: 4,
                pci_slot: 0,
            },
            ioc8: IocPage8 {
                num_devs_per_enclosure: 8,
                max_persistent_entries: 128,
                max_num_physical_mapped_ids: 8,
                flags: config.ioc8_flags,
                ir_volume_mapping_flags: config.ir_volume_mapping,
            },
        }
    }

    /// A SCSI command to `handle` reaches a device
    pub fn addressable(&self, handle: u16) -> bool {
        self.targets.iter().any(|t| t.handle == handle) || self.volumes.iter().any(|v| v.handle == handle)
    }

    pub fn volume_mut(&mut self, handle: u16) -> Option<&mut SimVolume> {
        self.volumes.iter_mut().find(|v| v.handle == handle)
    }

    /// Page a config request names, header included
    pub fn page(&self, request: &ConfigRequest) -> Option<Vec<u8>> {
        let number = request.header[2];
        let form = request.page_address & ADDR_FORM_MASK;
        let value = request.page_address & ADDR_VALUE_MASK;

        match (request.header[3], number) {
            (PAGE_TYPE_IOC, 1) => Some(self.ioc1.encode()),
            (PAGE_TYPE_IOC, 8) => Some(self.ioc8.encode()),
            (PAGE_TYPE_MANUFACTURING, 0) => Some(manufacturing().encode()),
            (PAGE_TYPE_RAID_VOLUME, 0) if form == RAID_VOLUME_ADDR_HANDLE => self
                .volumes
                .iter()
                .find(|v| v.handle as u32 == value)
                .map(|v| self.volume_page(v).encode()),
            (PAGE_TYPE_RAID_PHYSDISK, 0) if form == RAID_PHYSDISK_ADDR_NUMBER => self
                .disks
                .iter()
                .find(|d| d.num as u32 == value)
                .map(|d| disk_page(d).encode()),
            (PAGE_TYPE_EXTENDED, 0)
                if request.ext_page_type == EXT_PAGE_TYPE_RAID_CONFIG
                    && request.page_address == RAID_CONFIG_ACTIVE =>
            {
                Some(self.raid_config().encode())
            }
            _ => None,
        }
    }

    /// Stores a page the host wrote; only IOC page 1 is writable
    pub fn write_page(&mut self, request: &ConfigRequest, body: &[u8]) -> bool {
        match (request.header[3], request.header[2]) {
            (PAGE_TYPE_IOC, 1) if body.len() >= IocPage1::SIZE => {
                self.ioc1 = IocPage1::decode(body);
                true
            }
            _ => false,
        }
    }

    fn volume_page(&self, vol: &SimVolume) -> RaidVolumePage0 {
        RaidVolumePage0 {
            dev_handle: vol.handle,
            state: vol.state,
            volume_type: RAID_VOL_TYPE_RAID1,
            status_flags: vol.status_flags,
            settings: vol.settings,
            hot_spare_pool: HOT_SPARE_POOL,
            max_lba: VOLUME_BLOCKS,
            stripe_size: 128,
            block_size: BLOCK_SIZE,
            members: vol.members.clone(),
        }
    }

    fn spares(&self) -> impl Iterator<Item = &SimDisk> {
        self.disks.iter().filter(|d| d.state == RAID_PD_STATE_HOT_SPARE)
    }

    fn raid_config(&self) -> RaidConfigPage0 {
        let mut elements = Vec::new();
        for vol in &self.volumes {
            elements.push(RaidConfigElement {
                element_flags: RAID_CONFIG_ELEMENT_VOLUME,
                vol_dev_handle: vol.handle,
                ..Default::default()
            });
            for num in &vol.members {
                let handle = self.disks.iter().find(|d| d.num == *num).map_or(0, |d| d.handle);
                elements.push(RaidConfigElement {
                    element_flags: RAID_CONFIG_ELEMENT_VOL_PHYS_DISK,
                    vol_dev_handle: vol.handle,
                    phys_disk_num: *num,
                    phys_disk_dev_handle: handle,
                    ..Default::default()
                });
            }
        }
        for disk in self.spares() {
            elements.push(RaidConfigElement {
                element_flags: RAID_CONFIG_ELEMENT_HSP_PHYS_DISK,
                hot_spare_pool: HOT_SPARE_POOL,
                phys_disk_num: disk.num,
                phys_disk_dev_handle: disk.handle,
                ..Default::default()
            });
        }

        RaidConfigPage0 {
            num_hot_spares: self.spares().count() as u8,
            num_phys_disks: self.disks.len() as u8,
            num_volumes: self.volumes.len() as u8,
            config_num: 1,
            flags: 0,
            elements,
        }
    }

    /// Every target, as reported once the port is enabled
    pub fn topology(&self) -> TopologyChangeList {
        TopologyChangeList {
            enclosure_handle: 1,
            start_phy: 0,
            entries: self
                .targets
                .iter()
                .map(|t| TopologyEntry {
                    dev_handle: t.handle,
                    phy_status: TOPO_PHY_RC_TARG_ADDED,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// The RAID configuration, as reported once the port is enabled
    pub fn ir_config(&self) -> IrConfigChangeList {
        let mut elements = Vec::new();
        for vol in &self.volumes {
            elements.push(IrConfigElement {
                element_flags: IR_CFG_ELEMENT_VOLUME,
                vol_dev_handle: vol.handle,
                reason_code: IR_CFG_RC_ADDED,
                ..Default::default()
            });
            for disk in self.disks.iter().filter(|d| vol.members.contains(&d.num)) {
                elements.push(IrConfigElement {
                    element_flags: IR_CFG_ELEMENT_VOLUME_DISK,
                    vol_dev_handle: vol.handle,
                    reason_code: IR_CFG_RC_PD_CREATED,
                    phys_disk_num: disk.num,
                    phys_disk_dev_handle: disk.handle,
                });
            }
        }
        for disk in self.spares() {
            elements.push(IrConfigElement {
                element_flags: IR_CFG_ELEMENT_HOT_SPARE,
                reason_code: IR_CFG_RC_HIDE,
                phys_disk_num: disk.num,
                phys_disk_dev_handle: disk.handle,
                ..Default::default()
            });
        }
        IrConfigChangeList { flags: 0, elements }
    }
}

fn manufacturing() -> ManufacturingPage0 {
    ManufacturingPage0 {
        chip_name: "SAS2008".into(),
        chip_revision: "03".into(),
        board_name: "SPLAX SIM-8i".into(),
        board_assembly: "H3-25097-00".into(),
        board_tracer: "SIM0001".into(),
    }
}

fn ascii<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let n = text.len().min(N);
    field[..n].copy_from_slice(&text.as_bytes()[..n]);
    field
}

fn disk_page(disk: &SimDisk) -> RaidPhysDiskPage0 {
    RaidPhysDiskPage0 {
        dev_handle: disk.handle,
        phys_disk_num: disk.num,
        vendor: ascii("SPLAX"),
        product: ascii("SIM-DISK"),
        revision: ascii("0100"),
        serial: ascii(&format!("SIM{:04}", disk.num)),
        state: disk.state,
        offline_reason: disk.offline_reason,
        max_lba: DISK_BLOCKS,
        block_size: BLOCK_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(page_type: u8, number: u8, address: u32) -> ConfigRequest {
        ConfigRequest {
            header: [0, 0, number, page_type],
            page_address: address,
            ..Default::default()
        }
    }

    #[test]
    fn test_volume_page_by_handle() {
        let model = Model::new(&SimConfig::default());
        let page = model
            .page(&request(PAGE_TYPE_RAID_VOLUME, 0, RAID_VOLUME_ADDR_HANDLE | VOLUME_HANDLE as u32))
            .expect("volume page");
        let vol = RaidVolumePage0::decode(&page);
        assert_eq!(vol.members, vec![0, 1]);
        assert_eq!(page[1] as usize * 4, page.len());

        assert!(model.page(&request(PAGE_TYPE_RAID_VOLUME, 0, RAID_VOLUME_ADDR_HANDLE | 0x141)).is_none());
    }

    #[test]
    fn test_only_ioc1_is_writable() {
        let mut model = Model::new(&SimConfig::default());
        let page = IocPage1::default().encode();
        assert!(model.write_page(&request(PAGE_TYPE_IOC, 1, 0), &page));
        assert_eq!(model.ioc1.flags, 0);
        assert!(!model.write_page(&request(PAGE_TYPE_IOC, 8, 0), &IocPage8::default().encode()));
    }

    #[test]
    fn test_startup_ir_config_hides_members_and_spare() {
        let model = Model::new(&SimConfig::default());
        let list = model.ir_config();
        let hidden: Vec<u16> = list
            .elements
            .iter()
            .filter(|e| e.element_type() != IR_CFG_ELEMENT_VOLUME)
            .map(|e| e.phys_disk_dev_handle)
            .collect();
        assert_eq!(hidden, vec![0x09, 0x0A, 0x0B]);
        assert_eq!(model.raid_config().hot_spares(HOT_SPARE_POOL), vec![2]);
    }
}
