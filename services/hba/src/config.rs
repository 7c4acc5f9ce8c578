//! # Configuration
//!
//! Two unrelated kinds of configuration live here:
//!
//! - [`HbaConfig`], the host-side tunables of one controller instance
//! - config pages, the IOC's own configuration space, read and written
//!   through `CONFIG` request messages
//!
//! ## Page access
//!
//! A page is fetched in two phases. A `PAGE_HEADER` request returns the page
//! version and length; a `READ_CURRENT` or `WRITE_CURRENT` request then moves
//! the page body. The body travels through the scratch area that follows the
//! config request inside the same request frame, so no extra DMA memory is
//! needed.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{Dispatcher, SubmitMode};
use crate::mpi::{
    get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, ConfigReply, ConfigRequest, Request,
    CONFIG_ACTION_PAGE_HEADER, CONFIG_ACTION_PAGE_READ_CURRENT, CONFIG_ACTION_PAGE_WRITE_CURRENT,
    IOCSTATUS_SUCCESS,
};
use crate::pool::Command;
use crate::sgl::{legacy_header, SgeFlags};
use crate::{HbaError, HbaResult};

// =============================================================================
// Tunables
// =============================================================================

/// Host-side settings of one controller
#[derive(Debug, Clone)]
pub struct HbaConfig {
    /// Prefix of every log line
    pub name: String,
    /// Upper bound on command slots, below the IOC's request credit
    pub max_commands: usize,
    /// Register reads per bounded wait
    pub poll_iterations: u32,
    /// Delay between register reads
    pub poll_interval: Duration,
    /// Delay after asserting adapter reset
    pub hard_reset_settle: Duration,
    /// Register reads while waiting for adapter reset to clear
    pub hard_reset_polls: u32,
    /// Reset attempts before bring-up gives up
    pub bring_up_attempts: u32,
    /// Bound on a waiting or polling administrative command
    pub admin_timeout: Duration,
    /// Scan period of the command watchdog
    pub watchdog_tick: Duration,
    /// Depth of the target recovery queue; event queues follow the reply frame count
    pub queue_depth: usize,
}

impl Default for HbaConfig {
    fn default() -> Self {
        Self {
            name: String::from("mpii0"),
            max_commands: 128,
            poll_iterations: 15000,
            poll_interval: Duration::from_millis(1),
            hard_reset_settle: Duration::from_millis(240),
            hard_reset_polls: 30000,
            bring_up_attempts: 5,
            admin_timeout: Duration::from_secs(30),
            watchdog_tick: Duration::from_millis(10),
            queue_depth: 64,
        }
    }
}

impl HbaConfig {
    /// Short delays for a simulated IOC
    pub fn fast() -> Self {
        Self {
            poll_iterations: 4000,
            poll_interval: Duration::from_micros(50),
            hard_reset_settle: Duration::from_millis(1),
            hard_reset_polls: 1000,
            admin_timeout: Duration::from_secs(5),
            watchdog_tick: Duration::from_millis(1),
            ..Self::default()
        }
    }

    /// Same settings under another controller name
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

// =============================================================================
// Page Headers
// =============================================================================

pub const PAGE_TYPE_IOC: u8 = 0x01;
pub const PAGE_TYPE_RAID_VOLUME: u8 = 0x08;
pub const PAGE_TYPE_MANUFACTURING: u8 = 0x09;
pub const PAGE_TYPE_RAID_PHYSDISK: u8 = 0x0A;
pub const PAGE_TYPE_EXTENDED: u8 = 0x0F;
pub const PAGE_TYPE_MASK: u8 = 0x0F;

pub const EXT_PAGE_TYPE_RAID_CONFIG: u8 = 0x16;

/// Page address of a RAID volume by device handle
pub const RAID_VOLUME_ADDR_HANDLE: u32 = 0x1000_0000;
/// Page address of a RAID physical disk by disk number
pub const RAID_PHYSDISK_ADDR_NUMBER: u32 = 0x1000_0000;
/// Page address of the active RAID configuration
pub const RAID_CONFIG_ACTIVE: u32 = 0x2000_0000;

/// Config request size; the page scratch area starts right after it
pub const CONFIG_SCRATCH_OFFSET: usize = ConfigRequest::SIZE;

/// Header of a standard page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigHeader {
    pub version: u8,
    /// Page length in dwords
    pub length: u8,
    pub number: u8,
    pub page_type: u8,
}

impl ConfigHeader {
    pub fn new(page_type: u8, number: u8, length_bytes: usize) -> Self {
        Self {
            version: 0,
            length: (length_bytes / 4) as u8,
            number,
            page_type,
        }
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        Self {
            version: b[0],
            length: b[1],
            number: b[2],
            page_type: b[3],
        }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.version, self.length, self.number, self.page_type]
    }
}

/// Header of an extended page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtConfigHeader {
    pub version: u8,
    pub number: u8,
    /// Always [`PAGE_TYPE_EXTENDED`]
    pub page_type: u8,
    /// Page length in dwords
    pub ext_length: u16,
    pub ext_type: u8,
}

impl ExtConfigHeader {
    /// Encodes the 8-byte header that starts an extended page
    pub fn encode(&self, page: &mut [u8]) {
        page[0] = self.version;
        page[2] = self.number;
        page[3] = self.page_type;
        put_u16(page, 4, self.ext_length);
        page[6] = self.ext_type;
    }
}

/// Header of either kind, as passed to [`ConfigPages::get_page`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeader {
    Standard(ConfigHeader),
    Extended(ExtConfigHeader),
}

impl PageHeader {
    /// Page length in bytes
    pub fn len_bytes(&self) -> usize {
        match self {
            PageHeader::Standard(h) => h.length as usize * 4,
            PageHeader::Extended(h) => h.ext_length as usize * 4,
        }
    }
}

impl From<ConfigHeader> for PageHeader {
    fn from(h: ConfigHeader) -> Self {
        PageHeader::Standard(h)
    }
}

impl From<ExtConfigHeader> for PageHeader {
    fn from(h: ExtConfigHeader) -> Self {
        PageHeader::Extended(h)
    }
}

/// Direction of a page transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccess {
    Read,
    Write,
}

// =============================================================================
// Page Access
// =============================================================================

/// Config page requests over the request ring
pub struct ConfigPages {
    name: String,
    dispatcher: Arc<Dispatcher>,
    vf_id: u8,
}

impl ConfigPages {
    pub fn new(name: &str, dispatcher: Arc<Dispatcher>, vf_id: u8) -> Self {
        Self {
            name: name.to_string(),
            dispatcher,
            vf_id,
        }
    }

    fn command(&self) -> HbaResult<Command> {
        self.dispatcher.pool().acquire().ok_or_else(|| {
            log::debug!("{}: no command slot for config request", self.name);
            HbaError::NoCommandSlot
        })
    }

    /// Runs a config request; returns the completed command and its reply
    fn exchange(&self, cmd: Command, mode: SubmitMode) -> HbaResult<(Command, ConfigReply)> {
        let cmd = self.dispatcher.submit(cmd, mode)?;
        let reply = match cmd.reply() {
            Some(reply) => ConfigReply::decode(&reply.bytes()),
            None => return Err(HbaError::NoReply),
        };
        let status = reply.header.status();
        if status != IOCSTATUS_SUCCESS {
            log::debug!("{}: config request failed with status {:#06x}", self.name, status);
            return Err(HbaError::BadStatus(status));
        }
        Ok((cmd, reply))
    }

    fn header_request(&self, page_type: u8, ext_type: u8, number: u8, address: u32) -> ConfigRequest {
        ConfigRequest {
            action: CONFIG_ACTION_PAGE_HEADER,
            ext_page_type: ext_type,
            vf_id: self.vf_id,
            header: ConfigHeader {
                number,
                page_type,
                ..Default::default()
            }
            .to_bytes(),
            page_address: address,
            sge_flags_length: legacy_header(
                SgeFlags::SIMPLE | SgeFlags::LAST | SgeFlags::END_OF_BUFFER | SgeFlags::END_OF_LIST,
                0,
            ),
            ..Default::default()
        }
    }

    /// Fetches the header of a standard page
    pub fn get_header(
        &self,
        page_type: u8,
        number: u8,
        address: u32,
        mode: SubmitMode,
    ) -> HbaResult<ConfigHeader> {
        log::trace!(
            "{}: header type {:#04x} number {} address {:#010x}",
            self.name,
            page_type,
            number,
            address
        );
        let mut cmd = self.command()?;
        cmd.encode(&self.header_request(page_type, 0, number, address));
        let (_cmd, reply) = self.exchange(cmd, mode)?;
        Ok(ConfigHeader::from_bytes(reply.page_header))
    }

    /// Fetches the header of an extended page
    pub fn get_ext_header(
        &self,
        ext_type: u8,
        number: u8,
        address: u32,
        mode: SubmitMode,
    ) -> HbaResult<ExtConfigHeader> {
        log::trace!(
            "{}: ext header type {:#04x} number {} address {:#010x}",
            self.name,
            ext_type,
            number,
            address
        );
        let mut cmd = self.command()?;
        cmd.encode(&self.header_request(PAGE_TYPE_EXTENDED, ext_type, number, address));
        let (_cmd, reply) = self.exchange(cmd, mode)?;
        let header = ConfigHeader::from_bytes(reply.page_header);
        Ok(ExtConfigHeader {
            version: header.version,
            number: header.number,
            page_type: header.page_type,
            ext_length: reply.ext_page_length,
            ext_type: reply.ext_page_type,
        })
    }

    /// Reads a page into `buf` or writes `buf` to a page
    pub fn get_page(
        &self,
        address: u32,
        header: PageHeader,
        access: PageAccess,
        buf: &mut [u8],
        mode: SubmitMode,
    ) -> HbaResult<()> {
        let page_len = header.len_bytes();
        if buf.len() < page_len {
            return Err(HbaError::PageTooSmall);
        }

        let mut cmd = self.command()?;
        if buf.len() > cmd.frame_size() - CONFIG_SCRATCH_OFFSET {
            return Err(HbaError::PageTooLarge);
        }

        let (action, dir) = match access {
            PageAccess::Read => (CONFIG_ACTION_PAGE_READ_CURRENT, SgeFlags::empty()),
            PageAccess::Write => (CONFIG_ACTION_PAGE_WRITE_CURRENT, SgeFlags::DIR_OUT),
        };
        let mut request = ConfigRequest {
            action,
            vf_id: self.vf_id,
            page_address: address,
            sge_flags_length: legacy_header(
                SgeFlags::SIMPLE
                    | SgeFlags::LAST
                    | SgeFlags::END_OF_BUFFER
                    | SgeFlags::END_OF_LIST
                    | SgeFlags::SIZE_64
                    | dir,
                page_len as u32,
            ),
            sge_address: cmd.frame_addr() + CONFIG_SCRATCH_OFFSET as u64,
            ..Default::default()
        };
        match header {
            PageHeader::Standard(h) => request.header = h.to_bytes(),
            PageHeader::Extended(h) => {
                request.header = [h.version, 0, h.number, h.page_type];
                request.ext_page_length = h.ext_length;
                request.ext_page_type = h.ext_type;
            }
        }
        request.header[3] &= PAGE_TYPE_MASK;

        cmd.encode(&request);
        if access == PageAccess::Write {
            cmd.write_frame(CONFIG_SCRATCH_OFFSET, buf);
        }

        let (cmd, _reply) = self.exchange(cmd, mode)?;
        if access == PageAccess::Read {
            cmd.read_frame(CONFIG_SCRATCH_OFFSET, buf);
        }
        Ok(())
    }

    /// Reads a fixed-size page without asking for its header first
    pub fn read<P: ConfigPage>(&self, address: u32, mode: SubmitMode) -> HbaResult<P> {
        let header = ConfigHeader::new(P::PAGE_TYPE, P::NUMBER, P::SIZE);
        let mut buf = vec![0u8; P::SIZE];
        self.get_page(address, header.into(), PageAccess::Read, &mut buf, mode)?;
        Ok(P::decode(&buf))
    }

    /// Writes a fixed-size page
    pub fn write<P: ConfigPage>(&self, address: u32, page: &P, mode: SubmitMode) -> HbaResult<()> {
        let header = ConfigHeader::new(P::PAGE_TYPE, P::NUMBER, P::SIZE);
        let mut buf = page.encode();
        self.get_page(address, header.into(), PageAccess::Write, &mut buf, mode)
    }

    /// Reads a page whose length only the IOC knows
    pub fn read_sized<P: ConfigPage>(&self, address: u32, mode: SubmitMode) -> HbaResult<P> {
        let header = self.get_header(P::PAGE_TYPE, P::NUMBER, address, mode)?;
        let len = header.length as usize * 4;
        if len < P::SIZE {
            log::warn!("config page {:#04x}/{} reported {} bytes", P::PAGE_TYPE, P::NUMBER, len);
            return Err(HbaError::PageTooSmall);
        }
        let mut buf = vec![0u8; len];
        self.get_page(address, header.into(), PageAccess::Read, &mut buf, mode)?;
        Ok(P::decode(&buf))
    }

    /// Reads the active RAID configuration
    pub fn raid_config(&self, mode: SubmitMode) -> HbaResult<RaidConfigPage0> {
        let header = self.get_ext_header(EXT_PAGE_TYPE_RAID_CONFIG, 0, RAID_CONFIG_ACTIVE, mode)?;
        let len = header.ext_length as usize * 4;
        if len < RaidConfigPage0::SIZE {
            log::warn!("raid config page 0 reported {} bytes", len);
            return Err(HbaError::PageTooSmall);
        }
        let mut buf = vec![0u8; len];
        self.get_page(RAID_CONFIG_ACTIVE, header.into(), PageAccess::Read, &mut buf, mode)?;
        Ok(RaidConfigPage0::decode(&buf))
    }
}

// =============================================================================
// Typed Pages
// =============================================================================

/// A page body with a known layout
pub trait ConfigPage: Sized {
    const PAGE_TYPE: u8;
    const NUMBER: u8;
    /// Size in bytes of the fixed part
    const SIZE: usize;

    fn decode(page: &[u8]) -> Self;
    fn encode(&self) -> Vec<u8>;
}

/// Text of a fixed-width, NUL-padded field, trimmed and stripped of
/// unprintable bytes
pub fn ascii_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    raw[..end]
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' })
        .collect::<String>()
        .trim()
        .to_string()
}

fn put_ascii(page: &mut [u8], offset: usize, width: usize, text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(width);
    page[offset..offset + n].copy_from_slice(&bytes[..n]);
}

/// Manufacturing page 0: board identification
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManufacturingPage0 {
    pub chip_name: String,
    pub chip_revision: String,
    pub board_name: String,
    pub board_assembly: String,
    pub board_tracer: String,
}

impl ConfigPage for ManufacturingPage0 {
    const PAGE_TYPE: u8 = PAGE_TYPE_MANUFACTURING;
    const NUMBER: u8 = 0;
    const SIZE: usize = 76;

    fn decode(page: &[u8]) -> Self {
        Self {
            chip_name: ascii_field(&page[4..20]),
            chip_revision: ascii_field(&page[20..28]),
            board_name: ascii_field(&page[28..44]),
            board_assembly: ascii_field(&page[44..60]),
            board_tracer: ascii_field(&page[60..76]),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; Self::SIZE];
        page[..4].copy_from_slice(&ConfigHeader::new(Self::PAGE_TYPE, Self::NUMBER, Self::SIZE).to_bytes());
        put_ascii(&mut page, 4, 16, &self.chip_name);
        put_ascii(&mut page, 20, 8, &self.chip_revision);
        put_ascii(&mut page, 28, 16, &self.board_name);
        put_ascii(&mut page, 44, 16, &self.board_assembly);
        put_ascii(&mut page, 60, 16, &self.board_tracer);
        page
    }
}

/// Reply coalescing enabled
pub const IOC1_REPLY_COALESCING: u32 = 0x0000_0001;

/// IOC page 1: reply coalescing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocPage1 {
    pub flags: u32,
    pub coalescing_timeout: u32,
    pub coalescing_depth: u8,
    pub pci_slot: u8,
}

impl ConfigPage for IocPage1 {
    const PAGE_TYPE: u8 = PAGE_TYPE_IOC;
    const NUMBER: u8 = 1;
    const SIZE: usize = 16;

    fn decode(page: &[u8]) -> Self {
        Self {
            flags: get_u32(page, 4),
            coalescing_timeout: get_u32(page, 8),
            coalescing_depth: page[12],
            pci_slot: page[13],
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; Self::SIZE];
        page[..4].copy_from_slice(&ConfigHeader::new(Self::PAGE_TYPE, Self::NUMBER, Self::SIZE).to_bytes());
        put_u32(&mut page, 4, self.flags);
        put_u32(&mut page, 8, self.coalescing_timeout);
        page[12] = self.coalescing_depth;
        page[13] = self.pci_slot;
        page
    }
}

/// Target id 0 is reserved
pub const IOC8_FLAGS_RESERVED_TARGETID_0: u16 = 0x0010;
pub const IOC8_IRFLAGS_VOLUME_MAPPING_MASK: u16 = 0x0003;
pub const IOC8_IRFLAGS_LOW_VOLUME_MAPPING: u16 = 0x0000;
pub const IOC8_IRFLAGS_HIGH_VOLUME_MAPPING: u16 = 0x0001;

/// IOC page 8: target id mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocPage8 {
    pub num_devs_per_enclosure: u8,
    pub max_persistent_entries: u16,
    pub max_num_physical_mapped_ids: u16,
    pub flags: u16,
    pub ir_volume_mapping_flags: u16,
}

impl ConfigPage for IocPage8 {
    const PAGE_TYPE: u8 = PAGE_TYPE_IOC;
    const NUMBER: u8 = 8;
    const SIZE: usize = 24;

    fn decode(page: &[u8]) -> Self {
        Self {
            num_devs_per_enclosure: page[4],
            max_persistent_entries: get_u16(page, 8),
            max_num_physical_mapped_ids: get_u16(page, 10),
            flags: get_u16(page, 12),
            ir_volume_mapping_flags: get_u16(page, 16),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; Self::SIZE];
        page[..4].copy_from_slice(&ConfigHeader::new(Self::PAGE_TYPE, Self::NUMBER, Self::SIZE).to_bytes());
        page[4] = self.num_devs_per_enclosure;
        put_u16(&mut page, 8, self.max_persistent_entries);
        put_u16(&mut page, 10, self.max_num_physical_mapped_ids);
        put_u16(&mut page, 12, self.flags);
        put_u16(&mut page, 16, self.ir_volume_mapping_flags);
        page
    }
}

pub const RAID_VOL_STATE_MISSING: u8 = 0x01;
pub const RAID_VOL_STATE_FAILED: u8 = 0x02;
pub const RAID_VOL_STATE_INITIALIZING: u8 = 0x03;
pub const RAID_VOL_STATE_ONLINE: u8 = 0x04;
pub const RAID_VOL_STATE_DEGRADED: u8 = 0x05;
pub const RAID_VOL_STATE_OPTIMAL: u8 = 0x06;

pub const RAID_VOL_TYPE_RAID0: u8 = 0x00;
pub const RAID_VOL_TYPE_RAID1E: u8 = 0x01;
pub const RAID_VOL_TYPE_RAID1: u8 = 0x02;
pub const RAID_VOL_TYPE_RAID10: u8 = 0x05;

/// Resync in progress
pub const RAID_VOL_STATUS_RESYNC: u32 = 0x0001_0000;

pub const RAID_VOL_SETTINGS_CACHE_MASK: u16 = 0x0003;
pub const RAID_VOL_SETTINGS_CACHE_ENABLED: u16 = 0x0002;

/// Printable name of a volume state
pub fn volume_state_name(state: u8) -> &'static str {
    match state {
        RAID_VOL_STATE_MISSING => "missing",
        RAID_VOL_STATE_FAILED => "failed",
        RAID_VOL_STATE_INITIALIZING => "initializing",
        RAID_VOL_STATE_ONLINE => "online",
        RAID_VOL_STATE_DEGRADED => "degraded",
        RAID_VOL_STATE_OPTIMAL => "optimal",
        _ => "unknown",
    }
}

/// RAID volume page 0
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaidVolumePage0 {
    pub dev_handle: u16,
    pub state: u8,
    pub volume_type: u8,
    pub status_flags: u32,
    pub settings: u16,
    pub hot_spare_pool: u8,
    pub max_lba: u64,
    pub stripe_size: u32,
    pub block_size: u16,
    /// Physical disk number of each member, in member order
    pub members: Vec<u8>,
}

impl RaidVolumePage0 {
    const MEMBER_OFFSET: usize = 40;
    const MEMBER_SIZE: usize = 4;
}

impl ConfigPage for RaidVolumePage0 {
    const PAGE_TYPE: u8 = PAGE_TYPE_RAID_VOLUME;
    const NUMBER: u8 = 0;
    const SIZE: usize = Self::MEMBER_OFFSET;

    fn decode(page: &[u8]) -> Self {
        let count = page[36] as usize;
        let members = (0..count)
            .map(|i| Self::MEMBER_OFFSET + i * Self::MEMBER_SIZE + 2)
            .take_while(|&off| off < page.len())
            .map(|off| page[off])
            .collect();
        Self {
            dev_handle: get_u16(page, 4),
            state: page[6],
            volume_type: page[7],
            status_flags: get_u32(page, 8),
            settings: get_u16(page, 12),
            hot_spare_pool: page[14],
            max_lba: get_u64(page, 16),
            stripe_size: get_u32(page, 24),
            block_size: get_u16(page, 28),
            members,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let len = Self::MEMBER_OFFSET + self.members.len() * Self::MEMBER_SIZE;
        let mut page = vec![0u8; len];
        page[..4].copy_from_slice(&ConfigHeader::new(Self::PAGE_TYPE, Self::NUMBER, len).to_bytes());
        put_u16(&mut page, 4, self.dev_handle);
        page[6] = self.state;
        page[7] = self.volume_type;
        put_u32(&mut page, 8, self.status_flags);
        put_u16(&mut page, 12, self.settings);
        page[14] = self.hot_spare_pool;
        put_u64(&mut page, 16, self.max_lba);
        put_u32(&mut page, 24, self.stripe_size);
        put_u16(&mut page, 28, self.block_size);
        page[36] = self.members.len() as u8;
        for (i, disk) in self.members.iter().enumerate() {
            page[Self::MEMBER_OFFSET + i * Self::MEMBER_SIZE + 2] = *disk;
        }
        page
    }
}

pub const RAID_PD_STATE_NOT_CONFIGURED: u8 = 0x00;
pub const RAID_PD_STATE_NOT_COMPATIBLE: u8 = 0x01;
pub const RAID_PD_STATE_OFFLINE: u8 = 0x02;
pub const RAID_PD_STATE_ONLINE: u8 = 0x03;
pub const RAID_PD_STATE_HOT_SPARE: u8 = 0x04;
pub const RAID_PD_STATE_DEGRADED: u8 = 0x05;
pub const RAID_PD_STATE_REBUILDING: u8 = 0x06;
pub const RAID_PD_STATE_OPTIMAL: u8 = 0x07;

pub const RAID_PD_OFFLINE_MISSING: u8 = 0x01;
pub const RAID_PD_OFFLINE_FAILED: u8 = 0x03;
pub const RAID_PD_OFFLINE_REQUESTED: u8 = 0x05;
pub const RAID_PD_OFFLINE_FAILED_REQUESTED: u8 = 0x06;

/// RAID physical disk page 0
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaidPhysDiskPage0 {
    pub dev_handle: u16,
    pub phys_disk_num: u8,
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
    pub serial: [u8; 32],
    pub state: u8,
    pub offline_reason: u8,
    pub max_lba: u64,
    pub block_size: u16,
}

impl ConfigPage for RaidPhysDiskPage0 {
    const PAGE_TYPE: u8 = PAGE_TYPE_RAID_PHYSDISK;
    const NUMBER: u8 = 0;
    const SIZE: usize = 120;

    fn decode(page: &[u8]) -> Self {
        let mut disk = Self {
            dev_handle: get_u16(page, 4),
            phys_disk_num: page[7],
            state: page[80],
            offline_reason: page[81],
            max_lba: get_u64(page, 88),
            block_size: get_u16(page, 112),
            ..Default::default()
        };
        disk.vendor.copy_from_slice(&page[16..24]);
        disk.product.copy_from_slice(&page[24..40]);
        disk.revision.copy_from_slice(&page[40..44]);
        disk.serial.copy_from_slice(&page[44..76]);
        disk
    }

    fn encode(&self) -> Vec<u8> {
        let mut page = vec![0u8; Self::SIZE];
        page[..4].copy_from_slice(&ConfigHeader::new(Self::PAGE_TYPE, Self::NUMBER, Self::SIZE).to_bytes());
        put_u16(&mut page, 4, self.dev_handle);
        page[7] = self.phys_disk_num;
        page[16..24].copy_from_slice(&self.vendor);
        page[24..40].copy_from_slice(&self.product);
        page[40..44].copy_from_slice(&self.revision);
        page[44..76].copy_from_slice(&self.serial);
        page[80] = self.state;
        page[81] = self.offline_reason;
        put_u64(&mut page, 88, self.max_lba);
        put_u16(&mut page, 112, self.block_size);
        page
    }
}

pub const RAID_CONFIG_ELEMENT_TYPE_MASK: u16 = 0x000F;
pub const RAID_CONFIG_ELEMENT_VOLUME: u16 = 0x0000;
pub const RAID_CONFIG_ELEMENT_VOL_PHYS_DISK: u16 = 0x0001;
pub const RAID_CONFIG_ELEMENT_HSP_PHYS_DISK: u16 = 0x0002;

/// One element of the active RAID configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RaidConfigElement {
    pub element_flags: u16,
    pub vol_dev_handle: u16,
    pub hot_spare_pool: u8,
    pub phys_disk_num: u8,
    pub phys_disk_dev_handle: u16,
}

impl RaidConfigElement {
    pub fn is_hot_spare(&self) -> bool {
        self.element_flags & RAID_CONFIG_ELEMENT_TYPE_MASK == RAID_CONFIG_ELEMENT_HSP_PHYS_DISK
    }
}

/// RAID configuration page 0 (extended)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RaidConfigPage0 {
    pub num_hot_spares: u8,
    pub num_phys_disks: u8,
    pub num_volumes: u8,
    pub config_num: u8,
    pub flags: u32,
    pub elements: Vec<RaidConfigElement>,
}

impl RaidConfigPage0 {
    const ELEMENT_OFFSET: usize = 48;
    const ELEMENT_SIZE: usize = 8;

    /// Physical disk numbers of the hot spares in `pool`, in page order
    pub fn hot_spares(&self, pool: u8) -> Vec<u8> {
        self.elements
            .iter()
            .filter(|e| e.is_hot_spare() && e.hot_spare_pool == pool)
            .map(|e| e.phys_disk_num)
            .collect()
    }
}

impl ConfigPage for RaidConfigPage0 {
    const PAGE_TYPE: u8 = PAGE_TYPE_EXTENDED;
    const NUMBER: u8 = 0;
    const SIZE: usize = Self::ELEMENT_OFFSET;

    fn decode(page: &[u8]) -> Self {
        let count = page[44] as usize;
        let elements = (0..count)
            .map(|i| Self::ELEMENT_OFFSET + i * Self::ELEMENT_SIZE)
            .take_while(|&off| off + Self::ELEMENT_SIZE <= page.len())
            .map(|off| RaidConfigElement {
                element_flags: get_u16(page, off),
                vol_dev_handle: get_u16(page, off + 2),
                hot_spare_pool: page[off + 4],
                phys_disk_num: page[off + 5],
                phys_disk_dev_handle: get_u16(page, off + 6),
            })
            .collect();
        Self {
            num_hot_spares: page[8],
            num_phys_disks: page[9],
            num_volumes: page[10],
            config_num: page[11],
            flags: get_u32(page, 12),
            elements,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let len = Self::ELEMENT_OFFSET + self.elements.len() * Self::ELEMENT_SIZE;
        let mut page = vec![0u8; len];
        ExtConfigHeader {
            page_type: PAGE_TYPE_EXTENDED,
            ext_length: (len / 4) as u16,
            ext_type: EXT_PAGE_TYPE_RAID_CONFIG,
            ..Default::default()
        }
        .encode(&mut page);
        page[8] = self.num_hot_spares;
        page[9] = self.num_phys_disks;
        page[10] = self.num_volumes;
        page[11] = self.config_num;
        put_u32(&mut page, 12, self.flags);
        page[44] = self.elements.len() as u8;
        for (i, el) in self.elements.iter().enumerate() {
            let off = Self::ELEMENT_OFFSET + i * Self::ELEMENT_SIZE;
            put_u16(&mut page, off, el.element_flags);
            put_u16(&mut page, off + 2, el.vol_dev_handle);
            page[off + 4] = el.hot_spare_pool;
            page[off + 5] = el.phys_disk_num;
            put_u16(&mut page, off + 6, el.phys_disk_dev_handle);
        }
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{wait_for, Harness};

    #[test]
    fn test_defaults() {
        let config = HbaConfig::default();
        assert_eq!(config.name, "mpii0");
        assert_eq!(config.max_commands, 128);
        assert_eq!(config.poll_iterations, 15000);
        assert_eq!(config.hard_reset_settle, Duration::from_millis(240));
        assert_eq!(config.bring_up_attempts, 5);
        assert_eq!(config.admin_timeout, Duration::from_secs(30));
        assert_eq!(HbaConfig::fast().named("sim3").name, "sim3");
    }

    #[test]
    fn test_ascii_field() {
        assert_eq!(ascii_field(b"SAS9211-8i\0\0\0\0\0\0"), "SAS9211-8i");
        assert_eq!(ascii_field(b"  ATA \x01 "), "ATA ?");
        assert_eq!(ascii_field(b"\0abc"), "");
    }

    #[test]
    fn test_raid_volume_members() {
        let page = RaidVolumePage0 {
            dev_handle: 0x140,
            state: RAID_VOL_STATE_OPTIMAL,
            members: vec![3, 7],
            ..Default::default()
        };
        let bytes = page.encode();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[1] as usize * 4, bytes.len());
        assert_eq!(RaidVolumePage0::decode(&bytes).members, vec![3, 7]);
    }

    #[test]
    fn test_hot_spares_by_pool() {
        let el = |flags, pool, disk| RaidConfigElement {
            element_flags: flags,
            hot_spare_pool: pool,
            phys_disk_num: disk,
            ..Default::default()
        };
        let page = RaidConfigPage0 {
            elements: vec![
                el(RAID_CONFIG_ELEMENT_VOLUME, 0, 0),
                el(RAID_CONFIG_ELEMENT_HSP_PHYS_DISK, 1, 9),
                el(RAID_CONFIG_ELEMENT_VOL_PHYS_DISK, 1, 3),
                el(RAID_CONFIG_ELEMENT_HSP_PHYS_DISK, 2, 4),
                el(RAID_CONFIG_ELEMENT_HSP_PHYS_DISK, 1, 5),
            ],
            ..Default::default()
        };
        let decoded = RaidConfigPage0::decode(&page.encode());
        assert_eq!(decoded.hot_spares(1), vec![9, 5]);
        assert_eq!(decoded.hot_spares(2), vec![4]);
    }

    #[test]
    fn test_header_and_page_round_trip() {
        let hx = Harness::attach();
        let pages = hx.hba.config_pages();

        let header = pages
            .get_header(PAGE_TYPE_IOC, 1, 0, SubmitMode::Wait)
            .unwrap();
        assert_eq!(header.length as usize * 4, IocPage1::SIZE);
        assert_eq!(header.number, 1);

        // attach cleared coalescing
        let page: IocPage1 = pages.read(0, SubmitMode::Wait).unwrap();
        assert_eq!(page.flags & IOC1_REPLY_COALESCING, 0);

        let written = IocPage1 {
            flags: IOC1_REPLY_COALESCING | 0x10,
            coalescing_timeout: 40,
            coalescing_depth: 8,
            ..page
        };
        pages.write(0, &written, SubmitMode::Wait).unwrap();
        let back: IocPage1 = pages.read(0, SubmitMode::Poll).unwrap();
        assert_eq!(back, written);
    }

    #[test]
    fn test_page_length_checks() {
        let hx = Harness::attach();
        let pages = hx.hba.config_pages();
        let header = ConfigHeader::new(PAGE_TYPE_IOC, 1, IocPage1::SIZE);

        let mut short = [0u8; 8];
        assert_eq!(
            pages.get_page(0, header.into(), PageAccess::Read, &mut short, SubmitMode::Wait),
            Err(HbaError::PageTooSmall)
        );

        let mut huge = vec![0u8; 4096];
        assert_eq!(
            pages.get_page(0, header.into(), PageAccess::Read, &mut huge, SubmitMode::Wait),
            Err(HbaError::PageTooLarge)
        );
    }

    #[test]
    fn test_short_page_length_from_ioc() {
        let hx = Harness::attach();
        let pages = hx.hba.config_pages();
        let volume = RAID_VOLUME_ADDR_HANDLE | hx.sim.volumes()[0] as u32;

        hx.sim.shorten_pages(PAGE_TYPE_RAID_VOLUME, 2);
        assert_eq!(
            pages.read_sized::<RaidVolumePage0>(volume, SubmitMode::Wait),
            Err(HbaError::PageTooSmall)
        );
        assert_eq!(hx.hba.volume(0).map(|v| v.status), Err(HbaError::PageTooSmall));

        hx.sim.shorten_pages(PAGE_TYPE_EXTENDED, 2);
        assert_eq!(pages.raid_config(SubmitMode::Wait), Err(HbaError::PageTooSmall));

        // the controller keeps working
        assert!(wait_for(|| hx.hba.outstanding() == 0));
        let page: IocPage1 = pages.read(0, SubmitMode::Wait).unwrap();
        assert_eq!(page, hx.sim.ioc_page1());
    }

    #[test]
    fn test_unknown_page_is_bad_status() {
        let hx = Harness::attach();
        let pages = hx.hba.config_pages();
        assert_eq!(
            pages.get_header(0x0E, 3, 0, SubmitMode::Wait),
            Err(HbaError::BadStatus(crate::mpi::IOCSTATUS_CONFIG_INVALID_PAGE))
        );
    }

    #[test]
    fn test_extended_header() {
        let hx = Harness::attach();
        let pages = hx.hba.config_pages();
        let header = pages
            .get_ext_header(EXT_PAGE_TYPE_RAID_CONFIG, 0, RAID_CONFIG_ACTIVE, SubmitMode::Wait)
            .unwrap();
        assert_eq!(header.page_type, PAGE_TYPE_EXTENDED);
        assert_eq!(header.ext_type, EXT_PAGE_TYPE_RAID_CONFIG);
        let config = pages.raid_config(SubmitMode::Wait).unwrap();
        assert_eq!(config.elements.len() * 8 + 48, header.ext_length as usize * 4);
    }
}
