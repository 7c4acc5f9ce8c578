//! # Message Frames
//!
//! Fusion-MPT 2/3 request and reply layouts. Everything on the wire is little
//! endian. Requests implement [`Request`] and encode into a zeroed byte
//! buffer; replies decode from a copy of the reply frame.
//!
//! Reply types also carry an `encode` so that a device model can produce
//! frames with the same layout the host decodes.

// =============================================================================
// Byte Helpers
// =============================================================================

#[inline]
pub fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    get_u32(buf, off) as u64 | (get_u32(buf, off + 4) as u64) << 32
}

#[inline]
pub fn put_u16(buf: &mut [u8], off: usize, value: u16) {
    buf[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_u64(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Function Codes
// =============================================================================

pub const FUNCTION_SCSI_IO: u8 = 0x00;
pub const FUNCTION_SCSI_TASK_MGMT: u8 = 0x01;
pub const FUNCTION_IOC_INIT: u8 = 0x02;
pub const FUNCTION_IOC_FACTS: u8 = 0x03;
pub const FUNCTION_CONFIG: u8 = 0x04;
pub const FUNCTION_PORT_FACTS: u8 = 0x05;
pub const FUNCTION_PORT_ENABLE: u8 = 0x06;
pub const FUNCTION_EVENT_NOTIFICATION: u8 = 0x07;
pub const FUNCTION_EVENT_ACK: u8 = 0x08;
pub const FUNCTION_RAID_ACTION: u8 = 0x15;
pub const FUNCTION_SAS_IO_UNIT_CONTROL: u8 = 0x1B;
pub const FUNCTION_IOC_MESSAGE_UNIT_RESET: u8 = 0x40;
pub const FUNCTION_HANDSHAKE: u8 = 0x42;

/// Offset of the function byte in every request and reply
pub const FUNCTION_OFFSET: usize = 3;

/// Who-init code written by a host driver
pub const WHOINIT_HOST_DRIVER: u8 = 0x04;

// =============================================================================
// Status Codes
// =============================================================================

/// Mask applied to the IOC status before comparison
pub const IOCSTATUS_MASK: u16 = 0x7FFF;

pub const IOCSTATUS_SUCCESS: u16 = 0x0000;
pub const IOCSTATUS_BUSY: u16 = 0x0002;
pub const IOCSTATUS_INSUFFICIENT_RESOURCES: u16 = 0x0006;
pub const IOCSTATUS_CONFIG_INVALID_PAGE: u16 = 0x0022;
pub const IOCSTATUS_SCSI_RECOVERED_ERROR: u16 = 0x0040;
pub const IOCSTATUS_SCSI_INVALID_DEVHANDLE: u16 = 0x0042;
pub const IOCSTATUS_SCSI_DEVICE_NOT_THERE: u16 = 0x0043;
pub const IOCSTATUS_SCSI_DATA_UNDERRUN: u16 = 0x0045;
pub const IOCSTATUS_SCSI_TASK_TERMINATED: u16 = 0x0048;
pub const IOCSTATUS_SCSI_IOC_TERMINATED: u16 = 0x004B;

pub const SCSI_STATUS_GOOD: u8 = 0x00;
pub const SCSI_STATUS_CHECK_COND: u8 = 0x02;
pub const SCSI_STATUS_BUSY: u8 = 0x08;
pub const SCSI_STATUS_INTERMEDIATE: u8 = 0x10;
pub const SCSI_STATUS_INTERMEDIATE_CONDMET: u8 = 0x14;
pub const SCSI_STATUS_RESERVATION_CONFLICT: u8 = 0x18;
pub const SCSI_STATUS_CMD_TERMINATED: u8 = 0x22;
pub const SCSI_STATUS_TASK_SET_FULL: u8 = 0x28;
pub const SCSI_STATUS_ACA_ACTIVE: u8 = 0x30;
pub const SCSI_STATUS_TASK_ABORTED: u8 = 0x40;

/// Autosense data valid
pub const SCSI_STATE_AUTOSENSE_VALID: u8 = 0x01;

// =============================================================================
// Requests
// =============================================================================

/// A request message frame
pub trait Request {
    /// Encoded size in bytes
    const SIZE: usize;

    /// Writes the request into `frame`, which is zeroed and at least `SIZE`
    /// bytes long
    fn encode(&self, frame: &mut [u8]);

    /// Encodes into a fresh buffer
    fn to_bytes(&self) -> Vec<u8> {
        let mut frame = vec![0u8; Self::SIZE];
        self.encode(&mut frame);
        frame
    }
}

/// IOC facts request (handshake only)
#[derive(Debug, Clone, Copy, Default)]
pub struct IocFactsRequest;

impl Request for IocFactsRequest {
    const SIZE: usize = 12;

    fn encode(&self, frame: &mut [u8]) {
        frame[FUNCTION_OFFSET] = FUNCTION_IOC_FACTS;
    }
}

/// IOC init request (handshake only)
#[derive(Debug, Clone, Copy, Default)]
pub struct IocInitRequest {
    pub whoinit: u8,
    pub vf_id: u8,
    pub msg_version: u16,
    /// Request frame size in dwords
    pub request_frame_size: u16,
    pub reply_post_depth: u16,
    pub reply_free_depth: u16,
    pub sense_address_high: u32,
    pub reply_address_high: u32,
    pub request_base: u64,
    pub reply_post_queue: u64,
    pub reply_free_queue: u64,
}

impl Request for IocInitRequest {
    const SIZE: usize = 72;

    fn encode(&self, frame: &mut [u8]) {
        frame[0] = self.whoinit;
        frame[FUNCTION_OFFSET] = FUNCTION_IOC_INIT;
        frame[9] = self.vf_id;
        put_u16(frame, 12, self.msg_version);
        put_u16(frame, 24, self.request_frame_size);
        put_u16(frame, 26, self.reply_post_depth);
        put_u16(frame, 28, self.reply_free_depth);
        put_u32(frame, 32, self.sense_address_high);
        put_u32(frame, 36, self.reply_address_high);
        put_u64(frame, 40, self.request_base);
        put_u64(frame, 48, self.reply_post_queue);
        put_u64(frame, 56, self.reply_free_queue);
    }
}

impl IocInitRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            whoinit: frame[0],
            vf_id: frame[9],
            msg_version: get_u16(frame, 12),
            request_frame_size: get_u16(frame, 24),
            reply_post_depth: get_u16(frame, 26),
            reply_free_depth: get_u16(frame, 28),
            sense_address_high: get_u32(frame, 32),
            reply_address_high: get_u32(frame, 36),
            request_base: get_u64(frame, 40),
            reply_post_queue: get_u64(frame, 48),
            reply_free_queue: get_u64(frame, 56),
        }
    }
}

/// Port facts request
#[derive(Debug, Clone, Copy, Default)]
pub struct PortFactsRequest {
    pub port: u8,
    pub vf_id: u8,
}

impl Request for PortFactsRequest {
    const SIZE: usize = 12;

    fn encode(&self, frame: &mut [u8]) {
        frame[FUNCTION_OFFSET] = FUNCTION_PORT_FACTS;
        frame[6] = self.port;
        frame[9] = self.vf_id;
    }
}

/// Port enable request
#[derive(Debug, Clone, Copy, Default)]
pub struct PortEnableRequest {
    pub vf_id: u8,
}

impl Request for PortEnableRequest {
    const SIZE: usize = 12;

    fn encode(&self, frame: &mut [u8]) {
        frame[FUNCTION_OFFSET] = FUNCTION_PORT_ENABLE;
        frame[9] = self.vf_id;
    }
}

/// Event notification request
///
/// A set bit in `masks` suppresses the corresponding event.
#[derive(Debug, Clone, Copy)]
pub struct EventNotificationRequest {
    pub vf_id: u8,
    pub masks: [u32; 4],
}

impl EventNotificationRequest {
    /// Request with every event masked
    pub fn mask_all(vf_id: u8) -> Self {
        Self {
            vf_id,
            masks: [0xFFFF_FFFF; 4],
        }
    }

    /// Unmasks one event code
    pub fn unmask(&mut self, event: u16) {
        let bit = event as usize % 128;
        self.masks[bit / 32] &= !(1 << (bit % 32));
    }

    /// True if `event` is unmasked
    pub fn is_enabled(&self, event: u16) -> bool {
        let bit = event as usize % 128;
        self.masks[bit / 32] & (1 << (bit % 32)) == 0
    }

    pub fn decode(frame: &[u8]) -> Self {
        Self {
            vf_id: frame[9],
            masks: [
                get_u32(frame, 20),
                get_u32(frame, 24),
                get_u32(frame, 28),
                get_u32(frame, 32),
            ],
        }
    }
}

impl Request for EventNotificationRequest {
    const SIZE: usize = 44;

    fn encode(&self, frame: &mut [u8]) {
        frame[FUNCTION_OFFSET] = FUNCTION_EVENT_NOTIFICATION;
        frame[9] = self.vf_id;
        for (i, mask) in self.masks.iter().enumerate() {
            put_u32(frame, 20 + i * 4, *mask);
        }
    }
}

/// Event acknowledgment request
#[derive(Debug, Clone, Copy, Default)]
pub struct EventAckRequest {
    pub event: u16,
    pub context: u32,
}

impl Request for EventAckRequest {
    const SIZE: usize = 20;

    fn encode(&self, frame: &mut [u8]) {
        frame[FUNCTION_OFFSET] = FUNCTION_EVENT_ACK;
        put_u16(frame, 12, self.event);
        put_u32(frame, 16, self.context);
    }
}

impl EventAckRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            event: get_u16(frame, 12),
            context: get_u32(frame, 16),
        }
    }
}

/// Task management type: reset every nexus of a target
pub const TASK_TARGET_RESET: u8 = 0x03;

/// SCSI task management request
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskMgmtRequest {
    pub dev_handle: u16,
    pub task_type: u8,
    pub lun: u16,
    pub task_mid: u16,
}

impl Request for TaskMgmtRequest {
    const SIZE: usize = 52;

    fn encode(&self, frame: &mut [u8]) {
        put_u16(frame, 0, self.dev_handle);
        frame[FUNCTION_OFFSET] = FUNCTION_SCSI_TASK_MGMT;
        frame[5] = self.task_type;
        frame[12..14].copy_from_slice(&self.lun.to_be_bytes());
        put_u16(frame, 48, self.task_mid);
    }
}

impl TaskMgmtRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            dev_handle: get_u16(frame, 0),
            task_type: frame[5],
            lun: u16::from_be_bytes([frame[12], frame[13]]),
            task_mid: get_u16(frame, 48),
        }
    }
}

/// SAS IO unit control operation: forget a device handle
pub const SAS_OP_REMOVE_DEVICE: u8 = 0x0D;

/// SAS IO unit control request
#[derive(Debug, Clone, Copy, Default)]
pub struct SasIoUnitControlRequest {
    pub operation: u8,
    pub dev_handle: u16,
}

impl Request for SasIoUnitControlRequest {
    const SIZE: usize = 44;

    fn encode(&self, frame: &mut [u8]) {
        frame[0] = self.operation;
        frame[FUNCTION_OFFSET] = FUNCTION_SAS_IO_UNIT_CONTROL;
        put_u16(frame, 4, self.dev_handle);
    }
}

impl SasIoUnitControlRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            operation: frame[0],
            dev_handle: get_u16(frame, 4),
        }
    }
}

/// RAID action: change a volume's write cache policy
pub const RAID_ACTION_CHANGE_VOL_WRITE_CACHE: u8 = 0x17;

/// Write cache action data, also echoed back in the reply
pub const RAID_VOL_WRITE_CACHE_MASK: u32 = 0x03;
pub const RAID_VOL_WRITE_CACHE_DISABLE: u32 = 0x01;
pub const RAID_VOL_WRITE_CACHE_ENABLE: u32 = 0x02;

/// RAID action request
#[derive(Debug, Clone, Copy, Default)]
pub struct RaidActionRequest {
    pub action: u8,
    pub vol_handle: u16,
    pub action_data: u32,
}

impl Request for RaidActionRequest {
    const SIZE: usize = 32;

    fn encode(&self, frame: &mut [u8]) {
        frame[0] = self.action;
        frame[FUNCTION_OFFSET] = FUNCTION_RAID_ACTION;
        put_u16(frame, 4, self.vol_handle);
        put_u32(frame, 16, self.action_data);
    }
}

impl RaidActionRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            action: frame[0],
            vol_handle: get_u16(frame, 4),
            action_data: get_u32(frame, 16),
        }
    }
}

pub const CONFIG_ACTION_PAGE_HEADER: u8 = 0x00;
pub const CONFIG_ACTION_PAGE_READ_CURRENT: u8 = 0x01;
pub const CONFIG_ACTION_PAGE_WRITE_CURRENT: u8 = 0x02;

/// Config request
///
/// `header` is the 4-byte page header: version, length, number, type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigRequest {
    pub action: u8,
    pub ext_page_length: u16,
    pub ext_page_type: u8,
    pub vf_id: u8,
    pub header: [u8; 4],
    pub page_address: u32,
    /// Flags and length dword of the single simple element
    pub sge_flags_length: u32,
    pub sge_address: u64,
}

impl Request for ConfigRequest {
    const SIZE: usize = 40;

    fn encode(&self, frame: &mut [u8]) {
        frame[0] = self.action;
        frame[FUNCTION_OFFSET] = FUNCTION_CONFIG;
        put_u16(frame, 4, self.ext_page_length);
        frame[6] = self.ext_page_type;
        frame[9] = self.vf_id;
        frame[20..24].copy_from_slice(&self.header);
        put_u32(frame, 24, self.page_address);
        put_u32(frame, 28, self.sge_flags_length);
        put_u64(frame, 32, self.sge_address);
    }
}

impl ConfigRequest {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            action: frame[0],
            ext_page_length: get_u16(frame, 4),
            ext_page_type: frame[6],
            vf_id: frame[9],
            header: [frame[20], frame[21], frame[22], frame[23]],
            page_address: get_u32(frame, 24),
            sge_flags_length: get_u32(frame, 28),
            sge_address: get_u64(frame, 32),
        }
    }
}

/// SCSI I/O request size; the scatter/gather list starts right after it
pub const SCSI_IO_SIZE: usize = 96;
/// SGL offset in dwords
pub const SCSI_IO_SGL_OFFSET0: u8 = (SCSI_IO_SIZE / 4) as u8;
/// Chain offset byte
pub const SCSI_IO_CHAIN_OFFSET: usize = 2;
/// CDB length field lives in the low bits of `io_flags`
pub const SCSI_IO_CDB_OFFSET: usize = 64;

pub const SCSI_IO_CONTROL_READ: u32 = 0x0200_0000;
pub const SCSI_IO_CONTROL_WRITE: u32 = 0x0100_0000;
pub const SCSI_IO_CONTROL_SIMPLEQ: u32 = 0x0000_0000;

/// SCSI I/O request (header part; the SGL is written separately)
#[derive(Debug, Clone, Copy, Default)]
pub struct ScsiIoRequest {
    pub dev_handle: u16,
    pub sense_address_low: u32,
    pub sense_length: u8,
    pub data_length: u32,
    pub cdb_length: u16,
    pub lun: u16,
    pub control: u32,
    pub cdb: [u8; 32],
}

impl Request for ScsiIoRequest {
    const SIZE: usize = SCSI_IO_SIZE;

    fn encode(&self, frame: &mut [u8]) {
        put_u16(frame, 0, self.dev_handle);
        frame[FUNCTION_OFFSET] = FUNCTION_SCSI_IO;
        put_u32(frame, 12, self.sense_address_low);
        frame[18] = self.sense_length;
        frame[20] = SCSI_IO_SGL_OFFSET0;
        put_u32(frame, 28, self.data_length);
        put_u16(frame, 36, self.cdb_length);
        frame[52..54].copy_from_slice(&self.lun.to_be_bytes());
        put_u32(frame, 60, self.control);
        frame[SCSI_IO_CDB_OFFSET..SCSI_IO_CDB_OFFSET + 32].copy_from_slice(&self.cdb);
    }
}

impl ScsiIoRequest {
    pub fn decode(frame: &[u8]) -> Self {
        let mut cdb = [0u8; 32];
        cdb.copy_from_slice(&frame[SCSI_IO_CDB_OFFSET..SCSI_IO_CDB_OFFSET + 32]);
        Self {
            dev_handle: get_u16(frame, 0),
            sense_address_low: get_u32(frame, 12),
            sense_length: frame[18],
            data_length: get_u32(frame, 28),
            cdb_length: get_u16(frame, 36),
            lun: u16::from_be_bytes([frame[52], frame[53]]),
            control: get_u32(frame, 60),
            cdb,
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

/// Fields shared by every reply frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Length in dwords
    pub msg_length: u8,
    pub function: u8,
    pub msg_flags: u8,
    pub vf_id: u8,
    pub ioc_status: u16,
    pub ioc_loginfo: u32,
}

impl ReplyHeader {
    pub const SIZE: usize = 20;

    pub fn decode(frame: &[u8]) -> Self {
        Self {
            msg_length: frame[2],
            function: frame[FUNCTION_OFFSET],
            msg_flags: frame[7],
            vf_id: frame[9],
            ioc_status: get_u16(frame, 14),
            ioc_loginfo: get_u32(frame, 16),
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        frame[2] = self.msg_length;
        frame[FUNCTION_OFFSET] = self.function;
        frame[7] = self.msg_flags;
        frame[9] = self.vf_id;
        put_u16(frame, 14, self.ioc_status);
        put_u32(frame, 16, self.ioc_loginfo);
    }

    /// IOC status with the log-info-available bit stripped
    pub fn status(&self) -> u16 {
        self.ioc_status & IOCSTATUS_MASK
    }
}

/// IOC advertises event replay across a message unit reset
pub const IOCFACTS_CAPABILITY_EVENT_REPLAY: u32 = 0x0000_2000;
/// IOC supports integrated RAID
pub const IOCFACTS_CAPABILITY_INTEGRATED_RAID: u32 = 0x0000_1000;

/// IOC facts reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IocFactsReply {
    pub msg_version_min: u8,
    pub msg_version_maj: u8,
    pub ioc_number: u8,
    pub vf_id: u8,
    pub ioc_status: u16,
    pub whoinit: u8,
    pub request_credit: u16,
    pub capabilities: u32,
    /// dev, unit, minor, major
    pub fw_version: [u8; 4],
    /// Request frame size in dwords
    pub ioc_request_frame_size: u16,
    pub max_targets: u16,
    pub max_reply_post_depth: u16,
    /// Reply frame size in dwords
    pub reply_frame_size: u8,
    pub max_volumes: u8,
}

impl IocFactsReply {
    pub const SIZE: usize = 64;

    pub fn decode(frame: &[u8]) -> Self {
        Self {
            msg_version_min: frame[0],
            msg_version_maj: frame[1],
            ioc_number: frame[6],
            vf_id: frame[9],
            ioc_status: get_u16(frame, 14),
            whoinit: frame[21],
            request_credit: get_u16(frame, 24),
            capabilities: get_u32(frame, 28),
            fw_version: [frame[32], frame[33], frame[34], frame[35]],
            ioc_request_frame_size: get_u16(frame, 36),
            max_targets: get_u16(frame, 42),
            max_reply_post_depth: get_u16(frame, 52),
            reply_frame_size: frame[54],
            max_volumes: frame[55],
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        frame[0] = self.msg_version_min;
        frame[1] = self.msg_version_maj;
        frame[2] = (Self::SIZE / 4) as u8;
        frame[FUNCTION_OFFSET] = FUNCTION_IOC_FACTS;
        frame[6] = self.ioc_number;
        frame[9] = self.vf_id;
        put_u16(frame, 14, self.ioc_status);
        frame[21] = self.whoinit;
        put_u16(frame, 24, self.request_credit);
        put_u32(frame, 28, self.capabilities);
        frame[32..36].copy_from_slice(&self.fw_version);
        put_u16(frame, 36, self.ioc_request_frame_size);
        put_u16(frame, 42, self.max_targets);
        put_u16(frame, 52, self.max_reply_post_depth);
        frame[54] = self.reply_frame_size;
        frame[55] = self.max_volumes;
    }

    /// MPI 2.5 and 2.6 controllers use IEEE scatter/gather elements
    pub fn is_sas3(&self) -> bool {
        self.msg_version_maj == 0x02 && matches!(self.msg_version_min, 0x05 | 0x06)
    }
}

pub const PORT_TYPE_SAS_PHYSICAL: u8 = 0x30;
pub const PORT_TYPE_SAS_VIRTUAL: u8 = 0x31;
pub const PORT_TYPE_TRI_MODE: u8 = 0x40;

/// Port facts reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFactsReply {
    pub header: ReplyHeader,
    pub port_type: u8,
}

impl PortFactsReply {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            header: ReplyHeader::decode(frame),
            port_type: frame[21],
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        self.header.encode(frame);
        frame[21] = self.port_type;
    }
}

/// Config reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigReply {
    pub header: ReplyHeader,
    pub action: u8,
    pub ext_page_length: u16,
    pub ext_page_type: u8,
    pub page_header: [u8; 4],
}

impl ConfigReply {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            header: ReplyHeader::decode(frame),
            action: frame[0],
            ext_page_length: get_u16(frame, 4),
            ext_page_type: frame[6],
            page_header: [frame[20], frame[21], frame[22], frame[23]],
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        self.header.encode(frame);
        frame[0] = self.action;
        put_u16(frame, 4, self.ext_page_length);
        frame[6] = self.ext_page_type;
        frame[20..24].copy_from_slice(&self.page_header);
    }
}

/// SCSI I/O error reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScsiIoErrorReply {
    pub header: ReplyHeader,
    pub dev_handle: u16,
    pub scsi_status: u8,
    pub scsi_state: u8,
    pub transfer_count: u32,
    pub sense_count: u32,
    pub response_info: u32,
    pub task_tag: u16,
}

impl ScsiIoErrorReply {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            header: ReplyHeader::decode(frame),
            dev_handle: get_u16(frame, 0),
            scsi_status: frame[12],
            scsi_state: frame[13],
            transfer_count: get_u32(frame, 20),
            sense_count: get_u32(frame, 24),
            response_info: get_u32(frame, 28),
            task_tag: get_u16(frame, 32),
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        self.header.encode(frame);
        put_u16(frame, 0, self.dev_handle);
        frame[12] = self.scsi_status;
        frame[13] = self.scsi_state;
        put_u32(frame, 20, self.transfer_count);
        put_u32(frame, 24, self.sense_count);
        put_u32(frame, 28, self.response_info);
        put_u16(frame, 32, self.task_tag);
    }
}

/// RAID action reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaidActionReply {
    pub header: ReplyHeader,
    pub action_data: u32,
}

impl RaidActionReply {
    pub fn decode(frame: &[u8]) -> Self {
        Self {
            header: ReplyHeader::decode(frame),
            action_data: get_u32(frame, 20),
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        self.header.encode(frame);
        put_u32(frame, 20, self.action_data);
    }
}

// =============================================================================
// Events
// =============================================================================

pub const EVENT_EVENT_CHANGE: u16 = 0x000A;
pub const EVENT_SAS_DEVICE_STATUS_CHANGE: u16 = 0x000F;
pub const EVENT_IR_OPERATION_STATUS: u16 = 0x0014;
pub const EVENT_SAS_DISCOVERY: u16 = 0x0016;
pub const EVENT_SAS_TOPOLOGY_CHANGE_LIST: u16 = 0x001C;
pub const EVENT_SAS_ENCL_DEVICE_STATUS_CHANGE: u16 = 0x001D;
pub const EVENT_IR_VOLUME: u16 = 0x001E;
pub const EVENT_IR_PHYSICAL_DISK: u16 = 0x001F;
pub const EVENT_IR_CONFIGURATION_CHANGE_LIST: u16 = 0x0020;

/// Offset of the event data in an event reply
pub const EVENT_DATA_OFFSET: usize = 28;

/// Event notification reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventReply {
    pub header: ReplyHeader,
    /// Event data length in dwords
    pub data_length: u16,
    pub ack_required: u8,
    pub event: u16,
    pub context: u32,
    pub data: Vec<u8>,
}

impl EventReply {
    pub fn decode(frame: &[u8]) -> Self {
        let data_length = get_u16(frame, 0);
        let end = (EVENT_DATA_OFFSET + data_length as usize * 4).min(frame.len());
        Self {
            header: ReplyHeader::decode(frame),
            data_length,
            ack_required: frame[6],
            event: get_u16(frame, 20),
            context: get_u32(frame, 24),
            data: frame[EVENT_DATA_OFFSET..end].to_vec(),
        }
    }

    pub fn encode(&self, frame: &mut [u8]) {
        let mut header = self.header;
        header.function = FUNCTION_EVENT_NOTIFICATION;
        header.msg_length = ((EVENT_DATA_OFFSET + self.data.len()) / 4) as u8;
        header.encode(frame);
        put_u16(frame, 0, self.data.len().div_ceil(4) as u16);
        frame[6] = self.ack_required;
        put_u16(frame, 20, self.event);
        put_u32(frame, 24, self.context);
        frame[EVENT_DATA_OFFSET..EVENT_DATA_OFFSET + self.data.len()].copy_from_slice(&self.data);
    }
}

/// Topology change list reason codes (low nibble of the phy status)
pub const TOPO_PHY_RC_MASK: u8 = 0x0F;
pub const TOPO_PHY_RC_TARG_ADDED: u8 = 0x01;
pub const TOPO_PHY_RC_TARG_NOT_RESPONDING: u8 = 0x02;

/// One phy entry of a topology change list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyEntry {
    pub dev_handle: u16,
    pub link_rate: u8,
    pub phy_status: u8,
}

impl TopologyEntry {
    pub fn reason(&self) -> u8 {
        self.phy_status & TOPO_PHY_RC_MASK
    }
}

/// SAS topology change list event data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChangeList {
    pub enclosure_handle: u16,
    pub expander_handle: u16,
    pub start_phy: u8,
    pub physical_port: u8,
    pub entries: Vec<TopologyEntry>,
}

impl TopologyChangeList {
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 12 {
            return Self::default();
        }
        let count = data[8] as usize;
        let entries = (0..count)
            .map(|i| 12 + i * 4)
            .take_while(|off| off + 4 <= data.len())
            .map(|off| TopologyEntry {
                dev_handle: get_u16(data, off),
                link_rate: data[off + 2],
                phy_status: data[off + 3],
            })
            .collect();
        Self {
            enclosure_handle: get_u16(data, 0),
            expander_handle: get_u16(data, 2),
            start_phy: data[9],
            physical_port: data[11],
            entries,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; 12 + self.entries.len() * 4];
        put_u16(&mut data, 0, self.enclosure_handle);
        put_u16(&mut data, 2, self.expander_handle);
        data[8] = self.entries.len() as u8;
        data[9] = self.start_phy;
        data[11] = self.physical_port;
        for (i, entry) in self.entries.iter().enumerate() {
            let off = 12 + i * 4;
            put_u16(&mut data, off, entry.dev_handle);
            data[off + 2] = entry.link_rate;
            data[off + 3] = entry.phy_status;
        }
        data
    }
}

/// Configuration change list flag: foreign configuration
pub const IR_CFG_CHANGE_FOREIGN: u32 = 0x0000_0001;

pub const IR_CFG_ELEMENT_TYPE_MASK: u16 = 0x000F;
pub const IR_CFG_ELEMENT_VOLUME: u16 = 0x0000;
pub const IR_CFG_ELEMENT_VOLUME_DISK: u16 = 0x0001;
pub const IR_CFG_ELEMENT_HOT_SPARE: u16 = 0x0002;

pub const IR_CFG_RC_ADDED: u8 = 0x01;
pub const IR_CFG_RC_REMOVED: u8 = 0x02;
pub const IR_CFG_RC_HIDE: u8 = 0x04;
pub const IR_CFG_RC_UNHIDE: u8 = 0x05;
pub const IR_CFG_RC_VOLUME_CREATED: u8 = 0x06;
pub const IR_CFG_RC_VOLUME_DELETED: u8 = 0x07;
pub const IR_CFG_RC_PD_CREATED: u8 = 0x08;

/// One element of an IR configuration change list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrConfigElement {
    pub element_flags: u16,
    pub vol_dev_handle: u16,
    pub reason_code: u8,
    pub phys_disk_num: u8,
    pub phys_disk_dev_handle: u16,
}

impl IrConfigElement {
    pub fn element_type(&self) -> u16 {
        self.element_flags & IR_CFG_ELEMENT_TYPE_MASK
    }
}

/// IR configuration change list event data
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrConfigChangeList {
    pub flags: u32,
    pub elements: Vec<IrConfigElement>,
}

impl IrConfigChangeList {
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < 8 {
            return Self::default();
        }
        let count = data[0] as usize;
        let elements = (0..count)
            .map(|i| 8 + i * 8)
            .take_while(|off| off + 8 <= data.len())
            .map(|off| IrConfigElement {
                element_flags: get_u16(data, off),
                vol_dev_handle: get_u16(data, off + 2),
                reason_code: data[off + 4],
                phys_disk_num: data[off + 5],
                phys_disk_dev_handle: get_u16(data, off + 6),
            })
            .collect();
        Self {
            flags: get_u32(data, 4),
            elements,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; 8 + self.elements.len() * 8];
        data[0] = self.elements.len() as u8;
        put_u32(&mut data, 4, self.flags);
        for (i, el) in self.elements.iter().enumerate() {
            let off = 8 + i * 8;
            put_u16(&mut data, off, el.element_flags);
            put_u16(&mut data, off + 2, el.vol_dev_handle);
            data[off + 4] = el.reason_code;
            data[off + 5] = el.phys_disk_num;
            put_u16(&mut data, off + 6, el.phys_disk_dev_handle);
        }
        data
    }
}

pub const IR_VOLUME_RC_STATUS_FLAGS_CHANGED: u8 = 0x02;
pub const IR_VOLUME_RC_STATE_CHANGED: u8 = 0x03;

/// IR volume event data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrVolumeEvent {
    pub vol_dev_handle: u16,
    pub reason_code: u8,
    pub new_value: u32,
    pub previous_value: u32,
}

impl IrVolumeEvent {
    pub const SIZE: usize = 12;

    pub fn decode(data: &[u8]) -> Option<Self> {
        (data.len() >= Self::SIZE).then(|| Self {
            vol_dev_handle: get_u16(data, 0),
            reason_code: data[2],
            new_value: get_u32(data, 4),
            previous_value: get_u32(data, 8),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; Self::SIZE];
        put_u16(&mut data, 0, self.vol_dev_handle);
        data[2] = self.reason_code;
        put_u32(&mut data, 4, self.new_value);
        put_u32(&mut data, 8, self.previous_value);
        data
    }
}

pub const IR_RAIDOP_RESYNC: u8 = 0x00;

/// IR operation status event data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IrOperationStatus {
    pub vol_dev_handle: u16,
    pub operation: u8,
    pub percent: u8,
}

impl IrOperationStatus {
    pub const SIZE: usize = 8;

    pub fn decode(data: &[u8]) -> Option<Self> {
        (data.len() >= Self::SIZE).then(|| Self {
            vol_dev_handle: get_u16(data, 0),
            operation: data[4],
            percent: data[5],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; Self::SIZE];
        put_u16(&mut data, 0, self.vol_dev_handle);
        data[4] = self.operation;
        data[5] = self.percent;
        data
    }
}

pub const SAS_DISCOVERY_RC_STARTED: u8 = 0x01;
pub const SAS_DISCOVERY_RC_COMPLETED: u8 = 0x02;

/// SAS discovery event data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SasDiscovery {
    pub reason_code: u8,
    pub discovery_status: u32,
}

impl SasDiscovery {
    pub const SIZE: usize = 8;

    pub fn decode(data: &[u8]) -> Option<Self> {
        (data.len() >= Self::SIZE).then(|| Self {
            reason_code: data[1],
            discovery_status: get_u32(data, 4),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = vec![0u8; Self::SIZE];
        data[1] = self.reason_code;
        put_u32(&mut data, 4, self.discovery_status);
        data
    }
}
