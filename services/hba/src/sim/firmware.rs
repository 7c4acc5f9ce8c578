//! Firmware side of the simulated IOC

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::mpsc::SyncSender;

use crate::dma::HostDma;
use crate::mpi::Request;
use crate::mpi::{
    get_u16, put_u32, ConfigReply, ConfigRequest, EventAckRequest,
    EventNotificationRequest, EventReply, IocFactsReply, IocInitRequest, PortFactsReply,
    RaidActionReply, RaidActionRequest, ReplyHeader, SasIoUnitControlRequest, ScsiIoErrorReply,
    ScsiIoRequest, TaskMgmtRequest, CONFIG_ACTION_PAGE_HEADER, CONFIG_ACTION_PAGE_READ_CURRENT,
    CONFIG_ACTION_PAGE_WRITE_CURRENT, EVENT_DATA_OFFSET, EVENT_EVENT_CHANGE,
    EVENT_IR_CONFIGURATION_CHANGE_LIST, EVENT_SAS_TOPOLOGY_CHANGE_LIST, FUNCTION_CONFIG,
    FUNCTION_EVENT_ACK, FUNCTION_EVENT_NOTIFICATION, FUNCTION_HANDSHAKE, FUNCTION_IOC_FACTS,
    FUNCTION_IOC_INIT, FUNCTION_IOC_MESSAGE_UNIT_RESET, FUNCTION_OFFSET, FUNCTION_PORT_ENABLE,
    FUNCTION_PORT_FACTS, FUNCTION_RAID_ACTION, FUNCTION_SAS_IO_UNIT_CONTROL, FUNCTION_SCSI_IO,
    FUNCTION_SCSI_TASK_MGMT, IOCSTATUS_CONFIG_INVALID_PAGE, IOCSTATUS_SCSI_DATA_UNDERRUN,
    IOCSTATUS_SCSI_DEVICE_NOT_THERE, IOCSTATUS_SCSI_IOC_TERMINATED, IOCSTATUS_SUCCESS,
    RAID_ACTION_CHANGE_VOL_WRITE_CACHE, RAID_VOL_WRITE_CACHE_MASK, SAS_OP_REMOVE_DEVICE,
    SCSI_IO_CONTROL_READ, SCSI_IO_SIZE, SCSI_STATE_AUTOSENSE_VALID, SCSI_STATUS_CHECK_COND,
    SCSI_STATUS_GOOD, TASK_TARGET_RESET,
};
use crate::config::{
    PAGE_TYPE_EXTENDED, RAID_VOL_SETTINGS_CACHE_ENABLED, RAID_VOL_SETTINGS_CACHE_MASK,
};
use crate::regs::{
    HostDiag, IntrMask, IntrStatus, IocState, DOORBELL_DATA_MASK, DOORBELL_INUSE,
    DOORBELL_WHOINIT_HOST, WRITESEQ_KEYS, WRITESEQ_LOCK,
};
use crate::ring::{
    RequestDescriptor, REPLY_DESCR_ADDRESS_REPLY, REPLY_DESCR_SCSI_IO_SUCCESS, REPLY_DESCR_SIZE,
};
use crate::sgl::{SgeFormat, SglLayout};

use super::pages::Model;
use super::{SimConfig, SimIoc};

/// IOC status for functions the simulated firmware does not implement
const IOCSTATUS_INVALID_FUNCTION: u16 = 0x0001;
/// IOC status for config actions other than header, read and write
const IOCSTATUS_CONFIG_INVALID_ACTION: u16 = 0x0020;

/// Longest scatter/gather list the firmware will walk
const MAX_SGL_ELEMENTS: usize = 256;

/// Fixed-format sense data length
const SENSE_DATA_LEN: usize = 18;

/// Handshake mailbox
enum Mailbox {
    Idle,
    /// Collecting a request of `expected` dwords
    Receiving { expected: usize, dwords: Vec<u32> },
    /// Handing out a reply 16 bits at a time
    Sending { words: Vec<u16>, pos: usize },
}

/// A reply waiting for room on the post ring
struct Deferred {
    kind: u8,
    smid: u16,
    /// Address replies carry a frame
    frame: Option<Vec<u8>>,
    /// Told which frame the reply landed in
    notify: Option<SyncSender<(u32, u64)>>,
}

/// A SCSI command parked by `hold_target`
pub(super) struct Held {
    smid: u16,
    handle: u16,
}

/// Queues the host set up with IOC init
pub(super) struct Queues {
    request_base: u64,
    request_size: usize,
    sense_high: u32,
    reply_high: u32,
    reply_size: usize,
    format: SgeFormat,

    post_base: u64,
    post_depth: usize,
    /// Next post ring entry the IOC fills
    post_index: usize,
    /// Next post ring entry the host consumes
    host_post_index: usize,

    free_base: u64,
    free_depth: usize,
    /// Next free ring entry the IOC reads
    free_read: usize,
    /// The first host index write only seeds the ring
    seeding: bool,
    free: VecDeque<u32>,

    /// Frames posted and not yet handed back
    pub outstanding: BTreeSet<u32>,
    /// Times each frame came back
    returns: BTreeMap<u32, u64>,
    deferred: VecDeque<Deferred>,
}

impl Queues {
    fn unconsumed(&self) -> usize {
        (self.post_index + self.post_depth - self.host_post_index) % self.post_depth
    }

    fn request_addr(&self, smid: u16) -> u64 {
        self.request_base + smid as u64 * self.request_size as u64
    }

    fn address_reply(&mut self, smid: u16, frame: Vec<u8>) {
        self.deferred.push_back(Deferred {
            kind: REPLY_DESCR_ADDRESS_REPLY,
            smid,
            frame: Some(frame),
            notify: None,
        });
    }

    fn success(&mut self, smid: u16) {
        self.deferred.push_back(Deferred {
            kind: REPLY_DESCR_SCSI_IO_SUCCESS,
            smid,
            frame: None,
            notify: None,
        });
    }

    /// Frame sized for this IOC with room for every reply layout
    fn blank(&self) -> Vec<u8> {
        vec![0u8; self.reply_size.max(IocFactsReply::SIZE)]
    }
}

pub(super) struct State {
    pub ioc: IocState,
    whoinit: u32,
    port_type: u8,
    port_enable_status: u16,
    reset_reads: u32,
    diag_progress: usize,
    dwre: bool,
    pub mask: u32,

    mailbox: Mailbox,
    ioc2sys: bool,
    /// Raise the doorbell interrupt after the next status read
    arm_on_read: bool,
    pub descr_low: u32,

    pub queues: Option<Queues>,
    pub events: Option<EventNotificationRequest>,

    pub hard_resets: u32,
    pub violations: u32,
    pub tm_log: Vec<u16>,
    pub removed: Vec<u16>,
    pub acks: Vec<(u16, u32)>,

    pub holding: BTreeSet<u16>,
    pub held: Vec<Held>,
    pub check: BTreeMap<u16, u8>,
    /// Page length in dwords reported in headers, by page type
    pub short_pages: BTreeMap<u8, u8>,

    pub model: Model,
}

impl State {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            ioc: config.initial_state,
            whoinit: config.whoinit,
            port_type: config.port_type,
            port_enable_status: config.port_enable_status,
            reset_reads: config.reset_reads,
            diag_progress: 0,
            dwre: false,
            mask: IntrMask::all().bits(),
            mailbox: Mailbox::Idle,
            ioc2sys: false,
            arm_on_read: false,
            descr_low: 0,
            queues: None,
            events: None,
            hard_resets: 0,
            violations: 0,
            tm_log: Vec::new(),
            removed: Vec::new(),
            acks: Vec::new(),
            holding: BTreeSet::new(),
            held: Vec::new(),
            check: BTreeMap::new(),
            short_pages: BTreeMap::new(),
            model: Model::new(config),
        }
    }

    /// Drops everything the host set up
    fn clear_runtime(&mut self) {
        self.mailbox = Mailbox::Idle;
        self.ioc2sys = false;
        self.arm_on_read = false;
        self.queues = None;
        self.events = None;
        self.holding.clear();
        self.held.clear();
        self.mask = IntrMask::all().bits();
    }

    pub fn returns(&self, addr: u32) -> u64 {
        self.queues
            .as_ref()
            .and_then(|q| q.returns.get(&addr).copied())
            .unwrap_or(0)
    }

    // =========================================================================
    // Registers
    // =========================================================================

    pub fn doorbell(&mut self) -> u32 {
        if self.reset_reads > 0 {
            self.reset_reads -= 1;
            return 0;
        }
        let mut value = self.ioc as u32 | self.whoinit;
        match &self.mailbox {
            Mailbox::Idle => {}
            Mailbox::Receiving { .. } => value |= DOORBELL_INUSE,
            Mailbox::Sending { words, pos } => {
                value |= DOORBELL_INUSE;
                value |= words.get(*pos).copied().unwrap_or(0) as u32 & DOORBELL_DATA_MASK;
            }
        }
        value
    }

    pub fn intr_status(&mut self) -> u32 {
        let mut status = IntrStatus::empty();
        if self.ioc2sys {
            status |= IntrStatus::IOC2SYSDB;
        }
        if self.arm_on_read {
            self.arm_on_read = false;
            self.ioc2sys = true;
        }
        if let Some(q) = &self.queues {
            if q.post_index != q.host_post_index {
                status |= IntrStatus::REPLY;
            }
        }
        status.bits()
    }

    pub fn host_diag(&self) -> u32 {
        if self.dwre {
            HostDiag::DWRE.bits()
        } else {
            0
        }
    }

    /// True while the reply interrupt is unmasked and descriptors wait
    pub fn irq_pending(&self) -> bool {
        self.mask & IntrMask::REPLY.bits() == 0
            && self.queues.as_ref().is_some_and(|q| q.post_index != q.host_post_index)
    }

    pub fn doorbell_write(&mut self, value: u32, config: &SimConfig) {
        let complete = match &mut self.mailbox {
            Mailbox::Idle => {
                self.doorbell_function(value);
                return;
            }
            Mailbox::Receiving { expected, dwords } => {
                dwords.push(value);
                dwords.len() >= *expected
            }
            Mailbox::Sending { .. } => {
                log::warn!("sim: doorbell write while replying");
                return;
            }
        };
        if complete {
            self.answer(config);
        }
    }

    fn doorbell_function(&mut self, value: u32) {
        let function = (value >> 24) as u8;
        match function {
            FUNCTION_HANDSHAKE => {
                let expected = ((value >> 16) & 0xFF) as usize;
                self.mailbox = Mailbox::Receiving {
                    expected,
                    dwords: Vec::with_capacity(expected),
                };
                self.ioc2sys = true;
            }
            FUNCTION_IOC_MESSAGE_UNIT_RESET => {
                log::debug!("sim: message unit reset");
                self.clear_runtime();
                self.ioc = IocState::Ready;
            }
            _ => log::debug!("sim: doorbell function {:#04x} ignored", function),
        }
    }

    /// Runs the collected handshake request and starts handing out the reply
    fn answer(&mut self, config: &SimConfig) {
        let dwords = match std::mem::replace(&mut self.mailbox, Mailbox::Idle) {
            Mailbox::Receiving { dwords, .. } => dwords,
            _ => return,
        };
        let request: Vec<u8> = dwords.iter().flat_map(|d| d.to_le_bytes()).collect();
        let mut reply = self.handshake(&request, config);
        let len = reply.get(2).map_or(0, |&n| n as usize * 4);
        reply.resize(len, 0);
        let words = reply
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.mailbox = Mailbox::Sending { words, pos: 0 };
        self.arm_on_read = true;
    }

    pub fn clear_doorbell_intr(&mut self) {
        self.ioc2sys = false;
        let Mailbox::Sending { words, pos } = &mut self.mailbox else {
            return;
        };
        *pos += 1;
        let done = *pos >= words.len();
        self.ioc2sys = true;
        if done {
            self.mailbox = Mailbox::Idle;
        }
    }

    pub fn write_sequence(&mut self, value: u32, config: &SimConfig) {
        if value == WRITESEQ_LOCK {
            self.dwre = false;
            self.diag_progress = 0;
            return;
        }
        if WRITESEQ_KEYS.get(self.diag_progress) == Some(&value) {
            self.diag_progress += 1;
        } else if value == WRITESEQ_KEYS[0] {
            self.diag_progress = 1;
        } else {
            self.diag_progress = 0;
        }
        if self.diag_progress == WRITESEQ_KEYS.len() {
            self.diag_progress = 0;
            self.dwre = !config.diag_locked;
        }
    }

    pub fn host_diag_write(&mut self, value: u32, config: &SimConfig) {
        if !self.dwre || value & HostDiag::RESET_ADAPTER.bits() == 0 {
            return;
        }
        log::debug!("sim: adapter reset");
        self.clear_runtime();
        self.ioc = IocState::Ready;
        self.whoinit = 0;
        self.reset_reads = config.reset_reads;
        self.hard_resets += 1;
    }

    pub fn post_host_index(&mut self, value: u32) {
        if let Some(q) = &mut self.queues {
            q.host_post_index = value as usize % q.post_depth;
        }
    }

    /// Takes the frames the host handed back
    pub fn free_host_index(&mut self, value: u32, dma: &HostDma) {
        let Some(q) = &mut self.queues else {
            return;
        };
        let target = value as usize % q.free_depth;
        while q.free_read != target {
            let mut entry = [0u8; 4];
            if let Err(e) = dma.read_at(q.free_base + q.free_read as u64 * 4, &mut entry) {
                log::warn!("sim: unreadable free ring: {}", e);
                break;
            }
            let addr = u32::from_le_bytes(entry);
            if !q.seeding && !q.outstanding.remove(&addr) {
                log::warn!("sim: frame {:#x} returned but not outstanding", addr);
                self.violations += 1;
            }
            *q.returns.entry(addr).or_insert(0) += 1;
            q.free.push_back(addr);
            q.free_read = (q.free_read + 1) % q.free_depth;
        }
        q.seeding = false;
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    fn handshake(&mut self, request: &[u8], config: &SimConfig) -> Vec<u8> {
        let function = request.get(FUNCTION_OFFSET).copied().unwrap_or(0xFF);
        match function {
            FUNCTION_IOC_FACTS => {
                let mut frame = vec![0u8; IocFactsReply::SIZE];
                IocFactsReply {
                    msg_version_min: config.msg_version_min,
                    msg_version_maj: 0x02,
                    whoinit: (self.whoinit >> 24) as u8,
                    request_credit: config.request_credit,
                    capabilities: config.capabilities,
                    fw_version: [0, 0, 0, 20],
                    ioc_request_frame_size: config.ioc_request_frame_size,
                    max_targets: config.max_targets,
                    max_reply_post_depth: config.max_reply_post_depth,
                    reply_frame_size: config.reply_frame_size,
                    max_volumes: config.max_volumes,
                    ..Default::default()
                }
                .encode(&mut frame);
                frame
            }
            FUNCTION_IOC_INIT if request.len() >= IocInitRequest::SIZE => {
                let status = self.ioc_init(&IocInitRequest::decode(request), config);
                handshake_status(FUNCTION_IOC_INIT, status)
            }
            _ => {
                log::debug!("sim: handshake function {:#04x} not supported", function);
                handshake_status(function, IOCSTATUS_INVALID_FUNCTION)
            }
        }
    }

    fn ioc_init(&mut self, init: &IocInitRequest, config: &SimConfig) -> u16 {
        if config.init_status != IOCSTATUS_SUCCESS {
            return config.init_status;
        }
        if init.reply_post_depth == 0 || init.reply_free_depth == 0 || init.request_frame_size == 0 {
            return IOCSTATUS_INVALID_FUNCTION;
        }

        let format = if matches!(config.msg_version_min, 0x05 | 0x06) {
            SgeFormat::Ieee
        } else {
            SgeFormat::Legacy
        };
        self.queues = Some(Queues {
            request_base: init.request_base,
            request_size: init.request_frame_size as usize * 4,
            sense_high: init.sense_address_high,
            reply_high: init.reply_address_high,
            reply_size: config.reply_frame_size as usize * 4,
            format,
            post_base: init.reply_post_queue,
            post_depth: init.reply_post_depth as usize,
            post_index: 0,
            host_post_index: 0,
            free_base: init.reply_free_queue,
            free_depth: init.reply_free_depth as usize,
            free_read: 0,
            seeding: true,
            free: VecDeque::new(),
            outstanding: BTreeSet::new(),
            returns: BTreeMap::new(),
            deferred: VecDeque::new(),
        });
        self.events = None;
        self.ioc = IocState::Operational;
        self.whoinit = DOORBELL_WHOINIT_HOST;
        log::debug!(
            "sim: operational, post depth {} free depth {}",
            init.reply_post_depth,
            init.reply_free_depth
        );
        IOCSTATUS_SUCCESS
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn request(&mut self, descr: RequestDescriptor, dma: &HostDma) {
        if self.ioc != IocState::Operational {
            log::debug!("sim: smid {} posted while {:?}", descr.smid, self.ioc);
            return;
        }
        let Some(q) = &self.queues else {
            return;
        };

        let mut frame = vec![0u8; q.request_size.max(SCSI_IO_SIZE)];
        if let Err(e) = dma.read_at(q.request_addr(descr.smid), &mut frame) {
            log::warn!("sim: unreadable frame for smid {}: {}", descr.smid, e);
            return;
        }

        let smid = descr.smid;
        match frame[FUNCTION_OFFSET] {
            FUNCTION_SCSI_IO => self.scsi_io(smid, &frame, dma),
            FUNCTION_CONFIG => self.config(smid, &frame, dma),
            FUNCTION_PORT_FACTS => self.port_facts(smid),
            FUNCTION_PORT_ENABLE => self.port_enable(smid),
            FUNCTION_EVENT_NOTIFICATION => self.event_notification(smid, &frame),
            FUNCTION_EVENT_ACK => {
                let ack = EventAckRequest::decode(&frame);
                self.acks.push((ack.event, ack.context));
                self.simple_reply(smid, FUNCTION_EVENT_ACK, IOCSTATUS_SUCCESS);
            }
            FUNCTION_SCSI_TASK_MGMT => self.task_mgmt(smid, &frame),
            FUNCTION_SAS_IO_UNIT_CONTROL => {
                let request = SasIoUnitControlRequest::decode(&frame);
                let status = if request.operation == SAS_OP_REMOVE_DEVICE {
                    self.removed.push(request.dev_handle);
                    IOCSTATUS_SUCCESS
                } else {
                    IOCSTATUS_INVALID_FUNCTION
                };
                self.simple_reply(smid, FUNCTION_SAS_IO_UNIT_CONTROL, status);
            }
            FUNCTION_RAID_ACTION => self.raid_action(smid, &frame),
            function => {
                log::debug!("sim: function {:#04x} not supported", function);
                self.simple_reply(smid, function, IOCSTATUS_INVALID_FUNCTION);
            }
        }
    }

    fn simple_reply(&mut self, smid: u16, function: u8, status: u16) {
        let Some(q) = &mut self.queues else {
            return;
        };
        let mut frame = q.blank();
        reply_header(function, status).encode(&mut frame);
        q.address_reply(smid, frame);
    }

    fn port_facts(&mut self, smid: u16) {
        let port_type = self.port_type;
        let Some(q) = &mut self.queues else {
            return;
        };
        let mut frame = q.blank();
        PortFactsReply {
            header: reply_header(FUNCTION_PORT_FACTS, IOCSTATUS_SUCCESS),
            port_type,
        }
        .encode(&mut frame);
        q.address_reply(smid, frame);
    }

    fn event_notification(&mut self, smid: u16, frame: &[u8]) {
        self.events = Some(EventNotificationRequest::decode(frame));
        let Some(q) = &mut self.queues else {
            return;
        };
        let mut reply = q.blank();
        EventReply {
            event: EVENT_EVENT_CHANGE,
            ..Default::default()
        }
        .encode(&mut reply);
        q.address_reply(smid, reply);
    }

    /// Reports the domain, then completes the request
    fn port_enable(&mut self, smid: u16) {
        if self.port_enable_status != IOCSTATUS_SUCCESS {
            self.simple_reply(smid, FUNCTION_PORT_ENABLE, self.port_enable_status);
            return;
        }
        let topology = EventReply {
            event: EVENT_SAS_TOPOLOGY_CHANGE_LIST,
            data: self.model.topology().encode(),
            ..Default::default()
        };
        let raid = EventReply {
            event: EVENT_IR_CONFIGURATION_CHANGE_LIST,
            data: self.model.ir_config().encode(),
            ..Default::default()
        };
        for event in [topology, raid] {
            self.queue_event(event, None);
        }
        self.simple_reply(smid, FUNCTION_PORT_ENABLE, IOCSTATUS_SUCCESS);
    }

    fn task_mgmt(&mut self, smid: u16, frame: &[u8]) {
        let request = TaskMgmtRequest::decode(frame);
        if request.task_type == TASK_TARGET_RESET {
            log::debug!("sim: target reset {:#06x}", request.dev_handle);
            self.tm_log.push(request.dev_handle);

            let (terminated, kept) = std::mem::take(&mut self.held)
                .into_iter()
                .partition(|h| h.handle == request.dev_handle);
            self.held = kept;
            for held in terminated {
                self.scsi_error(held.smid, held.handle, IOCSTATUS_SCSI_IOC_TERMINATED, 0);
            }
        }
        self.simple_reply(smid, FUNCTION_SCSI_TASK_MGMT, IOCSTATUS_SUCCESS);
    }

    fn raid_action(&mut self, smid: u16, frame: &[u8]) {
        let request = RaidActionRequest::decode(frame);
        let mut status = IOCSTATUS_INVALID_FUNCTION;
        let mut action_data = 0;
        if request.action == RAID_ACTION_CHANGE_VOL_WRITE_CACHE {
            if let Some(vol) = self.model.volume_mut(request.vol_handle) {
                if !vol.cache_pinned {
                    let wanted = request.action_data & RAID_VOL_WRITE_CACHE_MASK;
                    vol.settings = (vol.settings & !RAID_VOL_SETTINGS_CACHE_MASK) | wanted as u16;
                }
                action_data = (vol.settings & RAID_VOL_SETTINGS_CACHE_MASK) as u32;
                log::debug!(
                    "sim: volume {:#06x} write cache {}",
                    vol.handle,
                    vol.settings & RAID_VOL_SETTINGS_CACHE_MASK == RAID_VOL_SETTINGS_CACHE_ENABLED
                );
                status = IOCSTATUS_SUCCESS;
            }
        }

        let Some(q) = &mut self.queues else {
            return;
        };
        let mut reply = q.blank();
        RaidActionReply {
            header: reply_header(FUNCTION_RAID_ACTION, status),
            action_data,
        }
        .encode(&mut reply);
        q.address_reply(smid, reply);
    }

    fn config(&mut self, smid: u16, frame: &[u8], dma: &HostDma) {
        let request = ConfigRequest::decode(frame);
        let len = (request.sge_flags_length & 0x00FF_FFFF) as usize;
        let mut reply = ConfigReply {
            header: reply_header(FUNCTION_CONFIG, IOCSTATUS_SUCCESS),
            action: request.action,
            ext_page_length: request.ext_page_length,
            ext_page_type: request.ext_page_type,
            page_header: request.header,
        };

        match (request.action, self.model.page(&request)) {
            (_, None) => reply.header.ioc_status = IOCSTATUS_CONFIG_INVALID_PAGE,
            (CONFIG_ACTION_PAGE_HEADER, Some(page)) => {
                reply.page_header = [page[0], page[1], page[2], page[3]];
                if page[3] == PAGE_TYPE_EXTENDED && page.len() >= 8 {
                    reply.ext_page_length = get_u16(&page, 4);
                    reply.ext_page_type = page[6];
                }
                if let Some(&dwords) = self.short_pages.get(&page[3]) {
                    if page[3] == PAGE_TYPE_EXTENDED {
                        reply.ext_page_length = dwords as u16;
                    } else {
                        reply.page_header[1] = dwords;
                    }
                }
            }
            (CONFIG_ACTION_PAGE_READ_CURRENT, Some(page)) => {
                let n = len.min(page.len());
                if let Err(e) = dma.write_at(request.sge_address, &page[..n]) {
                    log::warn!("sim: config read into bad buffer: {}", e);
                }
            }
            (CONFIG_ACTION_PAGE_WRITE_CURRENT, Some(_)) => {
                let mut body = vec![0u8; len];
                let ok = dma.read_at(request.sge_address, &mut body).is_ok()
                    && self.model.write_page(&request, &body);
                if !ok {
                    reply.header.ioc_status = IOCSTATUS_CONFIG_INVALID_PAGE;
                }
            }
            (action, Some(_)) => {
                log::debug!("sim: config action {:#04x} not supported", action);
                reply.header.ioc_status = IOCSTATUS_CONFIG_INVALID_ACTION;
            }
        }

        let Some(q) = &mut self.queues else {
            return;
        };
        let mut out = q.blank();
        reply.encode(&mut out);
        q.address_reply(smid, out);
    }

    fn scsi_io(&mut self, smid: u16, frame: &[u8], dma: &HostDma) {
        let request = ScsiIoRequest::decode(frame);
        let handle = request.dev_handle;

        if !self.model.addressable(handle) {
            self.scsi_error(smid, handle, IOCSTATUS_SCSI_DEVICE_NOT_THERE, 0);
            return;
        }
        if self.holding.contains(&handle) {
            log::trace!("sim: holding smid {} for {:#06x}", smid, handle);
            self.held.push(Held { smid, handle });
            return;
        }
        if let Some(key) = self.check.remove(&handle) {
            self.check_condition(smid, &request, key, dma);
            return;
        }
        self.transfer(smid, &request, dma);
    }

    /// Finishes the held commands for `handle` normally
    pub fn release(&mut self, handle: u16, dma: &HostDma) {
        let (released, kept) = std::mem::take(&mut self.held)
            .into_iter()
            .partition(|h: &Held| h.handle == handle);
        self.held = kept;

        for held in released {
            let Some(q) = &self.queues else {
                return;
            };
            let mut frame = vec![0u8; q.request_size.max(SCSI_IO_SIZE)];
            if dma.read_at(q.request_addr(held.smid), &mut frame).is_err() {
                continue;
            }
            self.transfer(held.smid, &ScsiIoRequest::decode(&frame), dma);
        }
    }

    fn check_condition(&mut self, smid: u16, request: &ScsiIoRequest, key: u8, dma: &HostDma) {
        let Some(q) = &mut self.queues else {
            return;
        };
        let mut sense = [0u8; SENSE_DATA_LEN];
        sense[0] = 0x70;
        sense[2] = key;
        sense[7] = (SENSE_DATA_LEN - 8) as u8;
        let addr = (q.sense_high as u64) << 32 | request.sense_address_low as u64;
        if let Err(e) = dma.write_at(addr, &sense) {
            log::warn!("sim: sense buffer unreachable: {}", e);
        }

        let mut frame = q.blank();
        ScsiIoErrorReply {
            header: reply_header(FUNCTION_SCSI_IO, IOCSTATUS_SUCCESS),
            dev_handle: request.dev_handle,
            scsi_status: SCSI_STATUS_CHECK_COND,
            scsi_state: SCSI_STATE_AUTOSENSE_VALID,
            sense_count: SENSE_DATA_LEN as u32,
            ..Default::default()
        }
        .encode(&mut frame);
        q.address_reply(smid, frame);
    }

    /// Moves the data and completes the command
    fn transfer(&mut self, smid: u16, request: &ScsiIoRequest, dma: &HostDma) {
        let Some(q) = &mut self.queues else {
            return;
        };
        let read = request.control & SCSI_IO_CONTROL_READ != 0;
        let wanted = request.data_length as usize;
        let layout = SglLayout {
            format: q.format,
            chain_sge: 0,
            max_sgl: 0,
        };
        let sge = q.format.size();

        let mut addr = q.request_addr(smid) + SCSI_IO_SIZE as u64;
        let mut moved = 0usize;
        for _ in 0..MAX_SGL_ELEMENTS {
            let mut raw = [0u8; 16];
            if let Err(e) = dma.read_at(addr, &mut raw[..sge]) {
                log::warn!("sim: smid {} sgl unreadable: {}", smid, e);
                break;
            }
            let el = layout.decode(&raw[..sge]);
            if el.chain {
                addr = el.addr;
                continue;
            }

            let n = (el.len as usize).min(wanted - moved);
            if read && n > 0 {
                let data: Vec<u8> = (moved..moved + n)
                    .map(|off| SimIoc::pattern(request.dev_handle, off))
                    .collect();
                if let Err(e) = dma.write_at(el.addr, &data) {
                    log::warn!("sim: smid {} data buffer unreachable: {}", smid, e);
                    break;
                }
            }
            moved += n;
            if el.end_of_list || moved == wanted {
                break;
            }
            addr += sge as u64;
        }

        if moved < wanted {
            self.scsi_error(smid, request.dev_handle, IOCSTATUS_SCSI_DATA_UNDERRUN, moved as u32);
        } else if let Some(q) = &mut self.queues {
            q.success(smid);
        }
    }

    fn scsi_error(&mut self, smid: u16, handle: u16, status: u16, transfer_count: u32) {
        let Some(q) = &mut self.queues else {
            return;
        };
        let mut frame = q.blank();
        ScsiIoErrorReply {
            header: reply_header(FUNCTION_SCSI_IO, status),
            dev_handle: handle,
            scsi_status: SCSI_STATUS_GOOD,
            transfer_count,
            ..Default::default()
        }
        .encode(&mut frame);
        q.address_reply(smid, frame);
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Queues an event if the host asked for it
    pub fn post_event(&mut self, event: EventReply, notify: Option<SyncSender<(u32, u64)>>) {
        if self.ioc != IocState::Operational {
            log::debug!("sim: event {:#06x} dropped while {:?}", event.event, self.ioc);
            return;
        }
        self.queue_event(event, notify);
    }

    fn queue_event(&mut self, event: EventReply, notify: Option<SyncSender<(u32, u64)>>) {
        if !self.events.is_some_and(|e| e.is_enabled(event.event)) {
            log::debug!("sim: event {:#06x} masked", event.event);
            return;
        }
        let Some(q) = &mut self.queues else {
            return;
        };
        if EVENT_DATA_OFFSET + event.data.len() > q.reply_size {
            log::warn!("sim: event {:#06x} does not fit a reply frame", event.event);
            return;
        }
        let mut frame = q.blank();
        event.encode(&mut frame);
        q.deferred.push_back(Deferred {
            kind: REPLY_DESCR_ADDRESS_REPLY,
            smid: 0,
            frame: Some(frame),
            notify,
        });
    }

    // =========================================================================
    // Reply Post
    // =========================================================================

    /// Posts queued replies while there is ring space and free frames
    pub fn flush(&mut self, dma: &HostDma) {
        if self.ioc != IocState::Operational {
            return;
        }
        let Some(q) = &mut self.queues else {
            return;
        };

        while q.unconsumed() + 1 < q.post_depth {
            let Some(next) = q.deferred.front() else {
                break;
            };
            let data = match &next.frame {
                None => 0,
                Some(frame) => {
                    let Some(addr) = q.free.pop_front() else {
                        break;
                    };
                    let full = (q.reply_high as u64) << 32 | addr as u64;
                    let n = q.reply_size.min(frame.len());
                    if let Err(e) = dma.write_at(full, &frame[..n]) {
                        log::warn!("sim: reply frame {:#x} unreachable: {}", full, e);
                    }
                    addr
                }
            };
            let Some(item) = q.deferred.pop_front() else {
                break;
            };
            if item.frame.is_some() {
                q.outstanding.insert(data);
                if let Some(notify) = item.notify {
                    let seen = q.returns.get(&data).copied().unwrap_or(0);
                    let _ = notify.try_send((data, seen));
                }
            }

            let mut descr = [0u8; REPLY_DESCR_SIZE];
            descr[..4].copy_from_slice(&(item.kind as u32 | (item.smid as u32) << 16).to_le_bytes());
            put_u32(&mut descr, 4, data);
            let slot = q.post_base + (q.post_index * REPLY_DESCR_SIZE) as u64;
            if let Err(e) = dma.write_at(slot, &descr) {
                log::warn!("sim: post ring unreachable: {}", e);
                break;
            }
            q.post_index = (q.post_index + 1) % q.post_depth;
        }
    }
}

fn reply_header(function: u8, status: u16) -> ReplyHeader {
    ReplyHeader {
        msg_length: (ReplyHeader::SIZE / 4) as u8,
        function,
        ioc_status: status,
        ..Default::default()
    }
}

/// Handshake reply carrying only a header
fn handshake_status(function: u8, status: u16) -> Vec<u8> {
    let mut frame = vec![0u8; ReplyHeader::SIZE];
    reply_header(function, status).encode(&mut frame);
    frame
}
