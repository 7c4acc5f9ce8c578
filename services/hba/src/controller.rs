//! # Controller
//!
//! One attached IOC. [`Controller::attach`] negotiates with the firmware and
//! builds every other component; after it returns the controller accepts SCSI
//! transfers and management queries from any thread.
//!
//! ## Startup
//!
//! ```text
//! facts ─► bring-up ─► allocate ─► IOC init ─► operational ─► seed replies
//!   ─► board info ─► port facts ─► target map ─► coalescing ─► events
//!   ─► port enable ─► unmask
//! ```
//!
//! Everything up to port enable completes by polling; interrupts are masked
//! until the very last step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use spin::Once;

use crate::config::*;
use crate::devices::{DeviceTable, TargetMap};
use crate::dispatch::{Dispatcher, EventSink, SubmitMode};
use crate::dma::DmaAllocator;
use crate::doorbell::Doorbell;
use crate::events::Events;
use crate::mpi::*;
use crate::pool::CommandPool;
use crate::raid::{DiskInfo, Inquiry, Raid, VolumeInfo, VolumeStatus};
use crate::recovery::{Recovery, Watchdog};
use crate::regs::{RegisterBlock, DOORBELL_STATE, DOORBELL_STATE_OPER, REG_DOORBELL};
use crate::reply::ReplyPool;
use crate::ring::Rings;
use crate::scsi::{Direction, Transfer, TransferResult, XferError, CDB_MAX, SENSE_LEN};
use crate::sgl::{SgeFormat, SglLayout};
use crate::workqueue::WorkQueue;
use crate::{HbaError, HbaResult};

/// Message version sent in IOC init
const MPI_VERSION: u16 = 0x0200;

/// Smallest usable reply post queue
const MIN_POST_DEPTH: usize = 16;

/// Host frame size unless the IOC wants bigger frames
const DEFAULT_REQUEST_SIZE: usize = 512;

// =============================================================================
// Host Glue
// =============================================================================

/// Upper layer that exposes targets to the rest of the system
pub trait HostBus: Send + Sync {
    /// A target went away; the upper layer must forget it
    fn detach_target(&self, target: u16);
}

/// Bus glue that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBus;

impl HostBus for NullBus {
    fn detach_target(&self, _target: u16) {}
}

/// Weak handle the interrupt glue holds on to
#[derive(Clone)]
pub struct InterruptLine {
    inner: Weak<Inner>,
}

impl InterruptLine {
    /// Runs the reply path. False once the controller is gone or nothing
    /// was pending.
    pub fn raise(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.interrupt(),
            None => false,
        }
    }
}

// =============================================================================
// Sizing
// =============================================================================

/// Queue and frame sizes negotiated from the IOC facts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizing {
    pub max_cmds: usize,
    pub num_reply_frames: usize,
    pub post_qdepth: usize,
    pub free_qdepth: usize,
    /// Reply frame size in bytes
    pub reply_size: usize,
    /// IOC request frame size in bytes
    pub ioc_request_size: usize,
    /// Host request frame size in bytes
    pub request_size: usize,
}

impl Sizing {
    pub fn negotiate(facts: &IocFactsReply, max_commands: usize) -> HbaResult<Self> {
        let mut max_cmds = (facts.request_credit as usize).min(max_commands);

        let mut num_reply_frames = max_cmds + 32;
        if num_reply_frames % 16 == 0 {
            num_reply_frames -= 1;
        }

        let mut post_qdepth = (max_cmds + num_reply_frames).next_multiple_of(16);
        let ioc_max = facts.max_reply_post_depth as usize;
        if post_qdepth > ioc_max {
            post_qdepth = ioc_max;
            if post_qdepth < MIN_POST_DEPTH {
                return Err(HbaError::RingTooShallow);
            }
            max_cmds = post_qdepth / 2 - 4;
            num_reply_frames = max_cmds + 4;
        }

        let free_qdepth = num_reply_frames + 16 - num_reply_frames % 16;

        let ioc_request_size = facts.ioc_request_frame_size as usize * 4;
        let request_size = if ioc_request_size > DEFAULT_REQUEST_SIZE {
            (ioc_request_size + 32).next_multiple_of(16)
        } else {
            DEFAULT_REQUEST_SIZE
        };

        Ok(Self {
            max_cmds,
            num_reply_frames,
            post_qdepth,
            free_qdepth,
            reply_size: facts.reply_frame_size as usize * 4,
            ioc_request_size,
            request_size,
        })
    }
}

/// Where volumes and physical disks land in the slot space
pub fn target_map(page: &IocPage8, raid: bool, max_volumes: u16, max_devices: u16) -> TargetMap {
    let mut map = TargetMap::default();
    let mut pad = 0;

    if page.flags & IOC8_FLAGS_RESERVED_TARGETID_0 != 0 {
        pad = 1;
    }

    if raid {
        if page.ir_volume_mapping_flags & IOC8_IRFLAGS_VOLUME_MAPPING_MASK
            == IOC8_IRFLAGS_LOW_VOLUME_MAPPING
        {
            map.vd_id_low += pad;
            pad = max_volumes;
        } else {
            map.vd_id_low = max_devices - max_volumes;
        }
    }

    map.pd_id_start += pad;
    map
}

// =============================================================================
// Controller
// =============================================================================

struct Inner {
    name: String,
    sizing: Sizing,
    layout: SglLayout,
    rings: Arc<Rings>,
    watchdog: Arc<Watchdog>,
    dispatcher: Arc<Dispatcher>,
    devices: Arc<DeviceTable>,
    events: Arc<Events>,
    pages: Arc<ConfigPages>,
    raid: Raid,
    recovery: Once<WorkQueue<u16>>,
    detached: AtomicBool,
}

impl Inner {
    fn interrupt(&self) -> bool {
        if self.detached.load(Ordering::Acquire) {
            return false;
        }
        self.dispatcher.handle_interrupt()
    }

    /// Masks interrupts, stops every worker and fails what is in flight
    fn shutdown(&self) {
        self.rings.set_interrupts(false);
        self.detached.store(true, Ordering::Release);

        self.watchdog.stop();
        self.dispatcher.abort_all();
        if let Some(queue) = self.recovery.get() {
            queue.shutdown();
        }
        self.events.stop();
        // workers may have posted once more while draining
        self.dispatcher.abort_all();
    }

    /// Watchdog expiry: hand the slot to the recovery worker
    fn escalate(&self, smid: u16) {
        let queued = match self.recovery.get() {
            Some(queue) => queue.try_enqueue(smid).is_ok(),
            None => false,
        };
        if !queued {
            self.watchdog.retry(smid);
        }
    }
}

/// An attached Fusion-MPT controller
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Brings the IOC up and discovers what is attached to it
    pub fn attach(
        regs: Arc<dyn RegisterBlock>,
        dma: &dyn DmaAllocator,
        bus: Arc<dyn HostBus>,
        config: HbaConfig,
    ) -> HbaResult<Self> {
        let name = config.name.clone();
        let doorbell = Doorbell::new(regs.clone(), &config);

        let facts = ioc_facts(&doorbell)
            .inspect_err(|e| log::warn!("{}: unable to get iocfacts: {}", name, e))?;
        let vf_id = facts.vf_id;
        let max_devices = facts.max_volumes as u16 + facts.max_targets;

        doorbell
            .bring_up(facts.capabilities & IOCFACTS_CAPABILITY_EVENT_REPLAY != 0)
            .inspect_err(|e| log::warn!("{}: unable to initialise ioc: {}", name, e))?;

        let sizing = Sizing::negotiate(&facts, config.max_commands)?;
        let format = if facts.is_sas3() {
            SgeFormat::Ieee
        } else {
            SgeFormat::Legacy
        };
        let layout = SglLayout::new(format, sizing.ioc_request_size, sizing.request_size);
        log::debug!(
            "{}: max_cmds {} reply frames {} post depth {} free depth {} request size {}",
            name,
            sizing.max_cmds,
            sizing.num_reply_frames,
            sizing.post_qdepth,
            sizing.free_qdepth,
            sizing.request_size
        );

        let pool = CommandPool::new(dma, sizing.max_cmds, sizing.request_size)
            .inspect_err(|_| log::warn!("{}: unable to allocate ccbs", name))?;
        let rings = Arc::new(
            Rings::new(regs.clone(), dma, sizing.post_qdepth, sizing.free_qdepth)
                .inspect_err(|_| log::warn!("{}: unable to allocate reply queues", name))?,
        );
        let replies = ReplyPool::new(dma, rings.clone(), sizing.num_reply_frames, sizing.reply_size)
            .inspect_err(|_| log::warn!("{}: unable to allocate replies", name))?;

        let init = IocInitRequest {
            whoinit: WHOINIT_HOST_DRIVER,
            vf_id,
            msg_version: MPI_VERSION,
            request_frame_size: (sizing.request_size / 4) as u16,
            reply_post_depth: sizing.post_qdepth as u16,
            reply_free_depth: sizing.free_qdepth as u16,
            sense_address_high: (pool.base_addr() >> 32) as u32,
            reply_address_high: (replies.base_addr() >> 32) as u32,
            request_base: pool.base_addr(),
            reply_post_queue: rings.post_ring_addr(),
            reply_free_queue: rings.free_ring_addr(),
        };
        ioc_init(&doorbell, &init).inspect_err(|e| log::warn!("{}: unable to send iocinit: {}", name, e))?;

        doorbell
            .wait_eq(REG_DOORBELL, DOORBELL_STATE, DOORBELL_STATE_OPER)
            .inspect_err(|_| log::warn!("{}: state: {:#010x}", name, doorbell.read()))?;

        replies.seed_all();
        rings.init_queues();

        let watchdog = Arc::new(Watchdog::new(pool.clone(), config.watchdog_tick));
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            pool.clone(),
            replies,
            rings.clone(),
            watchdog.clone(),
            vf_id,
        ));
        let devices = Arc::new(DeviceTable::new(max_devices as usize));
        let events = Events::new(&config, dispatcher.clone(), devices.clone(), bus, vf_id);
        let pages = Arc::new(ConfigPages::new(&name, dispatcher.clone(), vf_id));
        let raid_ops = Raid::new(&name, pages.clone(), devices.clone(), dispatcher.clone());

        let inner = Arc::new(Inner {
            name: name.clone(),
            sizing,
            layout,
            rings,
            watchdog,
            dispatcher,
            devices,
            events,
            pages,
            raid: raid_ops,
            recovery: Once::new(),
            detached: AtomicBool::new(false),
        });
        let hba = Self { inner };

        if let Err(e) = hba.bring_online(&doorbell, &config, &facts, pool) {
            hba.inner.shutdown();
            return Err(e);
        }
        log::debug!("{}: attached with {} devices", name, hba.inner.devices.len());
        Ok(hba)
    }

    /// Starts the workers, then configures the IOC and enables its port.
    /// Any failure past this point stops every worker again.
    fn bring_online(
        &self,
        doorbell: &Doorbell,
        config: &HbaConfig,
        facts: &IocFactsReply,
        pool: Arc<CommandPool>,
    ) -> HbaResult<()> {
        let inner = &self.inner;
        let name = &inner.name;
        let vf_id = facts.vf_id;
        let raid = facts.capabilities & IOCFACTS_CAPABILITY_INTEGRATED_RAID != 0;
        let max_volumes = facts.max_volumes as u16;
        let max_devices = max_volumes + facts.max_targets;

        inner.events.start(inner.sizing.num_reply_frames)?;
        let sink: Arc<dyn EventSink> = inner.events.clone();
        inner.dispatcher.set_event_sink(Arc::downgrade(&sink));
        drop(sink);

        let recovery = Recovery::new(name, inner.dispatcher.clone(), pool, inner.watchdog.clone());
        let queue = WorkQueue::spawn(&format!("{}rec", name), config.queue_depth, move |smid| {
            recovery.handle(smid)
        })?;
        inner.recovery.call_once(|| queue);

        let weak = Arc::downgrade(inner);
        inner.watchdog.start(name, move |smid| {
            if let Some(inner) = weak.upgrade() {
                inner.escalate(smid);
            }
        })?;

        self.board_info(doorbell)?;

        let port_type = self
            .port_facts(vf_id)
            .inspect_err(|e| log::warn!("{}: unable to get portfacts: {}", name, e))?;

        let page8: IocPage8 = inner
            .pages
            .read(0, SubmitMode::Poll)
            .inspect_err(|e| log::warn!("{}: unable to fetch ioc page 8: {}", name, e))?;
        let map = target_map(&page8, raid, max_volumes, max_devices);
        log::debug!(
            "{}: pd_id_start {} vd_id_low {}",
            name,
            map.pd_id_start,
            map.vd_id_low
        );
        inner.devices.set_target_map(map);

        self.coalescing()
            .inspect_err(|e| log::warn!("{}: unable to configure coalescing: {}", name, e))?;

        if matches!(
            port_type,
            PORT_TYPE_SAS_PHYSICAL | PORT_TYPE_SAS_VIRTUAL | PORT_TYPE_TRI_MODE
        ) {
            inner
                .events
                .enable()
                .inspect_err(|e| log::warn!("{}: unable to enable events: {}", name, e))?;
        }

        self.port_enable(vf_id)
            .inspect_err(|e| log::warn!("{}: unable to enable port: {}", name, e))?;

        inner.events.set_cold(false);
        inner.rings.set_interrupts(true);
        Ok(())
    }

    fn board_info(&self, doorbell: &Doorbell) -> HbaResult<()> {
        let name = &self.inner.name;
        let facts = ioc_facts(doorbell)
            .inspect_err(|e| log::warn!("{}: unable to get iocfacts: {}", name, e))?;
        let page: ManufacturingPage0 = self
            .inner
            .pages
            .read(0, SubmitMode::Poll)
            .inspect_err(|e| log::warn!("{}: unable to fetch manufacturing page 0: {}", name, e))?;

        let [dev, unit, minor, major] = facts.fw_version;
        log::info!(
            "{}: {}, firmware {}.{}.{}.{}{}, MPI {}.{}",
            name,
            page.board_name,
            major,
            minor,
            unit,
            dev,
            if facts.capabilities & IOCFACTS_CAPABILITY_INTEGRATED_RAID != 0 {
                " IR"
            } else {
                ""
            },
            facts.msg_version_maj,
            facts.msg_version_min
        );
        Ok(())
    }

    fn port_facts(&self, vf_id: u8) -> HbaResult<u8> {
        let dispatcher = &self.inner.dispatcher;
        let mut cmd = dispatcher.pool().acquire().ok_or(HbaError::NoCommandSlot)?;
        cmd.encode(&PortFactsRequest { port: 0, vf_id });

        let cmd = dispatcher.submit(cmd, SubmitMode::Poll)?;
        let reply = cmd.reply().ok_or(HbaError::NoReply)?;
        let facts = PortFactsReply::decode(&reply.bytes());
        match facts.header.status() {
            IOCSTATUS_SUCCESS => Ok(facts.port_type),
            status => Err(HbaError::IocStatus(status)),
        }
    }

    fn coalescing(&self) -> HbaResult<()> {
        let pages = &self.inner.pages;
        let mut page: IocPage1 = pages.read(0, SubmitMode::Poll)?;
        if page.flags & IOC1_REPLY_COALESCING == 0 {
            return Ok(());
        }

        log::debug!(
            "{}: turning off reply coalescing (timeout {} depth {})",
            self.inner.name,
            page.coalescing_timeout,
            page.coalescing_depth
        );
        page.flags &= !IOC1_REPLY_COALESCING;
        pages.write(0, &page, SubmitMode::Poll)
    }

    fn port_enable(&self, vf_id: u8) -> HbaResult<()> {
        let dispatcher = &self.inner.dispatcher;
        let mut cmd = dispatcher.pool().acquire().ok_or(HbaError::NoCommandSlot)?;
        cmd.encode(&PortEnableRequest { vf_id });

        let cmd = dispatcher.submit(cmd, SubmitMode::Poll)?;
        let reply = cmd.reply().ok_or(HbaError::NoReply)?;
        match reply.status() {
            IOCSTATUS_SUCCESS => Ok(()),
            status => Err(HbaError::IocStatus(status)),
        }
    }

    // =========================================================================
    // Runtime
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sizing(&self) -> Sizing {
        self.inner.sizing
    }

    pub fn sgl_layout(&self) -> SglLayout {
        self.inner.layout
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.inner.devices
    }

    pub fn config_pages(&self) -> &ConfigPages {
        &self.inner.pages
    }

    pub fn raid(&self) -> &Raid {
        &self.inner.raid
    }

    /// Commands posted and not yet completed
    pub fn outstanding(&self) -> usize {
        self.inner.dispatcher.outstanding()
    }

    /// Runs the reply path; true if the interrupt was ours
    pub fn interrupt(&self) -> bool {
        self.inner.interrupt()
    }

    /// Handle for the interrupt glue that does not keep the controller alive
    pub fn interrupt_line(&self) -> InterruptLine {
        InterruptLine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Starts a SCSI command. `done` runs exactly once, possibly before this
    /// returns.
    pub fn scsi_request<F>(&self, xfer: Transfer, done: F)
    where
        F: FnOnce(TransferResult) + Send + 'static,
    {
        let inner = &self.inner;
        log::trace!(
            "{}: scsi cmd target {} lun {} opcode {:#04x}",
            inner.name,
            xfer.target.target,
            xfer.target.lun,
            xfer.cdb.first().copied().unwrap_or(0)
        );

        if xfer.cdb.len() > CDB_MAX {
            log::debug!("{}: cdb too big {}", inner.name, xfer.cdb.len());
            return done(TransferResult::cdb_too_long());
        }

        let Some(dev) = inner.devices.at_slot(xfer.target.target) else {
            return done(TransferResult::immediate(XferError::SelectionTimeout));
        };

        let Some(mut cmd) = inner.dispatcher.pool().acquire() else {
            return done(TransferResult::immediate(XferError::ResourceShortage));
        };

        let sense_addr = cmd.frame_addr() + (inner.sizing.request_size - SENSE_LEN) as u64;
        cmd.encode(&xfer.request(dev.handle, sense_addr as u32));
        cmd.set_dev_handle(dev.handle);

        if inner
            .layout
            .load(&mut cmd, &xfer.segments, xfer.direction == Direction::Write)
            .is_err()
        {
            return done(TransferResult::immediate(XferError::DriverStuffup));
        }

        let data_len = xfer.data_len;
        if xfer.poll {
            let result = match inner.dispatcher.poll(cmd) {
                Ok(cmd) => TransferResult::from_completion(&cmd, data_len),
                Err(_) => TransferResult::immediate(XferError::DriverStuffup),
            };
            return done(result);
        }

        inner.dispatcher.start(cmd, xfer.timeout, move |cmd| {
            done(TransferResult::from_completion(&cmd, data_len))
        });
    }

    // =========================================================================
    // Management
    // =========================================================================

    pub fn inquiry(&self) -> Inquiry {
        self.inner.raid.inquiry()
    }

    pub fn volume(&self, volid: u16) -> HbaResult<VolumeInfo> {
        self.inner.raid.volume(volid)
    }

    pub fn disk(&self, volid: u16, diskid: usize) -> HbaResult<DiskInfo> {
        self.inner.raid.disk(volid, diskid)
    }

    pub fn volume_state(&self, volid: u16) -> HbaResult<VolumeStatus> {
        self.inner.raid.volume_state(volid)
    }

    pub fn write_cache(&self, volid: u16) -> HbaResult<bool> {
        self.inner.raid.write_cache(volid)
    }

    pub fn set_write_cache(&self, volid: u16, enable: bool) -> HbaResult<()> {
        self.inner.raid.set_write_cache(volid, enable)
    }

    // =========================================================================
    // Detach
    // =========================================================================

    /// Quiesces the IOC interface and releases every DMA region
    pub fn detach(self) {
        self.inner.shutdown();
        log::debug!("{}: detached", self.inner.name);
    }
}

fn ioc_facts(doorbell: &Doorbell) -> HbaResult<IocFactsReply> {
    let reply = doorbell.request(&IocFactsRequest, IocFactsReply::SIZE)?;
    Ok(IocFactsReply::decode(&reply))
}

fn ioc_init(doorbell: &Doorbell, request: &IocInitRequest) -> HbaResult<()> {
    let reply = ReplyHeader::decode(&doorbell.request(request, ReplyHeader::SIZE)?);
    if reply.status() != IOCSTATUS_SUCCESS || reply.ioc_loginfo != 0 {
        return Err(HbaError::IocStatus(reply.status()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pool::Command;
    use crate::regs::IocState;
    use crate::scsi::{DataSegment, Target};
    use crate::sim::{SimConfig, SimIoc};
    use std::sync::mpsc::channel;
    use std::time::{Duration, Instant};

    /// Records every target the controller detaches
    #[derive(Default)]
    pub(crate) struct RecordingBus {
        pub detached: spin::Mutex<Vec<u16>>,
    }

    impl HostBus for RecordingBus {
        fn detach_target(&self, target: u16) {
            self.detached.lock().push(target);
        }
    }

    /// A controller attached to a simulated IOC
    pub(crate) struct Harness {
        pub sim: Arc<SimIoc>,
        pub bus: Arc<RecordingBus>,
        pub hba: Controller,
    }

    impl Harness {
        pub fn attach() -> Self {
            Self::with(SimConfig::default())
        }

        pub fn with(config: SimConfig) -> Self {
            Self::configured(config, HbaConfig::fast())
        }

        pub fn configured(config: SimConfig, hba_config: HbaConfig) -> Self {
            let sim = SimIoc::new(config);
            let bus = Arc::new(RecordingBus::default());
            let hba = Controller::attach(sim.clone(), sim.dma().as_ref(), bus.clone(), hba_config)
                .expect("attach to simulated ioc");
            sim.set_irq(hba.interrupt_line());
            Self { sim, bus, hba }
        }

        /// Takes every free command slot
        pub fn take_slots(&self) -> Vec<Command> {
            let pool = self.hba.inner.dispatcher.pool();
            std::iter::from_fn(|| pool.acquire()).collect()
        }
    }

    pub(crate) fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn read_transfer(hx: &Harness, target: u16, len: u32) -> (Transfer, crate::dma::DmaRegion) {
        let buf = hx.sim.dma().allocate(len as usize).unwrap();
        let xfer = Transfer {
            target: Target { target, lun: 0 },
            direction: Direction::Read,
            cdb: vec![0x28, 0, 0, 0, 0, 0, 0, 0, (len / 512) as u8, 0],
            data_len: len,
            segments: vec![DataSegment {
                addr: buf.device_addr(),
                len,
            }],
            ..Default::default()
        };
        (xfer, buf)
    }

    fn plain_slot(hx: &Harness) -> u16 {
        let handle = *hx.sim.targets().last().unwrap();
        hx.hba.devices().find(handle).unwrap().slot
    }

    #[test]
    fn test_sizing_rules() {
        let facts = IocFactsReply {
            request_credit: 1000,
            max_reply_post_depth: 1024,
            reply_frame_size: 32,
            ioc_request_frame_size: 32,
            ..Default::default()
        };
        let sizing = Sizing::negotiate(&facts, 128).unwrap();
        assert_eq!(sizing.max_cmds, 128);
        assert_eq!(sizing.num_reply_frames, 159);
        assert_eq!(sizing.post_qdepth, 288);
        assert_eq!(sizing.free_qdepth, 160);
        assert_eq!(sizing.reply_size, 128);
        assert_eq!(sizing.request_size, 512);

        let big = IocFactsReply {
            ioc_request_frame_size: 160,
            ..facts
        };
        assert_eq!(Sizing::negotiate(&big, 128).unwrap().request_size, 672);
    }

    #[test]
    fn test_sizing_clamped_by_ioc() {
        let facts = IocFactsReply {
            request_credit: 1000,
            max_reply_post_depth: 64,
            ..Default::default()
        };
        let sizing = Sizing::negotiate(&facts, 128).unwrap();
        assert_eq!(sizing.post_qdepth, 64);
        assert_eq!(sizing.max_cmds, 28);
        assert_eq!(sizing.num_reply_frames, 32);
        assert_eq!(sizing.free_qdepth, 48);

        let shallow = IocFactsReply {
            max_reply_post_depth: 8,
            ..facts
        };
        assert_eq!(Sizing::negotiate(&shallow, 128), Err(HbaError::RingTooShallow));
    }

    #[test]
    fn test_target_map_modes() {
        let reserved = IocPage8 {
            flags: IOC8_FLAGS_RESERVED_TARGETID_0,
            ..Default::default()
        };
        assert_eq!(
            target_map(&reserved, true, 2, 34),
            TargetMap { pd_id_start: 2, vd_id_low: 1 }
        );
        assert_eq!(
            target_map(&reserved, false, 2, 34),
            TargetMap { pd_id_start: 1, vd_id_low: 0 }
        );

        let high = IocPage8 {
            ir_volume_mapping_flags: IOC8_IRFLAGS_HIGH_VOLUME_MAPPING,
            ..Default::default()
        };
        assert_eq!(
            target_map(&high, true, 2, 34),
            TargetMap { pd_id_start: 0, vd_id_low: 32 }
        );
    }

    #[test]
    fn test_attach_discovers_topology() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();
        for handle in hx.sim.targets() {
            assert!(devices.find(handle).is_some(), "target {:#x}", handle);
        }
        let volume = devices.volume(0).unwrap();
        assert_eq!(volume.handle, hx.sim.volumes()[0]);

        let spare = devices.find(hx.sim.targets()[2]).unwrap();
        assert!(spare.flags.contains(crate::devices::DeviceFlags::HOT_SPARE));
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
        assert_eq!(hx.sim.ioc_page1().flags & IOC1_REPLY_COALESCING, 0);
    }

    #[test]
    fn test_attach_with_ieee_sgl() {
        let hx = Harness::with(SimConfig {
            msg_version_min: 0x05,
            ..Default::default()
        });
        assert_eq!(hx.hba.sgl_layout().format, SgeFormat::Ieee);

        let (xfer, buf) = read_transfer(&hx, plain_slot(&hx), 4096);
        let (tx, rx) = channel();
        hx.hba.scsi_request(xfer, move |r| tx.send(r).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().error, XferError::NoError);

        let mut data = vec![0u8; 4096];
        buf.read_bytes(0, &mut data);
        let handle = *hx.sim.targets().last().unwrap();
        assert!(data.iter().enumerate().all(|(i, b)| *b == SimIoc::pattern(handle, i)));
    }

    #[test]
    fn test_read_through_chained_sgl() {
        let hx = Harness::attach();
        let handle = *hx.sim.targets().last().unwrap();
        let layout = hx.hba.sgl_layout();
        let count = layout.chain_sge + 3;

        let bufs: Vec<_> = (0..count).map(|_| hx.sim.dma().allocate(512).unwrap()).collect();
        let xfer = Transfer {
            target: Target { target: plain_slot(&hx), lun: 0 },
            direction: Direction::Read,
            cdb: vec![0x28, 0, 0, 0, 0, 0, 0, 0, count as u8, 0],
            data_len: 512 * count as u32,
            segments: bufs
                .iter()
                .map(|b| DataSegment { addr: b.device_addr(), len: 512 })
                .collect(),
            poll: true,
            ..Default::default()
        };
        let (tx, rx) = channel();
        hx.hba.scsi_request(xfer, move |r| tx.send(r).unwrap());
        assert_eq!(rx.recv().unwrap().error, XferError::NoError);

        for (n, buf) in bufs.iter().enumerate() {
            let mut data = vec![0u8; 512];
            buf.read_bytes(0, &mut data);
            assert_eq!(data[0], SimIoc::pattern(handle, n * 512));
            assert_eq!(data[511], SimIoc::pattern(handle, n * 512 + 511));
        }
    }

    #[test]
    fn test_immediate_results() {
        let hx = Harness::attach();
        let (tx, rx) = channel();

        let long = Transfer {
            cdb: vec![0; 33],
            ..Default::default()
        };
        let done = tx.clone();
        hx.hba.scsi_request(long, move |r| done.send(r).unwrap());
        let result = rx.recv().unwrap();
        assert_eq!(result.error, XferError::Sense);
        assert_eq!(result.sense.unwrap()[12], 0x20);

        let nobody = Transfer {
            target: Target { target: 30, lun: 0 },
            cdb: vec![0],
            ..Default::default()
        };
        let done = tx.clone();
        hx.hba.scsi_request(nobody, move |r| done.send(r).unwrap());
        assert_eq!(rx.recv().unwrap().error, XferError::SelectionTimeout);

        let too_many = Transfer {
            target: Target { target: plain_slot(&hx), lun: 0 },
            cdb: vec![0x28],
            segments: vec![DataSegment { addr: 0x1000, len: 512 }; hx.hba.sgl_layout().max_sgl + 1],
            ..Default::default()
        };
        hx.hba.scsi_request(too_many, move |r| tx.send(r).unwrap());
        assert_eq!(rx.recv().unwrap().error, XferError::DriverStuffup);
        assert_eq!(hx.hba.outstanding(), 0);
    }

    #[test]
    fn test_check_condition_returns_sense() {
        let hx = Harness::attach();
        let handle = *hx.sim.targets().last().unwrap();
        hx.sim.check_condition(handle, 0x06);

        let (xfer, _buf) = read_transfer(&hx, plain_slot(&hx), 512);
        let (tx, rx) = channel();
        hx.hba.scsi_request(xfer, move |r| tx.send(r).unwrap());
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.error, XferError::Sense);
        assert_eq!(result.status, crate::scsi::status::CHECK);
        assert_eq!(result.sense.unwrap()[2], 0x06);
    }

    #[test]
    fn test_many_ios_over_small_pool() {
        let hx = Harness::attach();
        let slot = plain_slot(&hx);
        let (tx, rx) = channel();
        let mut bufs = Vec::new();

        let mut sent = 0;
        while sent < 256 {
            let (xfer, buf) = read_transfer(&hx, slot, 512);
            let (result_tx, result_rx) = channel();
            let done = tx.clone();
            hx.hba.scsi_request(xfer, move |r| {
                if r.error == XferError::ResourceShortage {
                    let _ = result_tx.send(());
                } else {
                    done.send(r).unwrap();
                }
            });
            if result_rx.try_recv().is_ok() {
                std::thread::yield_now();
                continue;
            }
            bufs.push(buf);
            sent += 1;
        }

        for _ in 0..256 {
            let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(result.error, XferError::NoError);
        }
        assert!(wait_for(|| hx.hba.outstanding() == 0));
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
        assert_eq!(hx.sim.violations(), 0);
    }

    #[test]
    fn test_timeout_resets_target() {
        let hx = Harness::attach();
        let handle = *hx.sim.targets().last().unwrap();
        hx.sim.hold_target(handle, true);

        let (mut xfer, _buf) = read_transfer(&hx, plain_slot(&hx), 512);
        xfer.timeout = Some(Duration::from_millis(20));
        let (tx, rx) = channel();
        hx.hba.scsi_request(xfer, move |r| tx.send(r).unwrap());

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.error, XferError::Timeout);
        assert!(wait_for(|| hx.sim.tm_log() == vec![handle]));
        assert!(wait_for(|| hx.hba.outstanding() == 0));
    }

    #[test]
    fn test_reset_without_timeout_reports_reset() {
        let hx = Harness::attach();
        let handle = *hx.sim.targets().last().unwrap();
        hx.sim.hold_target(handle, true);

        let (xfer, _buf) = read_transfer(&hx, plain_slot(&hx), 512);
        let (tx, rx) = channel();
        hx.hba.scsi_request(xfer, move |r| tx.send(r).unwrap());
        assert!(wait_for(|| hx.sim.held() == 1));

        // a target reset from the removal path terminates it
        hx.sim.remove_target(handle);
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.error, XferError::Reset);
    }

    #[test]
    fn test_topology_add_and_remove() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();

        hx.sim.add_target(0x30);
        assert!(wait_for(|| devices.find(0x30).is_some()));
        let slot = devices.find(0x30).unwrap().slot;
        assert_eq!(
            devices.snapshot().iter().filter(|d| d.handle == 0x30).count(),
            1
        );

        hx.sim.remove_target(0x30);
        assert!(wait_for(|| hx.bus.detached.lock().contains(&slot)));
        assert!(devices.find(0x30).is_none());
        assert_eq!(hx.sim.tm_log(), vec![0x30]);
        assert_eq!(hx.sim.removed(), vec![0x30]);
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
    }

    #[test]
    fn test_detach_releases_memory() {
        let Harness { sim, hba, .. } = Harness::attach();
        assert!(sim.dma().live_regions() > 0);
        let line = hba.interrupt_line();
        hba.detach();
        assert!(wait_for(|| sim.dma().live_regions() == 0));
        assert!(!line.raise());
    }

    #[test]
    fn test_reattach_after_fault() {
        let sim = SimIoc::new(SimConfig::default());
        for _ in 0..3 {
            let hba = Controller::attach(
                sim.clone(),
                sim.dma().as_ref(),
                Arc::new(NullBus),
                HbaConfig::fast(),
            )
            .unwrap();
            hba.detach();
            sim.force_state(IocState::Fault);
        }
        assert_eq!(sim.hard_resets(), 2);
        Controller::attach(sim.clone(), sim.dma().as_ref(), Arc::new(NullBus), HbaConfig::fast())
            .unwrap()
            .detach();
        assert_eq!(sim.hard_resets(), 3);
    }

    #[test]
    fn test_locked_diagnostic_fails_attach() {
        let sim = SimIoc::new(SimConfig {
            initial_state: IocState::Fault,
            diag_locked: true,
            ..Default::default()
        });
        let start = Instant::now();
        let result = Controller::attach(
            sim.clone(),
            sim.dma().as_ref(),
            Arc::new(NullBus),
            HbaConfig::fast(),
        );
        assert_eq!(result.err(), Some(HbaError::BringUp));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(sim.dma().live_regions(), 0);
    }

    #[test]
    fn test_failed_ioc_init() {
        let sim = SimIoc::new(SimConfig {
            init_status: IOCSTATUS_INSUFFICIENT_RESOURCES,
            ..Default::default()
        });
        let result = Controller::attach(
            sim.clone(),
            sim.dma().as_ref(),
            Arc::new(NullBus),
            HbaConfig::fast(),
        );
        assert_eq!(result.err(), Some(HbaError::IocStatus(IOCSTATUS_INSUFFICIENT_RESOURCES)));
    }

    #[test]
    fn test_failed_port_enable_stops_workers() {
        let sim = SimIoc::new(SimConfig {
            port_enable_status: IOCSTATUS_INSUFFICIENT_RESOURCES,
            ..Default::default()
        });
        let result = Controller::attach(
            sim.clone(),
            sim.dma().as_ref(),
            Arc::new(NullBus),
            HbaConfig::fast(),
        );
        assert_eq!(result.err(), Some(HbaError::IocStatus(IOCSTATUS_INSUFFICIENT_RESOURCES)));
        assert!(wait_for(|| sim.dma().live_regions() == 0));
        assert_eq!(sim.violations(), 0);
    }

    #[test]
    fn test_no_events_without_sas_port() {
        let hx = Harness::with(SimConfig {
            port_type: 0x10,
            ..Default::default()
        });
        assert!(hx.hba.devices().is_empty());
        assert!(hx.sim.event_masks().is_none());
    }
}
