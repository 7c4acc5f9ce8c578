//! # Simulated IOC
//!
//! A software Fusion-MPT controller behind the same [`RegisterBlock`] and
//! [`HostDma`] seams the driver uses for real hardware. It models:
//!
//! - the doorbell state machine with its handshake mailbox
//! - the diagnostic unlock sequence and adapter reset
//! - request descriptor posting, the reply post ring and the reply free ring
//! - a small SAS topology: four disks, one RAID1 volume and a hot spare
//!
//! Register accesses are handled synchronously. Requests posted through the
//! descriptor registers are executed by a firmware thread, which also raises
//! the interrupt line while the reply interrupt is unmasked and descriptors
//! are waiting, like a level-triggered INTx pin.
//!
//! The simulator also checks the host: every reply frame handed back on the
//! free ring must be one the IOC posted and the host has not yet returned.

mod firmware;
mod pages;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::config::IocPage1;
use crate::controller::InterruptLine;
use crate::dma::HostDma;
use crate::mpi::{
    EventReply, TopologyChangeList, TopologyEntry, EVENT_SAS_TOPOLOGY_CHANGE_LIST,
    IOCFACTS_CAPABILITY_INTEGRATED_RAID, PORT_TYPE_SAS_PHYSICAL, TOPO_PHY_RC_TARG_ADDED,
    TOPO_PHY_RC_TARG_NOT_RESPONDING,
};
use crate::regs::{
    IocState, RegisterBlock, REG_DOORBELL, REG_HOSTDIAG, REG_INTR_MASK, REG_INTR_STATUS,
    REG_REPLY_FREE_HOST_INDEX, REG_REPLY_POST_HOST_INDEX, REG_REQ_DESCR_POST_HIGH,
    REG_REQ_DESCR_POST_LOW, REG_WRITESEQ,
};
use crate::ring::RequestDescriptor;

use firmware::State;
use pages::SimTarget;

/// Firmware thread wake-up period when idle
const FIRMWARE_TICK: Duration = Duration::from_millis(1);

/// How long `inject_event` waits for the host to consume an event
const EVENT_WAIT: Duration = Duration::from_secs(5);

/// What the simulated IOC reports and how it misbehaves
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// State at power-on
    pub initial_state: IocState,
    /// Doorbell reads that report the reset state after power-on and after
    /// every adapter reset
    pub reset_reads: u32,
    /// WHOINIT field at power-on
    pub whoinit: u32,
    /// The diagnostic register never unlocks
    pub diag_locked: bool,
    pub request_credit: u16,
    pub max_targets: u16,
    pub max_volumes: u8,
    pub max_reply_post_depth: u16,
    /// MPI minor version; 5 and 6 select IEEE scatter/gather elements
    pub msg_version_min: u8,
    pub capabilities: u32,
    /// Request frame size the IOC reads, in dwords
    pub ioc_request_frame_size: u16,
    /// Reply frame size, in dwords
    pub reply_frame_size: u8,
    pub port_type: u8,
    pub ioc8_flags: u16,
    pub ir_volume_mapping: u16,
    /// Status returned for IOC init
    pub init_status: u16,
    /// Status returned for port enable
    pub port_enable_status: u16,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            initial_state: IocState::Ready,
            reset_reads: 0,
            whoinit: 0,
            diag_locked: false,
            request_credit: 256,
            max_targets: 32,
            max_volumes: 2,
            max_reply_post_depth: 512,
            msg_version_min: 0,
            capabilities: IOCFACTS_CAPABILITY_INTEGRATED_RAID,
            ioc_request_frame_size: 32,
            reply_frame_size: 32,
            port_type: PORT_TYPE_SAS_PHYSICAL,
            ioc8_flags: 0,
            ir_volume_mapping: 0,
            init_status: 0,
            port_enable_status: 0,
        }
    }
}

/// Work for the firmware thread
enum Work {
    /// A request descriptor was posted
    Request(RequestDescriptor),
    /// Post an event; the sender learns the reply frame it landed in
    Event(EventReply, Option<SyncSender<(u32, u64)>>),
    /// Ring space or free frames may have appeared
    Kick,
}

struct Shared {
    config: SimConfig,
    dma: Arc<HostDma>,
    state: Mutex<State>,
    irq: Mutex<Option<InterruptLine>>,
}

impl Shared {
    fn execute(&self, work: Work) {
        let mut state = self.state.lock();
        match work {
            Work::Request(descr) => state.request(descr, &self.dma),
            Work::Event(event, notify) => state.post_event(event, notify),
            Work::Kick => {}
        }
    }

    /// Posts what fits, then raises the line with no lock held
    fn service(&self) {
        let raise = {
            let mut state = self.state.lock();
            state.flush(&self.dma);
            state.irq_pending()
        };
        if !raise {
            return;
        }
        let line = self.irq.lock().clone();
        if let Some(line) = line {
            line.raise();
        }
    }

    fn run(&self, rx: Receiver<Work>) {
        loop {
            match rx.recv_timeout(FIRMWARE_TICK) {
                Ok(work) => self.execute(work),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.service();
        }
        log::debug!("sim: firmware stopped");
    }
}

/// Simulated controller
pub struct SimIoc {
    shared: Arc<Shared>,
    tx: Mutex<Sender<Work>>,
}

impl SimIoc {
    /// Powers on a controller and starts its firmware thread
    pub fn new(config: SimConfig) -> Arc<Self> {
        let state = State::new(&config);
        let shared = Arc::new(Shared {
            config,
            dma: Arc::new(HostDma::new()),
            state: Mutex::new(state),
            irq: Mutex::new(None),
        });

        let (tx, rx) = mpsc::channel();
        let worker = shared.clone();
        if let Err(e) = thread::Builder::new()
            .name("sim-ioc".into())
            .spawn(move || worker.run(rx))
        {
            log::warn!("sim: unable to start firmware thread: {}", e);
        }

        Arc::new(Self {
            shared,
            tx: Mutex::new(tx),
        })
    }

    fn send(&self, work: Work) {
        if self.tx.lock().send(work).is_err() {
            log::warn!("sim: firmware thread is gone");
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.shared.config
    }

    /// Host memory the IOC can reach
    pub fn dma(&self) -> &Arc<HostDma> {
        &self.shared.dma
    }

    /// Connects the interrupt pin
    pub fn set_irq(&self, line: InterruptLine) {
        *self.shared.irq.lock() = Some(line);
        self.send(Work::Kick);
    }

    /// Puts the IOC in `state`, as a firmware crash or a peer would
    pub fn force_state(&self, state: IocState) {
        self.shared.state.lock().ioc = state;
    }

    /// Adapter resets performed through the diagnostic register
    pub fn hard_resets(&self) -> u32 {
        self.shared.state.lock().hard_resets
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Handles of the attached SAS targets, in phy order
    pub fn targets(&self) -> Vec<u16> {
        self.shared.state.lock().model.targets.iter().map(|t| t.handle).collect()
    }

    /// Handles of the RAID volumes
    pub fn volumes(&self) -> Vec<u16> {
        self.shared.state.lock().model.volumes.iter().map(|v| v.handle).collect()
    }

    /// Size in bytes of volume number `volid`
    pub fn volume_size(&self, volid: usize) -> u64 {
        self.shared
            .state
            .lock()
            .model
            .volumes
            .get(volid)
            .map_or(0, |v| v.size())
    }

    pub fn set_volume_state(&self, handle: u16, state: u8, status_flags: u32) {
        let mut st = self.shared.state.lock();
        if let Some(vol) = st.model.volumes.iter_mut().find(|v| v.handle == handle) {
            vol.state = state;
            vol.status_flags = status_flags;
        }
    }

    pub fn set_disk_state(&self, num: u8, state: u8, offline_reason: u8) {
        let mut st = self.shared.state.lock();
        if let Some(disk) = st.model.disks.iter_mut().find(|d| d.num == num) {
            disk.state = state;
            disk.offline_reason = offline_reason;
        }
    }

    /// Plugs in a target on the next free phy and reports it
    pub fn add_target(&self, handle: u16) {
        let phy = {
            let mut st = self.shared.state.lock();
            let phy = st.model.next_phy;
            st.model.next_phy += 1;
            st.model.targets.push(SimTarget { handle, phy });
            phy
        };
        self.inject_event(topology_event(handle, phy, TOPO_PHY_RC_TARG_ADDED));
    }

    /// Pulls a target and reports it missing
    pub fn remove_target(&self, handle: u16) {
        let phy = {
            let mut st = self.shared.state.lock();
            let Some(at) = st.model.targets.iter().position(|t| t.handle == handle) else {
                return;
            };
            st.model.targets.remove(at).phy
        };
        self.inject_event(topology_event(handle, phy, TOPO_PHY_RC_TARG_NOT_RESPONDING));
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Queues I/O to `handle` until released or terminated by a target reset
    pub fn hold_target(&self, handle: u16, hold: bool) {
        let mut st = self.shared.state.lock();
        if hold {
            st.holding.insert(handle);
        } else {
            st.holding.remove(&handle);
            st.release(handle, &self.shared.dma);
        }
        drop(st);
        self.send(Work::Kick);
    }

    /// Commands currently held
    pub fn held(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// The next I/O to `handle` fails with CHECK CONDITION and sense key `key`
    pub fn check_condition(&self, handle: u16, key: u8) {
        self.shared.state.lock().check.insert(handle, key);
    }

    /// Page headers of `page_type` report `dwords` as the page length
    pub fn shorten_pages(&self, page_type: u8, dwords: u8) {
        self.shared.state.lock().short_pages.insert(page_type, dwords);
    }

    /// Volume `handle` refuses write cache changes
    pub fn pin_write_cache(&self, handle: u16, pinned: bool) {
        let mut st = self.shared.state.lock();
        if let Some(vol) = st.model.volume_mut(handle) {
            vol.cache_pinned = pinned;
        }
    }

    /// Byte a read returns at `offset` of target `handle`
    pub fn pattern(handle: u16, offset: usize) -> u8 {
        (offset.wrapping_add(handle as usize * 7) % 251) as u8
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Posts an event and waits until the host gives its frame back.
    ///
    /// Returns at once if the event is masked.
    pub fn inject_event(&self, event: EventReply) {
        let code = event.event;
        let (tx, rx) = mpsc::sync_channel(1);
        self.send(Work::Event(event, Some(tx)));

        let Ok((addr, seen)) = rx.recv_timeout(EVENT_WAIT) else {
            return;
        };
        let deadline = Instant::now() + EVENT_WAIT;
        while Instant::now() < deadline {
            if self.shared.state.lock().returns(addr) > seen {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        log::warn!("sim: event {:#06x} in frame {:#x} never returned", code, addr);
    }

    /// Posts an event without waiting for the host
    pub fn post_event(&self, event: EventReply) {
        self.send(Work::Event(event, None));
    }

    // =========================================================================
    // Observations
    // =========================================================================

    /// Targets reset through task management, oldest first
    pub fn tm_log(&self) -> Vec<u16> {
        self.shared.state.lock().tm_log.clone()
    }

    /// Devices removed through SAS I/O unit control, oldest first
    pub fn removed(&self) -> Vec<u16> {
        self.shared.state.lock().removed.clone()
    }

    /// Event acknowledgments as (event, context)
    pub fn acks(&self) -> Vec<(u16, u32)> {
        self.shared.state.lock().acks.clone()
    }

    /// Reply frames posted and not yet returned
    pub fn replies_outstanding(&self) -> usize {
        self.shared
            .state
            .lock()
            .queues
            .as_ref()
            .map_or(0, |q| q.outstanding.len())
    }

    /// Frames returned on the free ring that were not outstanding
    pub fn violations(&self) -> u32 {
        self.shared.state.lock().violations
    }

    pub fn ioc_page1(&self) -> IocPage1 {
        self.shared.state.lock().model.ioc1
    }

    /// Event masks of the last event notification request
    pub fn event_masks(&self) -> Option<[u32; 4]> {
        self.shared.state.lock().events.map(|e| e.masks)
    }
}

impl RegisterBlock for SimIoc {
    fn read(&self, offset: u32) -> u32 {
        let mut st = self.shared.state.lock();
        match offset {
            REG_DOORBELL => st.doorbell(),
            REG_HOSTDIAG => st.host_diag(),
            REG_INTR_STATUS => st.intr_status(),
            REG_INTR_MASK => st.mask,
            _ => 0,
        }
    }

    fn write(&self, offset: u32, value: u32) {
        let config = &self.shared.config;
        let dma = &self.shared.dma;
        let mut kick = false;
        let mut posted = None;

        {
            let mut st = self.shared.state.lock();
            match offset {
                REG_DOORBELL => st.doorbell_write(value, config),
                REG_WRITESEQ => st.write_sequence(value, config),
                REG_HOSTDIAG => st.host_diag_write(value, config),
                REG_INTR_STATUS => st.clear_doorbell_intr(),
                REG_INTR_MASK => {
                    st.mask = value;
                    kick = true;
                }
                REG_REPLY_FREE_HOST_INDEX => {
                    st.free_host_index(value, dma);
                    kick = true;
                }
                REG_REPLY_POST_HOST_INDEX => {
                    st.post_host_index(value);
                    kick = true;
                }
                REG_REQ_DESCR_POST_LOW => st.descr_low = value,
                REG_REQ_DESCR_POST_HIGH => {
                    posted = Some(RequestDescriptor::from_halves(st.descr_low, value));
                }
                _ => log::trace!("sim: write {:#x} to unknown register {:#x}", value, offset),
            }
        }

        if let Some(descr) = posted {
            self.send(Work::Request(descr));
        } else if kick {
            self.send(Work::Kick);
        }
    }
}

fn topology_event(handle: u16, phy: u8, reason: u8) -> EventReply {
    EventReply {
        event: EVENT_SAS_TOPOLOGY_CHANGE_LIST,
        data: TopologyChangeList {
            enclosure_handle: 1,
            start_phy: phy,
            entries: vec![TopologyEntry {
                dev_handle: handle,
                phy_status: reason,
                ..Default::default()
            }],
            ..Default::default()
        }
        .encode(),
        ..Default::default()
    }
}
