//! # Event Pipeline
//!
//! Replies that carry no SMID are asynchronous event notifications. They are
//! decoded on the interrupt path; anything that needs to talk to the IOC again
//! is deferred to a work queue:
//!
//! - **removal**: a topology change list with missing targets. Each target
//!   gets a target reset followed by a remove-device request.
//! - **ack**: events the IOC wants acknowledged.
//!
//! Every event reply ends in [`Events::finish`], which either queues it for
//! acknowledgment or drops it so the frame goes back to the free ring.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use spin::Once;

use crate::config::{volume_state_name, HbaConfig, RAID_VOL_STATUS_RESYNC};
use crate::controller::HostBus;
use crate::devices::{Device, DeviceFlags, DeviceTable, InsertError};
use crate::dispatch::{Dispatcher, EventSink, SubmitMode};
use crate::mpi::*;
use crate::pool::Command;
use crate::reply::Reply;
use crate::workqueue::WorkQueue;
use crate::{HbaError, HbaResult};

/// How long the ack worker waits for a command slot before re-queueing
const ACK_BACKOFF: Duration = Duration::from_millis(10);

/// Events registered for at startup
pub const ENABLED_EVENTS: [u16; 8] = [
    EVENT_SAS_DISCOVERY,
    EVENT_SAS_TOPOLOGY_CHANGE_LIST,
    EVENT_SAS_DEVICE_STATUS_CHANGE,
    EVENT_SAS_ENCL_DEVICE_STATUS_CHANGE,
    EVENT_IR_CONFIGURATION_CHANGE_LIST,
    EVENT_IR_VOLUME,
    EVENT_IR_PHYSICAL_DISK,
    EVENT_IR_OPERATION_STATUS,
];

/// Event decoding and the deferred work it triggers
pub struct Events {
    name: String,
    dispatcher: Arc<Dispatcher>,
    devices: Arc<DeviceTable>,
    bus: Arc<dyn HostBus>,
    vf_id: u8,
    /// Set until attach completes
    cold: AtomicBool,
    removals: Once<WorkQueue<Reply>>,
    acks: Once<WorkQueue<Reply>>,
}

impl Events {
    pub fn new(
        config: &HbaConfig,
        dispatcher: Arc<Dispatcher>,
        devices: Arc<DeviceTable>,
        bus: Arc<dyn HostBus>,
        vf_id: u8,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            dispatcher,
            devices,
            bus,
            vf_id,
            cold: AtomicBool::new(true),
            removals: Once::new(),
            acks: Once::new(),
        })
    }

    /// Starts the removal and ack workers.
    ///
    /// Every queued item holds one of the `reply_frames` reply frames, so
    /// queues that deep never turn an event away.
    pub fn start(self: &Arc<Self>, reply_frames: usize) -> HbaResult<()> {
        let weak = Arc::downgrade(self);
        let removals = WorkQueue::spawn(&format!("{}sas", self.name), reply_frames, move |reply| {
            if let Some(events) = weak.upgrade() {
                events.remove_missing(reply);
            }
        })?;
        self.removals.call_once(|| removals);

        let weak: Weak<Self> = Arc::downgrade(self);
        let acks = WorkQueue::spawn(&format!("{}evt", self.name), reply_frames, move |reply| {
            if let Some(events) = weak.upgrade() {
                events.acknowledge(reply);
            }
        })?;
        self.acks.call_once(|| acks);
        Ok(())
    }

    /// Stops both workers; queued replies are dropped back to the free ring
    pub fn stop(&self) {
        if let Some(queue) = self.removals.get() {
            queue.shutdown();
        }
        if let Some(queue) = self.acks.get() {
            queue.shutdown();
        }
    }

    pub fn is_cold(&self) -> bool {
        self.cold.load(Ordering::Acquire)
    }

    pub fn set_cold(&self, cold: bool) {
        self.cold.store(cold, Ordering::Release);
    }

    /// Registers for the events this driver handles.
    ///
    /// The reply to the notification request is itself an event and goes
    /// through [`process`](Self::process).
    pub fn enable(self: &Arc<Self>) -> HbaResult<()> {
        let mut cmd = self.dispatcher.pool().acquire().ok_or(HbaError::NoCommandSlot)?;

        let mut request = EventNotificationRequest::mask_all(self.vf_id);
        for event in ENABLED_EVENTS {
            request.unmask(event);
        }
        cmd.encode(&request);

        let weak = Arc::downgrade(self);
        self.dispatcher.start(cmd, None, move |mut cmd: Command| {
            let reply = cmd.take_reply();
            drop(cmd);
            match (weak.upgrade(), reply) {
                (Some(events), Some(reply)) => events.process(reply),
                (_, None) => log::debug!("event notification completed without a reply"),
                _ => {}
            }
        });
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handles one event reply
    pub fn process(&self, reply: Reply) {
        let event = EventReply::decode(&reply.bytes());
        log::trace!("{}: event {:#06x}", self.name, event.event);

        match event.event {
            EVENT_EVENT_CHANGE
            | EVENT_SAS_DEVICE_STATUS_CHANGE
            | EVENT_SAS_ENCL_DEVICE_STATUS_CHANGE
            | EVENT_IR_PHYSICAL_DISK => {}
            EVENT_SAS_DISCOVERY => self.discovery(&event),
            EVENT_SAS_TOPOLOGY_CHANGE_LIST => return self.topology(&event, reply),
            EVENT_IR_VOLUME => self.ir_volume(&event),
            EVENT_IR_CONFIGURATION_CHANGE_LIST => self.ir_config(&event),
            EVENT_IR_OPERATION_STATUS => self.ir_operation(&event),
            other => log::debug!("{}: unhandled event {:#06x}", self.name, other),
        }

        self.finish(reply);
    }

    /// Queues the reply for acknowledgment, or gives the frame back
    pub fn finish(&self, reply: Reply) {
        let bytes = reply.bytes();
        if bytes[6] == 0 {
            return;
        }

        match self.acks.get() {
            Some(queue) => {
                if queue.try_enqueue(reply).is_err() {
                    log::warn!(
                        "{}: event {:#06x} dropped without acknowledgment",
                        self.name,
                        get_u16(&bytes, 20)
                    );
                }
            }
            None => log::warn!("{}: no ack worker, event not acknowledged", self.name),
        }
    }

    // =========================================================================
    // SAS
    // =========================================================================

    fn discovery(&self, event: &EventReply) {
        let Some(disc) = SasDiscovery::decode(&event.data) else {
            return;
        };
        if disc.reason_code == SAS_DISCOVERY_RC_COMPLETED && disc.discovery_status != 0 {
            log::warn!(
                "{}: sas discovery completed with status {:#x}",
                self.name,
                disc.discovery_status
            );
        }
    }

    fn topology(&self, event: &EventReply, reply: Reply) {
        let list = TopologyChangeList::decode(&event.data);
        let pd_id_start = self.devices.target_map().pd_id_start;
        let mut missing = false;

        for (i, entry) in list.entries.iter().enumerate() {
            let phy = list.start_phy.wrapping_add(i as u8);
            log::trace!(
                "{}: sas change {} status {:#04x} handle {:#06x} phy {}",
                self.name,
                i,
                entry.phy_status,
                entry.dev_handle,
                phy
            );

            match entry.reason() {
                TOPO_PHY_RC_TARG_ADDED => {
                    let dev = Device {
                        handle: entry.dev_handle,
                        slot: pd_id_start + phy as u16,
                        phy_num: phy,
                        physical_port: if list.enclosure_handle != 0 {
                            list.physical_port
                        } else {
                            0
                        },
                        enclosure: list.enclosure_handle,
                        expander: list.expander_handle,
                        ..Default::default()
                    };
                    match self.devices.insert(dev) {
                        Ok(slot) => {
                            log::info!("{}: physical disk inserted in slot {}", self.name, slot)
                        }
                        Err(InsertError::Duplicate) => log::warn!(
                            "{}: device {:#06x} is already configured",
                            self.name,
                            entry.dev_handle
                        ),
                        Err(InsertError::Full) => log::warn!(
                            "{}: no slot for device {:#06x}",
                            self.name,
                            entry.dev_handle
                        ),
                    }
                }
                TOPO_PHY_RC_TARG_NOT_RESPONDING => missing = true,
                _ => {}
            }
        }

        if !missing {
            return self.finish(reply);
        }

        match self.removals.get() {
            Some(queue) => {
                if queue.try_enqueue(reply).is_err() {
                    log::warn!("{}: removal queue full, topology change lost", self.name);
                }
            }
            None => log::warn!("{}: no removal worker, topology change lost", self.name),
        }
    }

    /// Removal worker: forgets every missing target of a topology change
    fn remove_missing(&self, reply: Reply) {
        let event = EventReply::decode(&reply.bytes());
        let list = TopologyChangeList::decode(&event.data);

        for entry in list
            .entries
            .iter()
            .filter(|e| e.reason() == TOPO_PHY_RC_TARG_NOT_RESPONDING)
        {
            let Some(dev) = self.devices.remove(entry.dev_handle) else {
                continue;
            };
            log::info!("{}: physical disk removed from slot {}", self.name, dev.slot);

            self.remove_device(dev.handle);
            if !dev.flags.contains(DeviceFlags::HIDDEN) {
                self.bus.detach_target(dev.slot);
            }
        }

        self.finish(reply);
    }

    /// Target reset, then remove-device, on one command slot
    fn remove_device(&self, handle: u16) {
        let Some(mut cmd) = self.dispatcher.pool().acquire() else {
            log::warn!("{}: no slot to remove device {:#06x}", self.name, handle);
            return;
        };

        cmd.encode(&TaskMgmtRequest {
            dev_handle: handle,
            task_type: TASK_TARGET_RESET,
            ..Default::default()
        });
        let mut cmd = match self.dispatcher.submit(cmd, SubmitMode::Wait) {
            Ok(cmd) => cmd,
            Err(e) => {
                log::warn!("{}: target reset of {:#06x} failed: {}", self.name, handle, e);
                return;
            }
        };

        cmd.reset();
        cmd.encode(&SasIoUnitControlRequest {
            operation: SAS_OP_REMOVE_DEVICE,
            dev_handle: handle,
        });
        if let Err(e) = self.dispatcher.submit(cmd, SubmitMode::Wait) {
            log::warn!("{}: removal of {:#06x} failed: {}", self.name, handle, e);
        }
    }

    /// Ack worker: sends EVENT_ACK for one reply
    fn acknowledge(&self, reply: Reply) {
        let Some(mut cmd) = self.dispatcher.pool().acquire_timeout(ACK_BACKOFF) else {
            log::debug!("{}: no slot for event ack, requeueing", self.name);
            if let Some(queue) = self.acks.get() {
                if queue.try_enqueue(reply).is_err() {
                    log::warn!("{}: event ack lost", self.name);
                }
            }
            return;
        };

        let event = EventReply::decode(&reply.bytes());
        drop(reply);

        cmd.encode(&EventAckRequest {
            event: event.event,
            context: event.context,
        });
        self.dispatcher.start(cmd, None, |cmd| {
            log::trace!("event ack done, smid {}", cmd.smid());
        });
    }

    // =========================================================================
    // Integrated RAID
    // =========================================================================

    fn ir_config(&self, event: &EventReply) {
        let list = IrConfigChangeList::decode(&event.data);
        if list.elements.is_empty() || list.flags & IR_CFG_CHANGE_FOREIGN != 0 {
            return;
        }

        for el in &list.elements {
            match el.element_type() {
                IR_CFG_ELEMENT_VOLUME => match el.reason_code {
                    IR_CFG_RC_ADDED | IR_CFG_RC_VOLUME_CREATED => {
                        let dev = Device {
                            handle: el.vol_dev_handle,
                            slot: self.devices.target_map().vd_id_low,
                            flags: DeviceFlags::VOLUME,
                            ..Default::default()
                        };
                        match self.devices.insert(dev) {
                            Ok(slot) => log::info!("{}: volume configured at slot {}", self.name, slot),
                            Err(InsertError::Duplicate) => log::warn!(
                                "{}: device {:#06x} is already configured",
                                self.name,
                                el.vol_dev_handle
                            ),
                            Err(InsertError::Full) => log::warn!(
                                "{}: no slot for volume {:#06x}",
                                self.name,
                                el.vol_dev_handle
                            ),
                        }
                    }
                    IR_CFG_RC_REMOVED | IR_CFG_RC_VOLUME_DELETED => {
                        if let Some(dev) = self.devices.remove(el.vol_dev_handle) {
                            log::info!("{}: volume removed from slot {}", self.name, dev.slot);
                        }
                    }
                    _ => {}
                },
                IR_CFG_ELEMENT_VOLUME_DISK => {
                    if matches!(el.reason_code, IR_CFG_RC_PD_CREATED | IR_CFG_RC_HIDE) {
                        // may be a hot spare promoted into the volume
                        self.devices.update(el.phys_disk_dev_handle, |d| {
                            d.flags.remove(DeviceFlags::HOT_SPARE);
                            d.flags.insert(DeviceFlags::VOLUME_DISK | DeviceFlags::HIDDEN);
                        });
                    }
                }
                IR_CFG_ELEMENT_HOT_SPARE => {
                    if el.reason_code == IR_CFG_RC_HIDE {
                        self.devices.update(el.phys_disk_dev_handle, |d| {
                            d.flags.insert(DeviceFlags::HOT_SPARE | DeviceFlags::HIDDEN);
                        });
                    }
                }
                _ => {}
            }
        }
    }

    fn ir_volume(&self, event: &EventReply) {
        if self.is_cold() {
            return;
        }
        let Some(vol) = IrVolumeEvent::decode(&event.data) else {
            return;
        };
        let Some(dev) = self.devices.find(vol.vol_dev_handle) else {
            return;
        };
        let volid = dev.slot.saturating_sub(self.devices.target_map().vd_id_low);

        match vol.reason_code {
            IR_VOLUME_RC_STATE_CHANGED => log::info!(
                "{}: volume {} state changed from {} to {}",
                self.name,
                volid,
                volume_state_name(vol.previous_value as u8),
                volume_state_name(vol.new_value as u8)
            ),
            IR_VOLUME_RC_STATUS_FLAGS_CHANGED
                if vol.new_value & RAID_VOL_STATUS_RESYNC != 0
                    && vol.previous_value & RAID_VOL_STATUS_RESYNC == 0 =>
            {
                log::info!("{}: started resync on volume {}", self.name, volid)
            }
            _ => {}
        }
    }

    fn ir_operation(&self, event: &EventReply) {
        let Some(op) = IrOperationStatus::decode(&event.data) else {
            return;
        };
        if op.operation == IR_RAIDOP_RESYNC {
            self.devices.update(op.vol_dev_handle, |d| d.percent = op.percent);
        }
    }
}

impl EventSink for Events {
    fn event(&self, reply: Reply) {
        self.process(reply);
    }
}

impl Drop for Events {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::Harness;
    use crate::devices::TargetMap;
    use crate::sim::SimConfig;
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn ir_event(elements: Vec<IrConfigElement>, flags: u32) -> EventReply {
        EventReply {
            event: EVENT_IR_CONFIGURATION_CHANGE_LIST,
            data: IrConfigChangeList { flags, elements }.encode(),
            ..Default::default()
        }
    }

    #[test]
    fn test_enabled_events() {
        let mut request = EventNotificationRequest::mask_all(0);
        for event in ENABLED_EVENTS {
            request.unmask(event);
        }
        assert!(request.is_enabled(EVENT_IR_OPERATION_STATUS));
        assert!(!request.is_enabled(EVENT_EVENT_CHANGE));
        assert!(!request.is_enabled(0x7F));
    }

    #[test]
    fn test_volume_created_and_deleted() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();
        let map: TargetMap = devices.target_map();
        let before = devices.len();

        let volume = |rc| IrConfigElement {
            element_flags: IR_CFG_ELEMENT_VOLUME,
            vol_dev_handle: 0x1F0,
            reason_code: rc,
            ..Default::default()
        };

        hx.sim.inject_event(ir_event(vec![volume(IR_CFG_RC_VOLUME_CREATED)], 0));
        assert!(wait_for(|| devices.find(0x1F0).is_some()));
        let dev = devices.find(0x1F0).unwrap();
        assert!(dev.flags.contains(DeviceFlags::VOLUME));
        assert!(dev.slot >= map.vd_id_low);

        hx.sim.inject_event(ir_event(vec![volume(IR_CFG_RC_VOLUME_DELETED)], 0));
        assert!(wait_for(|| devices.find(0x1F0).is_none()));
        assert_eq!(devices.len(), before);
    }

    #[test]
    fn test_foreign_configuration_ignored() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();
        let el = IrConfigElement {
            element_flags: IR_CFG_ELEMENT_VOLUME,
            vol_dev_handle: 0x1F1,
            reason_code: IR_CFG_RC_ADDED,
            ..Default::default()
        };
        hx.sim.inject_event(ir_event(vec![el], IR_CFG_CHANGE_FOREIGN));
        // a later event is processed after the foreign one
        hx.sim.inject_event(EventReply {
            event: EVENT_IR_OPERATION_STATUS,
            data: IrOperationStatus::default().encode(),
            ..Default::default()
        });
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
        assert!(devices.find(0x1F1).is_none());
    }

    #[test]
    fn test_disk_flags_follow_ir_config() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();
        let disk = *hx.sim.targets().last().unwrap();

        let spare = IrConfigElement {
            element_flags: IR_CFG_ELEMENT_HOT_SPARE,
            reason_code: IR_CFG_RC_HIDE,
            phys_disk_dev_handle: disk,
            ..Default::default()
        };
        hx.sim.inject_event(ir_event(vec![spare], 0));
        assert!(wait_for(|| devices
            .find(disk)
            .is_some_and(|d| d.flags.contains(DeviceFlags::HOT_SPARE | DeviceFlags::HIDDEN))));

        let member = IrConfigElement {
            element_flags: IR_CFG_ELEMENT_VOLUME_DISK,
            reason_code: IR_CFG_RC_PD_CREATED,
            phys_disk_dev_handle: disk,
            ..spare
        };
        hx.sim.inject_event(ir_event(vec![member], 0));
        assert!(wait_for(|| devices
            .find(disk)
            .is_some_and(|d| d.flags.contains(DeviceFlags::VOLUME_DISK)
                && !d.flags.contains(DeviceFlags::HOT_SPARE))));
    }

    #[test]
    fn test_resync_progress() {
        let hx = Harness::attach();
        let devices = hx.hba.devices();
        let volume = hx.sim.volumes()[0];

        hx.sim.inject_event(EventReply {
            event: EVENT_IR_OPERATION_STATUS,
            data: IrOperationStatus {
                vol_dev_handle: volume,
                operation: IR_RAIDOP_RESYNC,
                percent: 42,
            }
            .encode(),
            ..Default::default()
        });
        assert!(wait_for(|| devices.find(volume).map(|d| d.percent) == Some(42)));
    }

    #[test]
    fn test_ack_required_event_is_acknowledged() {
        let hx = Harness::attach();
        hx.sim.inject_event(EventReply {
            event: EVENT_SAS_DEVICE_STATUS_CHANGE,
            ack_required: 1,
            context: 0xC0FFEE,
            ..Default::default()
        });
        assert!(wait_for(|| hx.sim.acks().contains(&(EVENT_SAS_DEVICE_STATUS_CHANGE, 0xC0FFEE))));
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
    }

    #[test]
    fn test_ack_burst_waits_for_slots() {
        let config = HbaConfig {
            queue_depth: 4,
            ..HbaConfig::fast()
        };
        let hx = Harness::configured(SimConfig::default(), config);
        let slots = hx.take_slots();
        assert!(!slots.is_empty());

        let contexts: Vec<u32> = (0..12).map(|n| 0xA000 + n).collect();
        for &context in &contexts {
            hx.sim.post_event(EventReply {
                event: EVENT_SAS_DEVICE_STATUS_CHANGE,
                ack_required: 1,
                context,
                ..Default::default()
            });
        }
        // every event reached the host and is parked waiting for a slot
        assert!(wait_for(|| hx.sim.replies_outstanding() == contexts.len()));
        std::thread::sleep(Duration::from_millis(50));
        assert!(hx.sim.acks().is_empty());

        drop(slots);
        assert!(wait_for(|| hx.sim.acks().len() == contexts.len()));
        let mut acked: Vec<u32> = hx.sim.acks().iter().map(|&(_, context)| context).collect();
        acked.sort_unstable();
        assert_eq!(acked, contexts);
        assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
        assert_eq!(hx.sim.violations(), 0);
    }
}
