//! # Dispatcher
//!
//! Posts commands and routes what comes back.
//!
//! ## Submission modes
//!
//! - **start**: fire and forget; a completion closure runs from the reply path
//! - **wait**: block the calling thread until the reply arrives
//! - **poll**: spin on the reply interrupt bit, running the reply path inline;
//!   used while interrupts are still masked during attach
//!
//! ## Completion
//!
//! While a command is queued the dispatcher owns it. The reply path hands it
//! back to the completion closure with the reply frame attached. Closures run
//! after the whole batch has been drained, never while a ring lock is held.

use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use spin::{Mutex, Once};

use crate::config::HbaConfig;
use crate::mpi::{FUNCTION_SCSI_IO, FUNCTION_SCSI_TASK_MGMT};
use crate::pool::{Command, CommandPool, SlotState};
use crate::recovery::Watchdog;
use crate::reply::{Reply, ReplyPool};
use crate::ring::{
    RequestDescriptor, Rings, REQ_DESCR_DEFAULT, REQ_DESCR_HIGH_PRIORITY, REQ_DESCR_SCSI_IO,
};
use crate::{HbaError, HbaResult};

/// How a synchronous submission waits for its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Busy-poll the reply ring; interrupts may be masked
    Poll,
    /// Sleep until the interrupt path completes the command
    Wait,
}

/// Receiver of replies that belong to no command (asynchronous events)
pub trait EventSink: Send + Sync {
    fn event(&self, reply: Reply);
}

type Done = Box<dyn FnOnce(Command) + Send>;

struct Pending {
    cmd: Command,
    done: Done,
}

/// Request submission and reply routing
pub struct Dispatcher {
    name: String,
    pool: Arc<CommandPool>,
    replies: Arc<ReplyPool>,
    rings: Arc<Rings>,
    watchdog: Arc<Watchdog>,
    pending: Box<[Mutex<Option<Pending>>]>,
    sink: Once<Weak<dyn EventSink>>,
    vf_id: u8,
    admin_timeout: Duration,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        config: &HbaConfig,
        pool: Arc<CommandPool>,
        replies: Arc<ReplyPool>,
        rings: Arc<Rings>,
        watchdog: Arc<Watchdog>,
        vf_id: u8,
    ) -> Self {
        let pending = (0..=pool.capacity()).map(|_| Mutex::new(None)).collect();
        Self {
            name: config.name.clone(),
            pool,
            replies,
            rings,
            watchdog,
            pending,
            sink: Once::new(),
            vf_id,
            admin_timeout: config.admin_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Routes replies without a command to `sink`. Only the first call counts.
    pub fn set_event_sink(&self, sink: Weak<dyn EventSink>) {
        self.sink.call_once(|| sink);
    }

    pub fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }

    pub fn rings(&self) -> &Arc<Rings> {
        &self.rings
    }

    /// Commands currently owned by the dispatcher
    pub fn outstanding(&self) -> usize {
        self.pending.iter().filter(|p| p.lock().is_some()).count()
    }

    fn descriptor(&self, cmd: &Command) -> RequestDescriptor {
        let mut descr = RequestDescriptor {
            flags: REQ_DESCR_DEFAULT,
            vf_id: self.vf_id,
            smid: cmd.smid(),
            ..Default::default()
        };
        match cmd.function() {
            FUNCTION_SCSI_IO => {
                descr.flags = REQ_DESCR_SCSI_IO;
                descr.dev_handle = cmd.dev_handle();
            }
            FUNCTION_SCSI_TASK_MGMT => descr.flags = REQ_DESCR_HIGH_PRIORITY,
            _ => {}
        }
        descr
    }

    /// Posts `cmd`; `done` runs once the IOC replies.
    ///
    /// With a `timeout`, the watchdog escalates to a target reset if no
    /// reply arrives in time.
    pub fn start<F>(&self, cmd: Command, timeout: Option<Duration>, done: F)
    where
        F: FnOnce(Command) + Send + 'static,
    {
        let smid = cmd.smid();
        let descr = self.descriptor(&cmd);

        self.pool.set_state(smid, SlotState::Queued);
        *self.pending[smid as usize].lock() = Some(Pending {
            cmd,
            done: Box::new(done),
        });
        if let Some(timeout) = timeout {
            self.watchdog.arm(smid, timeout);
        }

        self.rings.post_request(descr);
    }

    /// Posts `cmd` and blocks until it completes
    pub fn submit(&self, cmd: Command, mode: SubmitMode) -> HbaResult<Command> {
        match mode {
            SubmitMode::Wait => self.wait(cmd),
            SubmitMode::Poll => self.poll(cmd),
        }
    }

    /// Posts `cmd` and sleeps until the interrupt path completes it.
    ///
    /// Gives up after the admin timeout; the late completion then releases
    /// the slot on its own.
    pub fn wait(&self, cmd: Command) -> HbaResult<Command> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.start(cmd, None, move |cmd| {
            let _ = tx.try_send(cmd);
        });

        rx.recv_timeout(self.admin_timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => {
                log::warn!("{}: command wait timed out", self.name);
                HbaError::Timeout
            }
            mpsc::RecvTimeoutError::Disconnected => HbaError::Detached,
        })
    }

    /// Posts `cmd` and runs the reply path inline until it completes
    pub fn poll(&self, cmd: Command) -> HbaResult<Command> {
        let slot: Arc<Mutex<Option<Command>>> = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&slot);
        self.start(cmd, None, move |cmd| {
            if let Some(slot) = weak.upgrade() {
                *slot.lock() = Some(cmd);
            }
        });

        let deadline = Instant::now() + self.admin_timeout;
        let nap = self.poll_interval / 100;
        loop {
            if let Some(cmd) = slot.lock().take() {
                return Ok(cmd);
            }
            if Instant::now() >= deadline {
                log::warn!("{}: command poll timed out", self.name);
                return Err(HbaError::Timeout);
            }
            if self.rings.reply_waiting() {
                self.handle_interrupt();
            } else {
                thread::sleep(nap);
            }
        }
    }

    /// Drains the reply post ring and completes everything it names.
    ///
    /// Returns true if any descriptor was consumed.
    pub fn handle_interrupt(&self) -> bool {
        let descrs = self.rings.drain_post_ring();
        if descrs.is_empty() {
            return false;
        }

        let mut completions = Vec::new();
        let mut events = Vec::new();

        for descr in descrs {
            let reply = if descr.is_address_reply() {
                self.replies.lookup(descr.data)
            } else {
                None
            };

            if descr.smid == 0 {
                match reply {
                    Some(reply) => events.push(reply),
                    None => log::debug!("{}: reply without smid or frame", self.name),
                }
                continue;
            }

            let pending = self
                .pending
                .get(descr.smid as usize)
                .and_then(|p| p.lock().take());
            let Some(Pending { mut cmd, done }) = pending else {
                log::warn!("{}: reply for idle smid {}", self.name, descr.smid);
                continue;
            };

            self.watchdog.disarm(descr.smid);
            let timed_out = self.pool.swap_state(descr.smid, SlotState::Ready) == SlotState::Timeout;
            cmd.complete(reply, timed_out);
            completions.push((cmd, done));
        }

        for (cmd, done) in completions {
            done(cmd);
        }

        if !events.is_empty() {
            let sink = self.sink.get().and_then(Weak::upgrade);
            for reply in events {
                match &sink {
                    Some(sink) => sink.event(reply),
                    None => log::debug!("{}: event dropped, no sink", self.name),
                }
            }
        }

        true
    }

    /// Drops every queued command at detach. Blocked waiters see `Detached`.
    pub fn abort_all(&self) {
        let mut aborted = 0;
        for slot in self.pending.iter() {
            let pending = slot.lock().take();
            if let Some(Pending { cmd, done }) = pending {
                self.watchdog.disarm(cmd.smid());
                drop(done);
                drop(cmd);
                aborted += 1;
            }
        }
        if aborted > 0 {
            log::debug!("{}: aborted {} outstanding commands", self.name, aborted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::mpi::{
        put_u16, PortEnableRequest, ReplyHeader, ScsiIoRequest, TaskMgmtRequest, FUNCTION_PORT_ENABLE,
    };
    use crate::regs::{RegisterBlock, REG_REQ_DESCR_POST_HIGH, REG_REQ_DESCR_POST_LOW};
    use crate::ring::{ReplyDescriptor, REPLY_DESCR_SIZE};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Posted {
        low: spin::Mutex<u32>,
        posted: spin::Mutex<Vec<RequestDescriptor>>,
    }

    impl RegisterBlock for Posted {
        fn read(&self, _offset: u32) -> u32 {
            0
        }

        fn write(&self, offset: u32, value: u32) {
            match offset {
                REG_REQ_DESCR_POST_LOW => *self.low.lock() = value,
                REG_REQ_DESCR_POST_HIGH => {
                    let low = *self.low.lock();
                    self.posted.lock().push(RequestDescriptor::from_halves(low, value));
                }
                _ => {}
            }
        }
    }

    struct Fixture {
        regs: Arc<Posted>,
        dma: Arc<HostDma>,
        rings: Arc<Rings>,
        replies: Arc<ReplyPool>,
        dispatcher: Arc<Dispatcher>,
        posted_index: usize,
    }

    impl Fixture {
        fn new() -> Self {
            let config = HbaConfig::fast();
            let regs = Arc::new(Posted::default());
            let dma = Arc::new(HostDma::new());
            let rings = Arc::new(Rings::new(regs.clone(), dma.as_ref(), 32, 16).unwrap());
            let replies = ReplyPool::new(dma.as_ref(), rings.clone(), 8, 128).unwrap();
            replies.seed_all();
            rings.init_queues();
            let pool = CommandPool::new(dma.as_ref(), 8, 256).unwrap();
            let watchdog = Arc::new(Watchdog::new(pool.clone(), config.watchdog_tick));
            let dispatcher = Arc::new(Dispatcher::new(
                &config,
                pool,
                replies.clone(),
                rings.clone(),
                watchdog,
                2,
            ));
            Self {
                regs,
                dma,
                rings,
                replies,
                dispatcher,
                posted_index: 0,
            }
        }

        fn complete(&mut self, descr: ReplyDescriptor) {
            let addr = self.rings.post_ring_addr() + (self.posted_index * REPLY_DESCR_SIZE) as u64;
            self.dma.write_at(addr, &descr.low().to_le_bytes()).unwrap();
            self.dma.write_at(addr + 4, &descr.data.to_le_bytes()).unwrap();
            self.posted_index += 1;
        }

        fn frame(&self, index: usize, status: u16) -> u32 {
            let addr = self.replies.base_addr() as u32 + (index * 128) as u32;
            let mut frame = [0u8; 20];
            put_u16(&mut frame, 14, status);
            self.dma.write_at(addr as u64, &frame).unwrap();
            addr
        }
    }

    #[test]
    fn test_descriptor_flags() {
        let fx = Fixture::new();
        let pool = fx.dispatcher.pool().clone();

        let mut io = pool.acquire().unwrap();
        io.encode(&ScsiIoRequest { dev_handle: 0x11, ..Default::default() });
        io.set_dev_handle(0x11);
        let mut tm = pool.acquire().unwrap();
        tm.encode(&TaskMgmtRequest::default());
        let mut other = pool.acquire().unwrap();
        other.encode(&PortEnableRequest::default());

        fx.dispatcher.start(io, None, drop);
        fx.dispatcher.start(tm, None, drop);
        fx.dispatcher.start(other, None, drop);

        let posted = fx.regs.posted.lock();
        assert_eq!(posted[0].flags, REQ_DESCR_SCSI_IO);
        assert_eq!(posted[0].dev_handle, 0x11);
        assert_eq!(posted[1].flags, REQ_DESCR_HIGH_PRIORITY);
        assert_eq!(posted[2].flags, REQ_DESCR_DEFAULT);
        assert!(posted.iter().all(|d| d.vf_id == 2));
        assert_eq!(fx.dispatcher.outstanding(), 3);
    }

    #[test]
    fn test_completion_attaches_reply() {
        let mut fx = Fixture::new();
        let pool = fx.dispatcher.pool().clone();
        let mut cmd = pool.acquire().unwrap();
        cmd.encode(&PortEnableRequest::default());
        let smid = cmd.smid();

        let status = Arc::new(spin::Mutex::new(None));
        let seen = status.clone();
        fx.dispatcher.start(cmd, None, move |cmd| {
            assert_eq!(cmd.function(), FUNCTION_PORT_ENABLE);
            *seen.lock() = cmd.reply().map(|r| r.status());
        });
        assert_eq!(pool.state(smid), SlotState::Queued);

        let frame = fx.frame(3, 0x0022);
        fx.complete(ReplyDescriptor { kind: 1, smid, data: frame });
        assert!(fx.dispatcher.handle_interrupt());
        assert!(!fx.dispatcher.handle_interrupt());

        assert_eq!(*status.lock(), Some(0x0022));
        assert_eq!(pool.state(smid), SlotState::Free);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_events_reach_sink() {
        struct Count(AtomicUsize);
        impl EventSink for Count {
            fn event(&self, reply: Reply) {
                assert_eq!(reply.header(), ReplyHeader::default());
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut fx = Fixture::new();
        let sink = Arc::new(Count(AtomicUsize::new(0)));
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        fx.dispatcher.set_event_sink(weak);

        let frame = fx.frame(0, 0);
        fx.complete(ReplyDescriptor { kind: 1, smid: 0, data: frame });
        // no frame, no smid: ignored
        fx.complete(ReplyDescriptor { kind: 0, smid: 0, data: 0 });
        assert!(fx.dispatcher.handle_interrupt());
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reply_for_idle_smid_is_recycled() {
        let mut fx = Fixture::new();
        let frame = fx.frame(5, 0);
        fx.complete(ReplyDescriptor { kind: 1, smid: 4, data: frame });
        assert!(fx.dispatcher.handle_interrupt());

        let mut entry = [0u8; 4];
        fx.dma.read_at(fx.rings.free_ring_addr() + 8 * 4, &mut entry).unwrap();
        assert_eq!(u32::from_le_bytes(entry), frame);
    }

    #[test]
    fn test_wait_times_out_then_late_completion_releases() {
        let mut fx = Fixture::new();
        let pool = fx.dispatcher.pool().clone();
        let cmd = pool.acquire().unwrap();
        let smid = cmd.smid();

        let mut config = HbaConfig::fast();
        config.admin_timeout = Duration::from_millis(20);
        let dispatcher = Dispatcher::new(
            &config,
            pool.clone(),
            fx.replies.clone(),
            fx.rings.clone(),
            Arc::new(Watchdog::new(pool.clone(), config.watchdog_tick)),
            0,
        );
        assert_eq!(dispatcher.wait(cmd).unwrap_err(), HbaError::Timeout);
        assert_eq!(pool.state(smid), SlotState::Queued);

        fx.complete(ReplyDescriptor { kind: 0, smid, data: 0 });
        assert!(dispatcher.handle_interrupt());
        assert_eq!(pool.state(smid), SlotState::Free);
    }

    #[test]
    fn test_abort_all_wakes_waiters() {
        let fx = Fixture::new();
        let pool = fx.dispatcher.pool().clone();
        let cmd = pool.acquire().unwrap();

        let dispatcher = fx.dispatcher.clone();
        let waiter = std::thread::spawn(move || dispatcher.wait(cmd).map(|c| c.smid()));
        while fx.dispatcher.outstanding() == 0 {
            std::thread::yield_now();
        }
        fx.dispatcher.abort_all();
        assert_eq!(waiter.join().unwrap(), Err(HbaError::Detached));
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_poll_runs_reply_path() {
        use crate::regs::IntrStatus;

        // reports the reply bit as set, so poll drains on every pass
        struct AlwaysReply(Posted);
        impl RegisterBlock for AlwaysReply {
            fn read(&self, _offset: u32) -> u32 {
                IntrStatus::REPLY.bits()
            }
            fn write(&self, offset: u32, value: u32) {
                self.0.write(offset, value)
            }
        }

        let config = HbaConfig::fast();
        let regs = Arc::new(AlwaysReply(Posted::default()));
        let dma = HostDma::new();
        let rings = Arc::new(Rings::new(regs.clone(), &dma, 32, 16).unwrap());
        let replies = ReplyPool::new(&dma, rings.clone(), 8, 128).unwrap();
        let pool = CommandPool::new(&dma, 8, 256).unwrap();
        let dispatcher = Dispatcher::new(
            &config,
            pool.clone(),
            replies,
            rings.clone(),
            Arc::new(Watchdog::new(pool.clone(), config.watchdog_tick)),
            0,
        );

        let cmd = pool.acquire().unwrap();
        let smid = cmd.smid();
        // completion already sitting in the ring when polling starts
        let descr = ReplyDescriptor { kind: 0, smid, data: 0 };
        dma.write_at(rings.post_ring_addr(), &descr.low().to_le_bytes()).unwrap();
        dma.write_at(rings.post_ring_addr() + 4, &0u32.to_le_bytes()).unwrap();

        let cmd = dispatcher.poll(cmd).unwrap();
        assert_eq!(cmd.smid(), smid);
        assert!(cmd.reply().is_none());
        assert!(!cmd.timed_out());
    }
}
