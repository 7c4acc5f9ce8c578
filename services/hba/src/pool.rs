//! # Command Slot Pool
//!
//! Request frames live in one DMA region, one fixed-size frame per slot. A
//! slot is identified by its SMID (system message id), which is also the
//! frame index. SMID 0 is reserved by the message unit and never handed out.
//!
//! A [`Command`] is the owned token for one slot. Dropping it zeroes the frame
//! and returns the slot to the free list.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use spin::Mutex;

use crate::dma::{DmaAllocator, DmaRegion};
use crate::mpi::{Request, FUNCTION_OFFSET};
use crate::reply::Reply;
use crate::HbaResult;

/// Lifecycle of a command slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// On the free list
    Free = 0,
    /// Owned by a caller
    Ready = 1,
    /// Posted to the IOC
    Queued = 2,
    /// Posted and past its deadline
    Timeout = 3,
}

impl SlotState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => SlotState::Ready,
            2 => SlotState::Queued,
            3 => SlotState::Timeout,
            _ => SlotState::Free,
        }
    }
}

/// Per-slot state shared between the owner, the dispatcher and the watchdog
struct Slot {
    state: AtomicU8,
    dev_handle: AtomicU16,
}

/// Fixed pool of command slots over one request frame region
pub struct CommandPool {
    region: DmaRegion,
    frame_size: usize,
    slots: Box<[Slot]>,
    free: Mutex<Vec<u16>>,
}

impl CommandPool {
    /// Allocates `max_slots` frames of `frame_size` bytes.
    ///
    /// Frame 0 backs SMID 0 and is never used, so the pool can hand out
    /// `max_slots - 1` commands.
    pub fn new(dma: &dyn DmaAllocator, max_slots: usize, frame_size: usize) -> HbaResult<Arc<Self>> {
        let region = dma.allocate(max_slots * frame_size)?;
        let slots = (0..max_slots)
            .map(|_| Slot {
                state: AtomicU8::new(SlotState::Free as u8),
                dev_handle: AtomicU16::new(0),
            })
            .collect();
        // LIFO: the lowest SMID goes out first
        let free = (1..max_slots as u16).rev().collect();

        Ok(Arc::new(Self {
            region,
            frame_size,
            slots,
            free: Mutex::new(free),
        }))
    }

    /// Takes a free slot, or `None` when every slot is in use
    pub fn acquire(self: &Arc<Self>) -> Option<Command> {
        let smid = self.free.lock().pop()?;
        self.slots[smid as usize]
            .state
            .store(SlotState::Ready as u8, Ordering::Release);
        Some(Command {
            pool: self.clone(),
            smid,
            reply: None,
            timed_out: false,
        })
    }

    /// Like [`acquire`](Self::acquire), retrying until `timeout` passes
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(cmd) = self.acquire() {
                return Some(cmd);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Returns a command to the pool
    pub fn release(&self, cmd: Command) {
        drop(cmd);
    }

    /// Slots currently on the free list
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Slots the pool can hand out
    pub fn capacity(&self) -> usize {
        self.slots.len().saturating_sub(1)
    }

    /// Size of one request frame in bytes
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Device address of the first frame
    pub fn base_addr(&self) -> u64 {
        self.region.device_addr()
    }

    /// Lifecycle state of a slot
    pub fn state(&self, smid: u16) -> SlotState {
        self.slots
            .get(smid as usize)
            .map(|s| SlotState::from_raw(s.state.load(Ordering::Acquire)))
            .unwrap_or(SlotState::Free)
    }

    /// Device handle the slot was last addressed to
    pub fn dev_handle(&self, smid: u16) -> u16 {
        self.slots
            .get(smid as usize)
            .map(|s| s.dev_handle.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub(crate) fn set_state(&self, smid: u16, state: SlotState) {
        self.slots[smid as usize]
            .state
            .store(state as u8, Ordering::Release);
    }

    /// Stores `state`, returning the previous one
    pub(crate) fn swap_state(&self, smid: u16, state: SlotState) -> SlotState {
        SlotState::from_raw(self.slots[smid as usize].state.swap(state as u8, Ordering::AcqRel))
    }

    /// Moves `from` to `to` only if the slot is still in `from`
    pub(crate) fn transition(&self, smid: u16, from: SlotState, to: SlotState) -> bool {
        self.slots[smid as usize]
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn frame_offset(&self, smid: u16) -> usize {
        smid as usize * self.frame_size
    }

    /// Puts a slot back on the free list
    pub(crate) fn put(&self, smid: u16) {
        let slot = &self.slots[smid as usize];
        if slot.state.load(Ordering::Acquire) == SlotState::Free as u8 {
            log::warn!("hba: smid {} returned while already free", smid);
            return;
        }

        self.region.fill(self.frame_offset(smid), self.frame_size, 0);
        slot.dev_handle.store(0, Ordering::Relaxed);
        slot.state.store(SlotState::Free as u8, Ordering::Release);
        self.free.lock().push(smid);
    }
}

/// Owned token for one command slot
pub struct Command {
    pool: Arc<CommandPool>,
    smid: u16,
    reply: Option<Reply>,
    timed_out: bool,
}

impl Command {
    /// System message id
    pub fn smid(&self) -> u16 {
        self.smid
    }

    /// Byte offset of the frame in the request region
    pub fn frame_offset(&self) -> usize {
        self.pool.frame_offset(self.smid)
    }

    /// Device address of the frame
    pub fn frame_addr(&self) -> u64 {
        self.pool.base_addr() + self.frame_offset() as u64
    }

    /// Frame size in bytes
    pub fn frame_size(&self) -> usize {
        self.pool.frame_size
    }

    /// Target device handle
    pub fn dev_handle(&self) -> u16 {
        self.pool.dev_handle(self.smid)
    }

    pub fn set_dev_handle(&mut self, handle: u16) {
        self.pool.slots[self.smid as usize]
            .dev_handle
            .store(handle, Ordering::Release);
    }

    /// Function code of the request in the frame
    pub fn function(&self) -> u8 {
        let mut byte = [0u8];
        self.read_frame(FUNCTION_OFFSET, &mut byte);
        byte[0]
    }

    /// Encodes a request at the start of the frame
    pub fn encode<R: Request>(&mut self, request: &R) {
        self.write_frame(0, &request.to_bytes());
    }

    /// Writes raw bytes into the frame
    pub fn write_frame(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.frame_size(), "write past request frame");
        self.pool.region.write_bytes(self.frame_offset() + offset, data);
    }

    /// Reads raw bytes out of the frame
    pub fn read_frame(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.frame_size(), "read past request frame");
        self.pool.region.read_bytes(self.frame_offset() + offset, buf);
    }

    /// Reply frame attached at completion; `None` means plain success
    pub fn reply(&self) -> Option<&Reply> {
        self.reply.as_ref()
    }

    /// Detaches the reply frame
    pub fn take_reply(&mut self) -> Option<Reply> {
        self.reply.take()
    }

    /// True if the command completed after its deadline had passed
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Clears the completion state so the slot can be posted again
    pub fn reset(&mut self) {
        self.reply = None;
        self.timed_out = false;
        let (offset, size) = (self.frame_offset(), self.frame_size());
        self.pool.region.fill(offset, size, 0);
    }

    pub(crate) fn complete(&mut self, reply: Option<Reply>, timed_out: bool) {
        self.reply = reply;
        self.timed_out = timed_out;
    }

    pub(crate) fn pool(&self) -> &Arc<CommandPool> {
        &self.pool
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.reply.take();
        self.pool.put(self.smid);
    }
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("smid", &self.smid)
            .field("dev_handle", &self.dev_handle())
            .field("reply", &self.reply.is_some())
            .field("timed_out", &self.timed_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::mpi::{PortEnableRequest, FUNCTION_PORT_ENABLE};
    use std::collections::BTreeSet;

    fn pool(slots: usize) -> (HostDma, Arc<CommandPool>) {
        let dma = HostDma::new();
        let pool = CommandPool::new(&dma, slots, 128).unwrap();
        (dma, pool)
    }

    #[test]
    fn test_smid_zero_never_handed_out() {
        let (_dma, pool) = pool(8);
        assert_eq!(pool.capacity(), 7);
        let cmds: Vec<_> = (0..7).map(|_| pool.acquire().unwrap()).collect();
        assert!(cmds.iter().all(|c| c.smid() != 0));
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn test_slot_exclusivity() {
        let (_dma, pool) = pool(32);
        let cmds: Vec<_> = std::iter::from_fn(|| pool.acquire()).collect();
        let smids: BTreeSet<u16> = cmds.iter().map(|c| c.smid()).collect();
        assert_eq!(smids.len(), cmds.len());
        assert_eq!(cmds.len(), 31);
        assert_eq!(pool.available(), 0);
        drop(cmds);
        assert_eq!(pool.available(), 31);
    }

    #[test]
    fn test_release_zeroes_frame() {
        let (_dma, pool) = pool(2);
        let mut cmd = pool.acquire().unwrap();
        cmd.encode(&PortEnableRequest { vf_id: 3 });
        cmd.set_dev_handle(0x11);
        assert_eq!(cmd.function(), FUNCTION_PORT_ENABLE);
        assert_eq!(pool.state(1), SlotState::Ready);
        pool.release(cmd);

        assert_eq!(pool.state(1), SlotState::Free);
        let cmd = pool.acquire().unwrap();
        let mut frame = [0xAAu8; 128];
        cmd.read_frame(0, &mut frame);
        assert!(frame.iter().all(|&b| b == 0));
        assert_eq!(cmd.dev_handle(), 0);
    }

    #[test]
    fn test_double_release_ignored() {
        let (_dma, pool) = pool(4);
        let cmd = pool.acquire().unwrap();
        let smid = cmd.smid();
        drop(cmd);
        assert_eq!(pool.available(), 3);

        pool.put(smid);
        assert_eq!(pool.available(), 3);

        let smids: BTreeSet<u16> = std::iter::from_fn(|| pool.acquire()).map(|c| {
            let smid = c.smid();
            std::mem::forget(c);
            smid
        }).collect();
        assert_eq!(smids.len(), 3);
    }

    #[test]
    fn test_frame_addresses() {
        let (_dma, pool) = pool(4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.frame_addr(), pool.base_addr() + 128);
        assert_eq!(b.frame_addr() - a.frame_addr(), 128);
    }

    #[test]
    fn test_transitions() {
        let (_dma, pool) = pool(4);
        let cmd = pool.acquire().unwrap();
        let smid = cmd.smid();
        pool.set_state(smid, SlotState::Queued);
        assert!(pool.transition(smid, SlotState::Queued, SlotState::Timeout));
        assert!(!pool.transition(smid, SlotState::Queued, SlotState::Timeout));
        assert_eq!(pool.swap_state(smid, SlotState::Ready), SlotState::Timeout);
    }

    #[test]
    fn test_acquire_timeout() {
        let (_dma, pool) = pool(2);
        let held = pool.acquire().unwrap();
        assert!(pool.acquire_timeout(Duration::from_millis(5)).is_none());

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire_timeout(Duration::from_secs(5)).map(|c| c.smid()))
        };
        std::thread::sleep(Duration::from_millis(10));
        drop(held);
        assert_eq!(waiter.join().unwrap(), Some(1));
    }
}
