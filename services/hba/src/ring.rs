//! # Descriptor Rings
//!
//! Normal (non-handshake) traffic between host and IOC:
//!
//! - Requests are posted by writing an 8-byte request descriptor to the two
//!   request descriptor post registers.
//! - The IOC reports completions in the reply descriptor post ring and the
//!   host publishes how far it has consumed it.
//! - Reply frames travel back to the IOC through the reply free ring.
//!
//! Each ring has its own lock; none is ever held while taking another.

use std::sync::Arc;

use spin::Mutex;

use crate::dma::{DmaAllocator, DmaRegion};
use crate::regs::{
    IntrMask, IntrStatus, RegisterBlock, REG_INTR_MASK, REG_INTR_STATUS, REG_REPLY_FREE_HOST_INDEX,
    REG_REPLY_POST_HOST_INDEX, REG_REQ_DESCR_POST_HIGH, REG_REQ_DESCR_POST_LOW,
};
use crate::HbaResult;

// =============================================================================
// Descriptors
// =============================================================================

/// SCSI I/O request; the descriptor carries the device handle
pub const REQ_DESCR_SCSI_IO: u8 = 0x00;
/// High priority request (task management)
pub const REQ_DESCR_HIGH_PRIORITY: u8 = 0x06;
/// Any other request
pub const REQ_DESCR_DEFAULT: u8 = 0x08;

/// Reply descriptor type field
pub const REPLY_DESCR_TYPE_MASK: u32 = 0x0F;
/// Successful SCSI I/O, no reply frame
pub const REPLY_DESCR_SCSI_IO_SUCCESS: u8 = 0x00;
/// Reply frame attached
pub const REPLY_DESCR_ADDRESS_REPLY: u8 = 0x01;
/// Entry not written by the IOC
pub const REPLY_DESCR_UNUSED: u8 = 0x0F;

/// Size of one reply descriptor
pub const REPLY_DESCR_SIZE: usize = 8;

/// Marker for an entry the IOC has not finished writing
const DESCR_UNUSED_WORD: u32 = 0xFFFF_FFFF;

/// Request descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub flags: u8,
    pub vf_id: u8,
    pub smid: u16,
    pub lmid: u16,
    pub dev_handle: u16,
}

impl RequestDescriptor {
    pub fn low(&self) -> u32 {
        self.flags as u32 | (self.vf_id as u32) << 8 | (self.smid as u32) << 16
    }

    pub fn high(&self) -> u32 {
        self.lmid as u32 | (self.dev_handle as u32) << 16
    }

    pub fn from_halves(low: u32, high: u32) -> Self {
        Self {
            flags: low as u8,
            vf_id: (low >> 8) as u8,
            smid: (low >> 16) as u16,
            lmid: high as u16,
            dev_handle: (high >> 16) as u16,
        }
    }
}

/// Reply descriptor as consumed from the post ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyDescriptor {
    pub kind: u8,
    pub smid: u16,
    /// Reply frame address for address replies, task tag otherwise
    pub data: u32,
}

impl ReplyDescriptor {
    pub fn from_halves(low: u32, high: u32) -> Self {
        Self {
            kind: (low & REPLY_DESCR_TYPE_MASK) as u8,
            smid: (low >> 16) as u16,
            data: high,
        }
    }

    pub fn low(&self) -> u32 {
        self.kind as u32 | (self.smid as u32) << 16
    }

    pub fn is_address_reply(&self) -> bool {
        self.kind == REPLY_DESCR_ADDRESS_REPLY
    }
}

// =============================================================================
// Rings
// =============================================================================

/// Reply post ring, reply free ring and the request post registers
pub struct Rings {
    regs: Arc<dyn RegisterBlock>,
    post: DmaRegion,
    post_depth: usize,
    free: DmaRegion,
    free_depth: usize,
    /// Serialises the two-register request post
    submit: Mutex<()>,
    /// Next post ring entry to consume
    post_index: Mutex<usize>,
    /// Next free ring entry to fill
    free_index: Mutex<usize>,
}

impl Rings {
    /// Allocates both rings. The post ring starts out all unused.
    pub fn new(
        regs: Arc<dyn RegisterBlock>,
        dma: &dyn DmaAllocator,
        post_depth: usize,
        free_depth: usize,
    ) -> HbaResult<Self> {
        let post = dma.allocate(post_depth * REPLY_DESCR_SIZE)?;
        post.fill(0, post.len(), 0xFF);
        let free = dma.allocate(free_depth * 4)?;

        Ok(Self {
            regs,
            post,
            post_depth,
            free,
            free_depth,
            submit: Mutex::new(()),
            post_index: Mutex::new(0),
            free_index: Mutex::new(0),
        })
    }

    pub fn post_depth(&self) -> usize {
        self.post_depth
    }

    pub fn free_depth(&self) -> usize {
        self.free_depth
    }

    pub fn post_ring_addr(&self) -> u64 {
        self.post.device_addr()
    }

    pub fn free_ring_addr(&self) -> u64 {
        self.free.device_addr()
    }

    /// Hands a request to the IOC.
    ///
    /// The IOC latches the descriptor on the high write, so both halves go
    /// out under one lock with a barrier after each.
    pub fn post_request(&self, descr: RequestDescriptor) {
        log::trace!(
            "hba: post smid {} flags {:#04x} handle {:#06x}",
            descr.smid,
            descr.flags,
            descr.dev_handle
        );
        let _guard = self.submit.lock();
        self.regs.write(REG_REQ_DESCR_POST_LOW, descr.low());
        self.regs.barrier();
        self.regs.write(REG_REQ_DESCR_POST_HIGH, descr.high());
        self.regs.barrier();
    }

    /// Consumes every completed reply descriptor.
    ///
    /// Consumed entries are reset to unused and the host index is published
    /// once for the whole batch.
    pub fn drain_post_ring(&self) -> Vec<ReplyDescriptor> {
        let mut index = self.post_index.lock();
        let mut out = Vec::new();

        loop {
            let offset = *index * REPLY_DESCR_SIZE;
            let low = self.post.read_u32(offset);
            if (low & REPLY_DESCR_TYPE_MASK) as u8 == REPLY_DESCR_UNUSED {
                break;
            }
            let high = self.post.read_u32(offset + 4);
            if high == DESCR_UNUSED_WORD {
                break;
            }

            out.push(ReplyDescriptor::from_halves(low, high));
            self.post.write_u32(offset, DESCR_UNUSED_WORD);
            self.post.write_u32(offset + 4, DESCR_UNUSED_WORD);

            *index += 1;
            if *index >= self.post_depth {
                *index = 0;
            }
        }

        if !out.is_empty() {
            self.regs.write(REG_REPLY_POST_HOST_INDEX, *index as u32);
            self.regs.barrier();
        }
        out
    }

    /// Gives a reply frame back to the IOC
    pub fn return_reply_buffer(&self, frame_addr: u32) {
        let mut index = self.free_index.lock();
        self.push_free(&mut index, frame_addr);
        self.regs.write(REG_REPLY_FREE_HOST_INDEX, *index as u32);
        self.regs.barrier();
    }

    /// Writes a free ring entry without publishing the host index
    pub(crate) fn seed_free(&self, frame_addr: u32) {
        let mut index = self.free_index.lock();
        self.push_free(&mut index, frame_addr);
    }

    fn push_free(&self, index: &mut usize, frame_addr: u32) {
        self.free.write_u32(*index * 4, frame_addr);
        *index += 1;
        if *index >= self.free_depth {
            *index = 0;
        }
    }

    /// Publishes both host indices after IOC init
    pub fn init_queues(&self) {
        let post = *self.post_index.lock();
        let free = *self.free_index.lock();
        self.regs.write(REG_REPLY_FREE_HOST_INDEX, free as u32);
        self.regs.write(REG_REPLY_POST_HOST_INDEX, post as u32);
        self.regs.barrier();
    }

    /// True if the IOC has posted reply descriptors
    pub fn reply_waiting(&self) -> bool {
        IntrStatus::from_bits_truncate(self.regs.read(REG_INTR_STATUS)).contains(IntrStatus::REPLY)
    }

    /// Unmasks the reply interrupt, or masks everything
    pub fn set_interrupts(&self, enabled: bool) {
        let mask = if enabled {
            IntrMask::DOORBELL | IntrMask::RESET
        } else {
            IntrMask::DOORBELL | IntrMask::REPLY | IntrMask::RESET
        };
        self.regs.write(REG_INTR_MASK, mask.bits());
        self.regs.barrier();
    }
}
