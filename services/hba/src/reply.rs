//! # Reply Reception Pool
//!
//! Reply frames the IOC writes into. Every frame's device address circulates
//! host → free ring → IOC → post ring → host. A [`Reply`] is the host's claim
//! on one frame; dropping it is the only way the address goes back onto the
//! free ring, so each consumed frame is returned exactly once.

use std::sync::Arc;

use crate::dma::{DmaAllocator, DmaRegion};
use crate::mpi::ReplyHeader;
use crate::ring::Rings;
use crate::HbaResult;

/// Reply frame region
pub struct ReplyPool {
    region: DmaRegion,
    rings: Arc<Rings>,
    count: usize,
    reply_size: usize,
}

impl ReplyPool {
    /// Allocates `count` frames of `reply_size` bytes
    pub fn new(
        dma: &dyn DmaAllocator,
        rings: Arc<Rings>,
        count: usize,
        reply_size: usize,
    ) -> HbaResult<Arc<Self>> {
        let region = dma.allocate(count * reply_size)?;
        Ok(Arc::new(Self {
            region,
            rings,
            count,
            reply_size,
        }))
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reply_size(&self) -> usize {
        self.reply_size
    }

    /// Device address of the first frame
    pub fn base_addr(&self) -> u64 {
        self.region.device_addr()
    }

    fn frame_addr(&self, index: usize) -> u32 {
        (self.region.device_addr() + (index * self.reply_size) as u64) as u32
    }

    /// Places every frame on the free ring.
    ///
    /// The host index is published later by [`Rings::init_queues`].
    pub fn seed_all(&self) {
        for index in 0..self.count {
            self.rings.seed_free(self.frame_addr(index));
        }
    }

    /// Claims the frame an address reply points at
    pub fn lookup(self: &Arc<Self>, frame_addr: u32) -> Option<Reply> {
        let base = self.region.device_addr() as u32;
        let offset = frame_addr.wrapping_sub(base) as usize;
        if frame_addr < base || offset % self.reply_size != 0 || offset / self.reply_size >= self.count {
            log::warn!("hba: reply address {:#010x} outside the reply pool", frame_addr);
            return None;
        }

        Some(Reply {
            pool: self.clone(),
            index: offset / self.reply_size,
        })
    }
}

/// Owned claim on one reply frame
pub struct Reply {
    pool: Arc<ReplyPool>,
    index: usize,
}

impl Reply {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Device address of the frame
    pub fn device_addr(&self) -> u32 {
        self.pool.frame_addr(self.index)
    }

    /// Copies the frame out of DMA memory
    pub fn bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.pool.reply_size];
        self.pool
            .region
            .read_bytes(self.index * self.pool.reply_size, &mut buf);
        buf
    }

    pub fn header(&self) -> ReplyHeader {
        ReplyHeader::decode(&self.bytes())
    }

    /// IOC status, masked
    pub fn status(&self) -> u16 {
        self.header().status()
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        self.pool.rings.return_reply_buffer(self.device_addr());
    }
}

impl core::fmt::Debug for Reply {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reply")
            .field("index", &self.index)
            .field("device_addr", &format_args!("{:#x}", self.device_addr()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::mpi::{put_u16, FUNCTION_CONFIG};
    use crate::regs::{RegisterBlock, REG_REPLY_FREE_HOST_INDEX};

    #[derive(Default)]
    struct FreeIndex(std::sync::atomic::AtomicU32);

    impl RegisterBlock for FreeIndex {
        fn read(&self, _offset: u32) -> u32 {
            self.0.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn write(&self, offset: u32, value: u32) {
            if offset == REG_REPLY_FREE_HOST_INDEX {
                self.0.store(value, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    fn setup(count: usize) -> (Arc<FreeIndex>, HostDma, Arc<Rings>, Arc<ReplyPool>) {
        let regs = Arc::new(FreeIndex::default());
        let dma = HostDma::new();
        let rings = Arc::new(Rings::new(regs.clone(), &dma, 32, 16).unwrap());
        let pool = ReplyPool::new(&dma, rings.clone(), count, 128).unwrap();
        (regs, dma, rings, pool)
    }

    #[test]
    fn test_seed_publishes_true_count() {
        let (regs, _dma, rings, pool) = setup(10);
        pool.seed_all();
        rings.init_queues();
        assert_eq!(regs.read(REG_REPLY_FREE_HOST_INDEX), 10);
    }

    #[test]
    fn test_lookup_bounds() {
        let (_regs, _dma, _rings, pool) = setup(4);
        let base = pool.base_addr() as u32;
        assert_eq!(pool.lookup(base + 128).map(|r| r.index()), Some(1));
        assert!(pool.lookup(base + 129).is_none());
        assert!(pool.lookup(base + 4 * 128).is_none());
        assert!(pool.lookup(base.wrapping_sub(128)).is_none());
    }

    #[test]
    fn test_drop_returns_once() {
        let (regs, dma, rings, pool) = setup(4);
        pool.seed_all();
        rings.init_queues();
        let reply = pool.lookup(pool.base_addr() as u32 + 256).unwrap();

        let mut frame = [0u8; 20];
        frame[3] = FUNCTION_CONFIG;
        put_u16(&mut frame, 14, 0x8022);
        dma.write_at(reply.device_addr() as u64, &frame).unwrap();
        assert_eq!(reply.header().function, FUNCTION_CONFIG);
        assert_eq!(reply.status(), 0x0022);

        drop(reply);
        assert_eq!(regs.read(REG_REPLY_FREE_HOST_INDEX), 5);
        let mut entry = [0u8; 4];
        dma.read_at(rings.free_ring_addr() + 16, &mut entry).unwrap();
        assert_eq!(u32::from_le_bytes(entry), pool.base_addr() as u32 + 256);
    }
}
