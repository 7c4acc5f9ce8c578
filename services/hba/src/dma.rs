//! # DMA Regions
//!
//! Host memory shared with the IOC. Every region has a device address that is
//! fixed for its whole lifetime and is zero-filled when handed out.
//!
//! Region memory is a slice of `AtomicU32` words. The IOC writes reply
//! frames and ring entries while the host reads them, so all accesses go
//! through atomic loads and stores rather than plain memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::{HbaError, HbaResult};

/// Alignment of device addresses handed out by [`HostDma`]
pub const DMA_ALIGN: u64 = 4096;

/// Default first device address of a [`HostDma`] allocator
pub const DEFAULT_DMA_BASE: u64 = 0x1000_0000;

/// Source of device-visible memory
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` zeroed bytes at a stable device address
    fn allocate(&self, size: usize) -> HbaResult<DmaRegion>;

    /// Returns a region to the allocator
    fn release(&self, region: DmaRegion) {
        drop(region);
    }
}

/// Backing store of one region
pub(crate) struct DmaMemory {
    words: Box<[AtomicU32]>,
    len: usize,
    device_addr: u64,
}

impl DmaMemory {
    fn new(len: usize, device_addr: u64) -> Self {
        let words = (0..len.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self {
            words,
            len,
            device_addr,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn device_addr(&self) -> u64 {
        self.device_addr
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset % 4 == 0);
        self.words[offset / 4].load(Ordering::Acquire)
    }

    pub(crate) fn write_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset % 4 == 0);
        self.words[offset / 4].store(value, Ordering::Release);
    }

    pub(crate) fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len, "DMA read out of bounds");
        let mut at = offset;
        for b in buf.iter_mut() {
            let word = self.words[at / 4].load(Ordering::Acquire);
            *b = (word >> ((at % 4) * 8)) as u8;
            at += 1;
        }
    }

    pub(crate) fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "DMA write out of bounds");
        let mut at = offset;
        let mut rest = data;
        while !rest.is_empty() {
            if at % 4 == 0 && rest.len() >= 4 {
                let value = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
                self.words[at / 4].store(value, Ordering::Release);
                at += 4;
                rest = &rest[4..];
                continue;
            }
            let shift = (at % 4) * 8;
            let word = &self.words[at / 4];
            word.fetch_and(!(0xFF << shift), Ordering::Relaxed);
            word.fetch_or((rest[0] as u32) << shift, Ordering::Release);
            at += 1;
            rest = &rest[1..];
        }
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, byte: u8) {
        assert!(offset + len <= self.len, "DMA fill out of bounds");
        if offset % 4 == 0 && len % 4 == 0 {
            let pattern = u32::from_ne_bytes([byte; 4]);
            for word in &self.words[offset / 4..(offset + len) / 4] {
                word.store(pattern, Ordering::Release);
            }
        } else {
            self.write_bytes(offset, &vec![byte; len]);
        }
    }
}

/// A contiguous, device-addressable block of host memory
///
/// Owned by exactly one component. Dropping the region releases it.
pub struct DmaRegion {
    mem: Arc<DmaMemory>,
    registry: Weak<Registry>,
}

impl DmaRegion {
    /// Device address of the first byte
    pub fn device_addr(&self) -> u64 {
        self.mem.device_addr()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// True for a zero-length region (never produced by [`HostDma`])
    pub fn is_empty(&self) -> bool {
        self.mem.len() == 0
    }

    /// Reads an aligned dword
    pub fn read_u32(&self, offset: usize) -> u32 {
        self.mem.read_u32(offset)
    }

    /// Writes an aligned dword
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.mem.write_u32(offset, value)
    }

    /// Copies bytes out of the region
    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        self.mem.read_bytes(offset, buf)
    }

    /// Copies bytes into the region
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.mem.write_bytes(offset, data)
    }

    /// Sets `len` bytes starting at `offset` to `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        self.mem.fill(offset, len, byte)
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.regions.lock().remove(&self.mem.device_addr());
        }
    }
}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("device_addr", &format_args!("{:#x}", self.device_addr()))
            .field("len", &self.len())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    regions: Mutex<BTreeMap<u64, Arc<DmaMemory>>>,
}

/// Allocator for host memory with a stable, identity-assigned device address.
///
/// Device addresses are handed out from a bump pointer and never reused, so
/// a stale address can never alias a newer region. The allocator keeps a
/// registry of live regions that a device model can resolve addresses with.
pub struct HostDma {
    registry: Arc<Registry>,
    next: Mutex<u64>,
    limit: Option<usize>,
}

impl HostDma {
    /// Creates an allocator starting at [`DEFAULT_DMA_BASE`]
    pub fn new() -> Self {
        Self::with_base(DEFAULT_DMA_BASE)
    }

    /// Creates an allocator handing out addresses from `base`
    pub fn with_base(base: u64) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            next: Mutex::new(base.next_multiple_of(DMA_ALIGN)),
            limit: None,
        }
    }

    /// Caps the number of live bytes
    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Number of regions not yet released
    pub fn live_regions(&self) -> usize {
        self.registry.regions.lock().len()
    }

    /// Number of bytes held by live regions
    pub fn live_bytes(&self) -> usize {
        self.registry.regions.lock().values().map(|m| m.len()).sum()
    }

    /// Resolves a device address to the region containing it and the offset
    pub(crate) fn resolve(&self, addr: u64) -> Option<(Arc<DmaMemory>, usize)> {
        let regions = self.registry.regions.lock();
        let (_, mem) = regions.range(..=addr).next_back()?;
        let offset = (addr - mem.device_addr()) as usize;
        if offset < mem.len() {
            Some((mem.clone(), offset))
        } else {
            None
        }
    }

    /// Device-side read of guest memory at a device address
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> HbaResult<()> {
        let (mem, offset) = self.resolve(addr).ok_or(HbaError::NoMemory)?;
        if offset + buf.len() > mem.len() {
            return Err(HbaError::InvalidSize);
        }
        mem.read_bytes(offset, buf);
        Ok(())
    }

    /// Device-side write of guest memory at a device address
    pub fn write_at(&self, addr: u64, data: &[u8]) -> HbaResult<()> {
        let (mem, offset) = self.resolve(addr).ok_or(HbaError::NoMemory)?;
        if offset + data.len() > mem.len() {
            return Err(HbaError::InvalidSize);
        }
        mem.write_bytes(offset, data);
        Ok(())
    }
}

impl Default for HostDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HostDma {
    fn allocate(&self, size: usize) -> HbaResult<DmaRegion> {
        if size == 0 {
            return Err(HbaError::InvalidSize);
        }

        let mut regions = self.registry.regions.lock();
        if let Some(limit) = self.limit {
            let used: usize = regions.values().map(|m| m.len()).sum();
            if used + size > limit {
                log::warn!("dma: allocation of {} bytes exceeds limit", size);
                return Err(HbaError::NoMemory);
            }
        }

        let addr = {
            let mut next = self.next.lock();
            let addr = *next;
            *next = (addr + size as u64).next_multiple_of(DMA_ALIGN);
            addr
        };

        let mem = Arc::new(DmaMemory::new(size, addr));
        regions.insert(addr, mem.clone());
        log::trace!("dma: allocated {} bytes at {:#x}", size, addr);

        Ok(DmaRegion {
            mem,
            registry: Arc::downgrade(&self.registry),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed_and_aligned() {
        let dma = HostDma::new();
        let region = dma.allocate(100).unwrap();
        assert_eq!(region.len(), 100);
        assert_eq!(region.device_addr() % DMA_ALIGN, 0);

        let mut buf = [0xAAu8; 100];
        region.read_bytes(0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_addresses_are_stable_and_distinct() {
        let dma = HostDma::new();
        let a = dma.allocate(5000).unwrap();
        let b = dma.allocate(16).unwrap();
        assert!(b.device_addr() >= a.device_addr() + 5000);
        let addr = a.device_addr();
        drop(b);
        assert_eq!(a.device_addr(), addr);
    }

    #[test]
    fn test_unaligned_bytes() {
        let dma = HostDma::new();
        let region = dma.allocate(16).unwrap();
        region.write_bytes(3, &[1, 2, 3, 4, 5, 6]);
        let mut buf = [0u8; 10];
        region.read_bytes(1, &mut buf);
        assert_eq!(buf, [0, 0, 1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(region.read_u32(4), u32::from_le_bytes([2, 3, 4, 5]));
    }

    #[test]
    fn test_fill() {
        let dma = HostDma::new();
        let region = dma.allocate(32).unwrap();
        region.fill(0, 32, 0xFF);
        assert_eq!(region.read_u32(28), 0xFFFF_FFFF);
        region.fill(1, 2, 0x00);
        assert_eq!(region.read_u32(0), 0xFF00_00FF);
    }

    #[test]
    fn test_zero_size_rejected() {
        let dma = HostDma::new();
        assert_eq!(dma.allocate(0).unwrap_err(), HbaError::InvalidSize);
    }

    #[test]
    fn test_limit() {
        let dma = HostDma::new().with_limit(1024);
        let a = dma.allocate(1000).unwrap();
        assert_eq!(dma.allocate(100).unwrap_err(), HbaError::NoMemory);
        dma.release(a);
        assert!(dma.allocate(100).is_ok());
    }

    #[test]
    fn test_release_unregisters() {
        let dma = HostDma::new();
        let region = dma.allocate(64).unwrap();
        let addr = region.device_addr();
        assert_eq!(dma.live_regions(), 1);
        assert!(dma.resolve(addr + 8).is_some());
        dma.release(region);
        assert_eq!(dma.live_regions(), 0);
        assert!(dma.resolve(addr + 8).is_none());
    }

    #[test]
    fn test_device_side_access() {
        let dma = HostDma::new();
        let region = dma.allocate(64).unwrap();
        dma.write_at(region.device_addr() + 8, &[9, 8, 7]).unwrap();
        let mut buf = [0u8; 3];
        region.read_bytes(8, &mut buf);
        assert_eq!(buf, [9, 8, 7]);
        assert!(dma.write_at(region.device_addr() + 62, &[0; 4]).is_err());
    }
}
