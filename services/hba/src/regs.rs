//! # IOC Register Map
//!
//! System interface registers of a Fusion-MPT IOC, mapped through PCI BAR 1.
//! The driver only ever touches them through [`RegisterBlock`], so the same
//! code drives real hardware ([`MmioRegion`]) and the simulated IOC.

use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

// =============================================================================
// Register Offsets
// =============================================================================

/// System doorbell
pub const REG_DOORBELL: u32 = 0x00;
/// Write sequence (diagnostic unlock)
pub const REG_WRITESEQ: u32 = 0x04;
/// Host diagnostic
pub const REG_HOSTDIAG: u32 = 0x08;
/// Host interrupt status
pub const REG_INTR_STATUS: u32 = 0x30;
/// Host interrupt mask
pub const REG_INTR_MASK: u32 = 0x34;
/// Reply free host index
pub const REG_REPLY_FREE_HOST_INDEX: u32 = 0x48;
/// Reply post host index
pub const REG_REPLY_POST_HOST_INDEX: u32 = 0x6C;
/// Request descriptor post, low dword
pub const REG_REQ_DESCR_POST_LOW: u32 = 0xC0;
/// Request descriptor post, high dword
pub const REG_REQ_DESCR_POST_HIGH: u32 = 0xC4;

// =============================================================================
// Doorbell Fields
// =============================================================================

/// IOC state field
pub const DOORBELL_STATE: u32 = 0xF000_0000;
/// Reset state
pub const DOORBELL_STATE_RESET: u32 = 0x0000_0000;
/// Ready state
pub const DOORBELL_STATE_READY: u32 = 0x1000_0000;
/// Operational state
pub const DOORBELL_STATE_OPER: u32 = 0x2000_0000;
/// Fault state
pub const DOORBELL_STATE_FAULT: u32 = 0x4000_0000;

/// Doorbell in use by a handshake
pub const DOORBELL_INUSE: u32 = 0x0800_0000;

/// Who initialised the IOC
pub const DOORBELL_WHOINIT: u32 = 0x0700_0000;
/// Initialised by a PCI peer (BIOS or another OS instance)
pub const DOORBELL_WHOINIT_PCIPEER: u32 = 0x0300_0000;
/// Initialised by a host driver
pub const DOORBELL_WHOINIT_HOST: u32 = 0x0400_0000;

/// Handshake data field
pub const DOORBELL_DATA_MASK: u32 = 0x0000_FFFF;

/// Places a function code in the doorbell
pub const fn doorbell_function(function: u8) -> u32 {
    (function as u32) << 24
}

/// Places a handshake dword count in the doorbell
pub const fn doorbell_dwords(count: u8) -> u32 {
    (count as u32) << 16
}

/// Diagnostic unlock sequence written to [`REG_WRITESEQ`]
pub const WRITESEQ_KEYS: [u32; 7] = [0x0, 0xF, 0x4, 0xB, 0x2, 0x7, 0xD];

/// Re-locks the diagnostic register
pub const WRITESEQ_LOCK: u32 = 0xFF;

bitflags! {
    /// Host interrupt status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntrStatus: u32 {
        /// IOC wrote the doorbell
        const IOC2SYSDB = 0x0000_0001;
        /// Reply descriptors posted
        const REPLY = 0x0000_0008;
        /// System doorbell write not yet consumed by the IOC
        const SYS2IOCDB = 0x8000_0000;
    }
}

bitflags! {
    /// Host interrupt mask bits (set = masked)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntrMask: u32 {
        /// Doorbell interrupt
        const DOORBELL = 0x0000_0001;
        /// Reply interrupt
        const REPLY = 0x0000_0008;
        /// Reset interrupt
        const RESET = 0x4000_0000;
    }
}

bitflags! {
    /// Host diagnostic register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostDiag: u32 {
        /// Reset the whole adapter
        const RESET_ADAPTER = 0x0000_0004;
        /// Diagnostic write enable
        const DWRE = 0x0000_0080;
    }
}

// =============================================================================
// IOC State
// =============================================================================

/// IOC state reported in the doorbell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IocState {
    Reset = DOORBELL_STATE_RESET,
    Ready = DOORBELL_STATE_READY,
    Operational = DOORBELL_STATE_OPER,
    Fault = DOORBELL_STATE_FAULT,
    /// Any other encoding (e.g. core dump)
    Unknown = DOORBELL_STATE,
}

impl IocState {
    /// Decodes the state field of a doorbell value
    pub fn from_doorbell(doorbell: u32) -> Self {
        match doorbell & DOORBELL_STATE {
            DOORBELL_STATE_RESET => IocState::Reset,
            DOORBELL_STATE_READY => IocState::Ready,
            DOORBELL_STATE_OPER => IocState::Operational,
            DOORBELL_STATE_FAULT => IocState::Fault,
            _ => IocState::Unknown,
        }
    }
}

// =============================================================================
// Register Access
// =============================================================================

/// 32-bit register window of one IOC
pub trait RegisterBlock: Send + Sync {
    /// Reads the register at `offset`
    fn read(&self, offset: u32) -> u32;

    /// Writes the register at `offset`
    fn write(&self, offset: u32, value: u32);

    /// Orders preceding register writes before anything that follows
    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Memory-mapped register window
pub struct MmioRegion {
    base: usize,
}

impl MmioRegion {
    /// Wraps a mapped BAR.
    ///
    /// # Safety
    ///
    /// `base` must point at a mapping of the IOC's system interface registers
    /// that stays valid, uncached and exclusive to this driver for the
    /// lifetime of the region.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

// SAFETY: the mapping is device memory; every access is a single volatile
// 32-bit load or store.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl RegisterBlock for MmioRegion {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `new` guarantees the window is mapped
        unsafe { core::ptr::read_volatile((self.base + offset as usize) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: `new` guarantees the window is mapped
        unsafe { core::ptr::write_volatile((self.base + offset as usize) as *mut u32, value) }
    }
}
