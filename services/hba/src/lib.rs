//! # S-HBA: Fusion-MPT Host Bus Adapter Core
//!
//! S-HBA drives SAS/RAID controllers that speak the Fusion-MPT 2/3 message
//! passing interface. Requests are encoded into fixed-size message frames,
//! posted to the I/O controller (IOC) through a request descriptor register,
//! and completed through a reply descriptor ring written by the device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          Storage stack glue / management (bio) glue            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  Controller: attach / interrupt / detach / scsi_request / raid │
//! ├──────────────┬──────────────┬───────────────┬──────────────────┤
//! │  Dispatcher  │  Event       │  Recovery     │  Config/Discovery│
//! │  start/wait/ │  Pipeline    │  Watchdog +   │  headers, pages, │
//! │  poll, intr  │  (workqueues)│  target reset │  RAID inventory  │
//! ├──────────────┴──────────────┴───────────────┴──────────────────┤
//! │  Command Pool (SMIDs)  │  Reply Pool  │  Rings + Doorbell       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          DMA regions               │     MMIO registers        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let regs = Arc::new(unsafe { MmioRegion::new(bar0) });
//! let hba = Controller::attach(regs, dma, bus, HbaConfig::default())?;
//! hba.scsi_request(transfer, |result| complete(result));
//! ```

pub mod config;
pub mod controller;
pub mod devices;
pub mod dispatch;
pub mod dma;
pub mod doorbell;
pub mod events;
pub mod mpi;
pub mod pool;
pub mod raid;
pub mod recovery;
pub mod regs;
pub mod reply;
pub mod ring;
pub mod scsi;
pub mod sgl;
pub mod workqueue;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(test)]
mod proptests;

pub use config::{ConfigHeader, ExtConfigHeader, HbaConfig, PageAccess, PageHeader};
pub use controller::{Controller, HostBus, InterruptLine, NullBus};
pub use devices::{Device, DeviceFlags};
pub use dispatch::SubmitMode;
pub use dma::{DmaAllocator, DmaRegion, HostDma};
pub use pool::{Command, CommandPool, SlotState};
pub use raid::{DiskInfo, DiskStatus, Inquiry, VolumeInfo, VolumeStatus};
pub use regs::{IocState, MmioRegion, RegisterBlock};
pub use reply::Reply;
pub use scsi::{DataSegment, Direction, Target, Transfer, TransferResult, XferError};

use core::fmt;

// =============================================================================
// Errors
// =============================================================================

/// S-HBA errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbaError {
    /// DMA allocation failed
    NoMemory,
    /// Zero or unusable allocation size
    InvalidSize,
    /// A bounded wait expired
    Timeout,
    /// Doorbell already in use when a handshake started
    DoorbellInUse,
    /// IOC never reached the ready state
    BringUp,
    /// Diagnostic register could not be unlocked for a hard reset
    DiagnosticLocked,
    /// Negotiated reply post queue is shallower than 16 entries
    RingTooShallow,
    /// IOC returned a failure status for an administrative message
    IocStatus(u16),
    /// No command slot available for an administrative command
    NoCommandSlot,
    /// Administrative command completed without a reply frame
    NoReply,
    /// Caller buffer is shorter than the page length
    PageTooSmall,
    /// Caller buffer does not fit in the request frame scratch area
    PageTooLarge,
    /// IOC rejected a config page request
    BadStatus(u16),
    /// No such volume or disk
    NoDevice,
    /// IOC accepted a RAID action but did not apply it
    NotApplied,
    /// Controller was detached while the caller waited
    Detached,
}

impl fmt::Display for HbaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HbaError::NoMemory => write!(f, "DMA allocation failed"),
            HbaError::InvalidSize => write!(f, "Invalid allocation size"),
            HbaError::Timeout => write!(f, "Timed out"),
            HbaError::DoorbellInUse => write!(f, "Doorbell in use"),
            HbaError::BringUp => write!(f, "IOC did not become ready"),
            HbaError::DiagnosticLocked => write!(f, "Unable to enable diagnostic writes"),
            HbaError::RingTooShallow => write!(f, "Reply post queue is too shallow"),
            HbaError::IocStatus(s) => write!(f, "IOC status {:#06x}", s),
            HbaError::NoCommandSlot => write!(f, "No command slot available"),
            HbaError::NoReply => write!(f, "Empty reply"),
            HbaError::PageTooSmall => write!(f, "Buffer smaller than config page"),
            HbaError::PageTooLarge => write!(f, "Buffer larger than request frame"),
            HbaError::BadStatus(s) => write!(f, "Config request failed with status {:#06x}", s),
            HbaError::NoDevice => write!(f, "No such device"),
            HbaError::NotApplied => write!(f, "Change not applied by IOC"),
            HbaError::Detached => write!(f, "Controller detached"),
        }
    }
}

impl std::error::Error for HbaError {}

/// Result alias used throughout the crate
pub type HbaResult<T> = Result<T, HbaError>;
