//! # Doorbell
//!
//! The doorbell register carries the IOC state and a 16-bit wide mailbox used
//! before the rings exist. This module owns:
//!
//! - bounded register polling
//! - the bring-up state machine with soft and hard resets
//! - the doorbell handshake that carries IOC facts and IOC init

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::HbaConfig;
use crate::mpi::Request;
use crate::regs::{
    doorbell_dwords, doorbell_function, HostDiag, IntrStatus, IocState, RegisterBlock,
    DOORBELL_DATA_MASK, DOORBELL_INUSE, DOORBELL_STATE, DOORBELL_STATE_READY,
    DOORBELL_STATE_RESET, DOORBELL_WHOINIT, DOORBELL_WHOINIT_PCIPEER, REG_DOORBELL, REG_HOSTDIAG,
    REG_INTR_STATUS, REG_WRITESEQ, WRITESEQ_KEYS, WRITESEQ_LOCK,
};
use crate::mpi::{FUNCTION_HANDSHAKE, FUNCTION_IOC_MESSAGE_UNIT_RESET};
use crate::{HbaError, HbaResult};

/// Settling time between the unlock sequence and the diagnostic check
const WRITESEQ_SETTLE: Duration = Duration::from_micros(100);

/// Doorbell and reset control of one IOC
pub struct Doorbell {
    regs: Arc<dyn RegisterBlock>,
    name: String,
    poll_iterations: u32,
    poll_interval: Duration,
    hard_reset_settle: Duration,
    hard_reset_polls: u32,
    bring_up_attempts: u32,
}

impl Doorbell {
    pub fn new(regs: Arc<dyn RegisterBlock>, config: &HbaConfig) -> Self {
        Self {
            regs,
            name: config.name.clone(),
            poll_iterations: config.poll_iterations,
            poll_interval: config.poll_interval,
            hard_reset_settle: config.hard_reset_settle,
            hard_reset_polls: config.hard_reset_polls,
            bring_up_attempts: config.bring_up_attempts,
        }
    }

    /// Raw doorbell value
    pub fn read(&self) -> u32 {
        self.regs.read(REG_DOORBELL)
    }

    fn write(&self, value: u32) {
        self.regs.write(REG_DOORBELL, value);
        self.regs.barrier();
    }

    /// Current IOC state
    pub fn state(&self) -> IocState {
        IocState::from_doorbell(self.read())
    }

    fn clear_intr(&self) {
        self.regs.write(REG_INTR_STATUS, 0);
        self.regs.barrier();
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Polls `reg` until `(value & mask) == target`
    pub fn wait_eq(&self, reg: u32, mask: u32, target: u32) -> HbaResult<()> {
        log::trace!("{}: wait_eq {:#x} {:#x} {:#x}", self.name, reg, mask, target);
        for _ in 0..self.poll_iterations {
            if self.regs.read(reg) & mask == target {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
        Err(HbaError::Timeout)
    }

    /// Polls `reg` until `(value & mask) != target`
    pub fn wait_ne(&self, reg: u32, mask: u32, target: u32) -> HbaResult<()> {
        log::trace!("{}: wait_ne {:#x} {:#x} {:#x}", self.name, reg, mask, target);
        for _ in 0..self.poll_iterations {
            if self.regs.read(reg) & mask != target {
                return Ok(());
            }
            thread::sleep(self.poll_interval);
        }
        Err(HbaError::Timeout)
    }

    fn wait_db_int(&self) -> HbaResult<()> {
        self.wait_ne(REG_INTR_STATUS, IntrStatus::IOC2SYSDB.bits(), 0)
    }

    fn wait_db_ack(&self) -> HbaResult<()> {
        self.wait_eq(
            REG_INTR_STATUS,
            (IntrStatus::IOC2SYSDB | IntrStatus::SYS2IOCDB).bits(),
            0,
        )
    }

    // =========================================================================
    // Bring-up
    // =========================================================================

    /// Drives the IOC to the ready state.
    ///
    /// `event_replay` selects a message unit reset over a hard reset for an
    /// IOC that is already operational.
    pub fn bring_up(&self, event_replay: bool) -> HbaResult<()> {
        self.wait_ne(REG_DOORBELL, DOORBELL_STATE, DOORBELL_STATE_RESET)
            .inspect_err(|_| log::warn!("{}: timeout waiting to leave reset state", self.name))?;

        let mut db = self.read();
        if db & DOORBELL_WHOINIT == DOORBELL_WHOINIT_PCIPEER {
            log::debug!("{}: initialised by pci peer", self.name);
            return Ok(());
        }

        for _ in 0..self.bring_up_attempts {
            match IocState::from_doorbell(db) {
                IocState::Ready => {
                    log::debug!("{}: ioc is ready", self.name);
                    return Ok(());
                }
                IocState::Operational => {
                    log::debug!("{}: ioc is operational, resetting", self.name);
                    let result = if event_replay {
                        self.soft_reset()
                    } else {
                        self.hard_reset()
                    };
                    if let Err(e) = result {
                        log::warn!("{}: reset of operational ioc failed: {}", self.name, e);
                    }
                }
                IocState::Fault | IocState::Unknown => {
                    log::debug!("{}: ioc faulted, hard reset", self.name);
                    if let Err(e) = self.hard_reset() {
                        log::warn!("{}: hard reset failed: {}", self.name, e);
                    }
                }
                IocState::Reset => {
                    self.wait_ne(REG_DOORBELL, DOORBELL_STATE, DOORBELL_STATE_RESET)?;
                }
            }
            db = self.read();
        }

        Err(HbaError::BringUp)
    }

    /// Message unit reset
    pub fn soft_reset(&self) -> HbaResult<()> {
        if self.read() & DOORBELL_INUSE != 0 {
            return Err(HbaError::DoorbellInUse);
        }

        self.write(doorbell_function(FUNCTION_IOC_MESSAGE_UNIT_RESET));
        self.wait_db_ack()?;
        self.wait_eq(REG_DOORBELL, DOORBELL_STATE, DOORBELL_STATE_READY)
    }

    /// Adapter reset through the diagnostic register
    pub fn hard_reset(&self) -> HbaResult<()> {
        self.clear_intr();

        for key in WRITESEQ_KEYS {
            self.regs.write(REG_WRITESEQ, key);
        }
        self.regs.barrier();
        thread::sleep(WRITESEQ_SETTLE);

        if !HostDiag::from_bits_truncate(self.regs.read(REG_HOSTDIAG)).contains(HostDiag::DWRE) {
            return Err(HbaError::DiagnosticLocked);
        }

        self.regs.write(REG_HOSTDIAG, HostDiag::RESET_ADAPTER.bits());
        self.regs.barrier();
        thread::sleep(self.hard_reset_settle);

        for _ in 0..self.hard_reset_polls {
            let diag = HostDiag::from_bits_truncate(self.regs.read(REG_HOSTDIAG));
            if !diag.contains(HostDiag::RESET_ADAPTER) {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        self.regs.write(REG_WRITESEQ, WRITESEQ_LOCK);
        self.regs.barrier();
        log::debug!("{}: hard reset done", self.name);
        Ok(())
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Pushes a request through the doorbell, one dword at a time
    pub fn handshake_send(&self, dwords: &[u32]) -> HbaResult<()> {
        if self.read() & DOORBELL_INUSE != 0 {
            return Err(HbaError::DoorbellInUse);
        }

        if IntrStatus::from_bits_truncate(self.regs.read(REG_INTR_STATUS)).contains(IntrStatus::IOC2SYSDB) {
            self.clear_intr();
        }

        self.write(doorbell_function(FUNCTION_HANDSHAKE) | doorbell_dwords(dwords.len() as u8));

        self.wait_db_int()?;
        self.clear_intr();
        self.wait_db_ack()?;

        for dword in dwords {
            self.write(*dword);
            self.wait_db_ack()?;
        }
        Ok(())
    }

    fn recv_dword(&self) -> HbaResult<u32> {
        let mut dword = 0;
        for half in 0..2 {
            self.wait_db_int()?;
            dword |= (self.read() & DOORBELL_DATA_MASK) << (half * 16);
            self.clear_intr();
        }
        Ok(dword)
    }

    /// Reads a reply through the doorbell.
    ///
    /// Fills `buf` and returns the reply length in dwords. Dwords past the
    /// end of `buf` are read and discarded.
    pub fn handshake_recv(&self, buf: &mut [u32]) -> HbaResult<usize> {
        let first = self.recv_dword()?;
        if let Some(slot) = buf.first_mut() {
            *slot = first;
        }
        let msg_length = ((first >> 16) & 0xFF) as usize;

        for i in 1..msg_length {
            let dword = self.recv_dword()?;
            match buf.get_mut(i) {
                Some(slot) => *slot = dword,
                None => log::trace!("{}: discarded handshake dword {:#010x}", self.name, dword),
            }
        }

        self.wait_db_int()?;
        self.wait_eq(REG_DOORBELL, DOORBELL_INUSE, 0)?;
        self.clear_intr();
        Ok(msg_length)
    }

    /// Sends `request` and returns up to `reply_len` bytes of the reply
    pub fn request<R: Request>(&self, request: &R, reply_len: usize) -> HbaResult<Vec<u8>> {
        let dwords: Vec<u32> = request
            .to_bytes()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.handshake_send(&dwords)?;

        let mut reply = vec![0u32; reply_len.div_ceil(4)];
        self.handshake_recv(&mut reply)?;
        let mut bytes: Vec<u8> = reply.iter().flat_map(|d| d.to_le_bytes()).collect();
        bytes.truncate(reply_len);
        Ok(bytes)
    }
}
