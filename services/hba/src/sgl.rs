//! # Scatter/Gather Lists
//!
//! Data buffers of a SCSI I/O are described by scatter/gather elements placed
//! right after the 96-byte request. Two encodings exist and one is chosen at
//! attach:
//!
//! - **Legacy** (MPI 2.0): 12 bytes, flags in the top byte of the first dword
//!   and the length below them, then a 64-bit address
//! - **IEEE** (MPI 2.5/2.6): 16 bytes, 64-bit address, 32-bit length, flags in
//!   the last byte
//!
//! When a list is longer than the IOC reads in one go, a chain element at
//! index `chain_sge` points at the elements that follow it in the same frame.

use bitflags::bitflags;

use crate::mpi::{get_u32, get_u64, put_u32, put_u64, SCSI_IO_CHAIN_OFFSET, SCSI_IO_SIZE};
use crate::pool::Command;
use crate::scsi::DataSegment;
use crate::{HbaError, HbaResult};

bitflags! {
    /// Legacy element flags (top byte of the flags/length dword)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SgeFlags: u8 {
        const LAST = 0x80;
        const END_OF_BUFFER = 0x40;
        const SIMPLE = 0x10;
        const CHAIN = 0x30;
        const DIR_OUT = 0x04;
        const SIZE_64 = 0x02;
        const END_OF_LIST = 0x01;
    }
}

bitflags! {
    /// IEEE element flags (byte 15)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IeeeSgeFlags: u8 {
        const CHAIN = 0x80;
        const END_OF_LIST = 0x40;
    }
}

/// Legacy element type field
pub const SGE_TYPE_MASK: u8 = 0x30;

/// Legacy element length field
pub const SGE_LENGTH_MASK: u32 = 0x00FF_FFFF;

/// Packs a legacy flags/length dword
pub fn legacy_header(flags: SgeFlags, len: u32) -> u32 {
    (flags.bits() as u32) << 24 | (len & SGE_LENGTH_MASK)
}

/// Element encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SgeFormat {
    Legacy,
    Ieee,
}

impl SgeFormat {
    /// Element size in bytes
    pub const fn size(self) -> usize {
        match self {
            SgeFormat::Legacy => 12,
            SgeFormat::Ieee => 16,
        }
    }
}

/// Element as seen by a reader of the list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub addr: u64,
    pub len: u32,
    pub chain: bool,
    pub end_of_list: bool,
}

/// Encoding plus the limits negotiated at attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglLayout {
    pub format: SgeFormat,
    /// Index at which the chain element goes
    pub chain_sge: usize,
    /// Most data segments one request can carry
    pub max_sgl: usize,
}

impl SglLayout {
    /// Derives the limits from the IOC request frame size and the host frame
    /// size, both in bytes
    pub fn new(format: SgeFormat, ioc_request_size: usize, request_size: usize) -> Self {
        let sge = format.size();
        Self {
            format,
            chain_sge: (ioc_request_size.saturating_sub(SCSI_IO_SIZE) / sge).saturating_sub(1),
            max_sgl: (request_size.saturating_sub(SCSI_IO_SIZE + 32) / sge).saturating_sub(1),
        }
    }

    fn encode(&self, addr: u64, len: u32, chain: bool, last: bool, write: bool) -> Vec<u8> {
        match self.format {
            SgeFormat::Legacy => {
                let mut flags = if chain {
                    SgeFlags::CHAIN | SgeFlags::SIZE_64
                } else {
                    SgeFlags::SIMPLE | SgeFlags::SIZE_64
                };
                if write && !chain {
                    flags |= SgeFlags::DIR_OUT;
                }
                if last {
                    flags |= SgeFlags::LAST | SgeFlags::END_OF_BUFFER | SgeFlags::END_OF_LIST;
                }
                let mut el = vec![0u8; 12];
                put_u32(&mut el, 0, legacy_header(flags, len));
                put_u64(&mut el, 4, addr);
                el
            }
            SgeFormat::Ieee => {
                let mut flags = IeeeSgeFlags::empty();
                if chain {
                    flags |= IeeeSgeFlags::CHAIN;
                }
                if last {
                    flags |= IeeeSgeFlags::END_OF_LIST;
                }
                let mut el = vec![0u8; 16];
                put_u64(&mut el, 0, addr);
                put_u32(&mut el, 8, len);
                el[15] = flags.bits();
                el
            }
        }
    }

    /// Decodes one element
    pub fn decode(&self, el: &[u8]) -> Element {
        match self.format {
            SgeFormat::Legacy => {
                let header = get_u32(el, 0);
                let flags = SgeFlags::from_bits_truncate((header >> 24) as u8);
                Element {
                    addr: get_u64(el, 4),
                    len: header & SGE_LENGTH_MASK,
                    chain: flags.bits() & SGE_TYPE_MASK == SgeFlags::CHAIN.bits(),
                    end_of_list: flags.contains(SgeFlags::END_OF_LIST),
                }
            }
            SgeFormat::Ieee => {
                let flags = IeeeSgeFlags::from_bits_truncate(el[15]);
                Element {
                    addr: get_u64(el, 0),
                    len: get_u32(el, 8),
                    chain: flags.contains(IeeeSgeFlags::CHAIN),
                    end_of_list: flags.contains(IeeeSgeFlags::END_OF_LIST),
                }
            }
        }
    }

    /// Writes the list for `segments` into the frame of `cmd`
    pub fn load(&self, cmd: &mut Command, segments: &[DataSegment], write: bool) -> HbaResult<()> {
        let sge = self.format.size();

        if segments.is_empty() {
            let el = self.encode(0, 0, false, true, false);
            cmd.write_frame(SCSI_IO_SIZE, &el);
            return Ok(());
        }

        if segments.len() > self.max_sgl {
            log::warn!(
                "hba: {} segments exceed the {} element limit",
                segments.len(),
                self.max_sgl
            );
            return Err(HbaError::InvalidSize);
        }

        let mut index = 0;
        for (i, seg) in segments.iter().enumerate() {
            if index == self.chain_sge {
                let offset = SCSI_IO_SIZE + index * sge;
                cmd.write_frame(SCSI_IO_CHAIN_OFFSET, &[(offset / 4) as u8]);
                let remaining = ((segments.len() - i) * sge) as u32;
                let next = cmd.frame_addr() + (offset + sge) as u64;
                cmd.write_frame(offset, &self.encode(next, remaining, true, false, false));
                index += 1;
            }

            let last = i + 1 == segments.len();
            let el = self.encode(seg.addr, seg.len, false, last, write);
            cmd.write_frame(SCSI_IO_SIZE + index * sge, &el);
            index += 1;
        }
        Ok(())
    }
}
