//! # SCSI Transfers
//!
//! The upper-layer view of an I/O: a [`Transfer`] goes in, a
//! [`TransferResult`] comes out. This module builds the SCSI I/O request frame
//! for a transfer and decodes a completed command into a result.
//!
//! A completion without a reply frame is a plain success. With a reply frame
//! the SCSI status is mapped first and the IOC status then decides the error
//! class.

use std::time::Duration;

use crate::mpi::{
    ScsiIoErrorReply, ScsiIoRequest, IOCSTATUS_BUSY, IOCSTATUS_INSUFFICIENT_RESOURCES,
    IOCSTATUS_MASK, IOCSTATUS_SCSI_DATA_UNDERRUN, IOCSTATUS_SCSI_DEVICE_NOT_THERE,
    IOCSTATUS_SCSI_INVALID_DEVHANDLE, IOCSTATUS_SCSI_IOC_TERMINATED,
    IOCSTATUS_SCSI_RECOVERED_ERROR, IOCSTATUS_SCSI_TASK_TERMINATED, IOCSTATUS_SUCCESS,
    SCSI_IO_CONTROL_READ, SCSI_IO_CONTROL_SIMPLEQ, SCSI_IO_CONTROL_WRITE, SCSI_STATE_AUTOSENSE_VALID,
    SCSI_STATUS_ACA_ACTIVE, SCSI_STATUS_BUSY, SCSI_STATUS_CHECK_COND, SCSI_STATUS_CMD_TERMINATED,
    SCSI_STATUS_GOOD, SCSI_STATUS_INTERMEDIATE, SCSI_STATUS_INTERMEDIATE_CONDMET,
    SCSI_STATUS_RESERVATION_CONFLICT, SCSI_STATUS_TASK_ABORTED, SCSI_STATUS_TASK_SET_FULL,
};
use crate::pool::Command;

/// Sense buffer size; the buffer sits at the end of each request frame
pub const SENSE_LEN: usize = 32;

/// Longest CDB a request frame carries
pub const CDB_MAX: usize = 32;

/// Mapped SCSI status codes
pub mod status {
    pub const OK: u8 = 0x00;
    pub const CHECK: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const INTERM: u8 = 0x10;
    pub const RESV_CONFLICT: u8 = 0x18;
    pub const TERMINATED: u8 = 0x22;
    pub const QUEUE_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const UNKNOWN: u8 = 0xFF;
}

/// Data direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    None,
    /// Device to host
    Read,
    /// Host to device
    Write,
}

/// Addressed logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Target {
    /// Slot number in the device table
    pub target: u16,
    pub lun: u16,
}

/// One physically contiguous piece of the data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub addr: u64,
    pub len: u32,
}

/// A SCSI command from the upper layer
#[derive(Debug, Clone, Default)]
pub struct Transfer {
    pub target: Target,
    pub direction: Direction,
    pub cdb: Vec<u8>,
    /// Total data length in bytes
    pub data_len: u32,
    pub segments: Vec<DataSegment>,
    /// Deadline before the target is reset; `None` waits forever
    pub timeout: Option<Duration>,
    /// Complete by polling instead of waiting for the interrupt
    pub poll: bool,
}

impl Transfer {
    /// Builds the request frame header for this transfer
    pub fn request(&self, dev_handle: u16, sense_addr: u32) -> ScsiIoRequest {
        let direction = match self.direction {
            Direction::Read => SCSI_IO_CONTROL_READ,
            Direction::Write => SCSI_IO_CONTROL_WRITE,
            Direction::None => 0,
        };
        let mut cdb = [0u8; CDB_MAX];
        let n = self.cdb.len().min(CDB_MAX);
        cdb[..n].copy_from_slice(&self.cdb[..n]);

        ScsiIoRequest {
            dev_handle,
            sense_address_low: sense_addr,
            sense_length: SENSE_LEN as u8,
            data_length: self.data_len,
            cdb_length: n as u16,
            lun: self.target.lun,
            control: direction | SCSI_IO_CONTROL_SIMPLEQ,
            cdb,
        }
    }
}

/// Error class of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferError {
    NoError,
    /// Sense data is valid
    Sense,
    Busy,
    ReservationConflict,
    /// Terminated after its deadline passed
    Timeout,
    /// Terminated by a reset
    Reset,
    /// No such target
    SelectionTimeout,
    /// No command slot
    ResourceShortage,
    DriverStuffup,
}

/// Outcome handed to the upper layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResult {
    pub error: XferError,
    /// Mapped SCSI status
    pub status: u8,
    /// Bytes not transferred
    pub residual: u32,
    pub sense: Option<[u8; SENSE_LEN]>,
}

impl TransferResult {
    /// Result of a transfer that never reached the device
    pub fn immediate(error: XferError) -> Self {
        Self {
            error,
            status: status::OK,
            residual: 0,
            sense: None,
        }
    }

    /// CDB longer than a request frame can hold
    pub fn cdb_too_long() -> Self {
        let mut sense = [0u8; SENSE_LEN];
        // valid, current error
        sense[0] = 0xF0;
        // illegal request
        sense[2] = 0x05;
        sense[7] = 10;
        // invalid command operation code
        sense[12] = 0x20;
        Self {
            sense: Some(sense),
            ..Self::immediate(XferError::Sense)
        }
    }

    /// Decodes a completed SCSI I/O command
    pub fn from_completion(cmd: &Command, data_len: u32) -> Self {
        let Some(reply) = cmd.reply() else {
            return Self::immediate(XferError::NoError);
        };
        let sie = ScsiIoErrorReply::decode(&reply.bytes());

        let mut result = Self {
            error: XferError::NoError,
            status: map_scsi_status(sie.scsi_status),
            residual: 0,
            sense: None,
        };

        result.error = match sie.header.ioc_status & IOCSTATUS_MASK {
            IOCSTATUS_SCSI_DATA_UNDERRUN => match sie.scsi_status {
                SCSI_STATUS_CHECK_COND => {
                    result.residual = data_len.saturating_sub(sie.transfer_count);
                    XferError::Sense
                }
                SCSI_STATUS_GOOD => {
                    result.residual = data_len.saturating_sub(sie.transfer_count);
                    XferError::NoError
                }
                _ => XferError::DriverStuffup,
            },
            IOCSTATUS_SUCCESS | IOCSTATUS_SCSI_RECOVERED_ERROR => match sie.scsi_status {
                SCSI_STATUS_GOOD => XferError::NoError,
                SCSI_STATUS_CHECK_COND => XferError::Sense,
                SCSI_STATUS_BUSY | SCSI_STATUS_TASK_SET_FULL => XferError::Busy,
                SCSI_STATUS_RESERVATION_CONFLICT => XferError::ReservationConflict,
                _ => XferError::DriverStuffup,
            },
            IOCSTATUS_BUSY | IOCSTATUS_INSUFFICIENT_RESOURCES => XferError::Busy,
            IOCSTATUS_SCSI_IOC_TERMINATED | IOCSTATUS_SCSI_TASK_TERMINATED => {
                if cmd.timed_out() {
                    XferError::Timeout
                } else {
                    XferError::Reset
                }
            }
            IOCSTATUS_SCSI_INVALID_DEVHANDLE | IOCSTATUS_SCSI_DEVICE_NOT_THERE => {
                XferError::SelectionTimeout
            }
            _ => XferError::DriverStuffup,
        };

        if sie.scsi_state & SCSI_STATE_AUTOSENSE_VALID != 0 {
            let mut sense = [0u8; SENSE_LEN];
            cmd.read_frame(cmd.frame_size() - SENSE_LEN, &mut sense);
            result.sense = Some(sense);
        }

        log::trace!(
            "hba: smid {} ioc status {:#06x} scsi status {:#04x} -> {:?}",
            cmd.smid(),
            sie.header.ioc_status,
            sie.scsi_status,
            result.error
        );
        result
    }
}

/// Maps the status byte of an error reply to the host's status codes
pub fn map_scsi_status(device_status: u8) -> u8 {
    match device_status {
        SCSI_STATUS_GOOD => status::OK,
        SCSI_STATUS_CHECK_COND => status::CHECK,
        SCSI_STATUS_BUSY => status::BUSY,
        SCSI_STATUS_INTERMEDIATE | SCSI_STATUS_INTERMEDIATE_CONDMET => status::INTERM,
        SCSI_STATUS_RESERVATION_CONFLICT => status::RESV_CONFLICT,
        SCSI_STATUS_CMD_TERMINATED | SCSI_STATUS_TASK_ABORTED => status::TERMINATED,
        SCSI_STATUS_TASK_SET_FULL => status::QUEUE_FULL,
        SCSI_STATUS_ACA_ACTIVE => status::ACA_ACTIVE,
        _ => status::UNKNOWN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::HostDma;
    use crate::mpi::{ReplyHeader, Request, IOCSTATUS_CONFIG_INVALID_PAGE};
    use crate::pool::CommandPool;
    use crate::regs::RegisterBlock;
    use crate::reply::ReplyPool;
    use crate::ring::Rings;
    use std::sync::Arc;

    struct NoRegs;

    impl RegisterBlock for NoRegs {
        fn read(&self, _offset: u32) -> u32 {
            0
        }
        fn write(&self, _offset: u32, _value: u32) {}
    }

    struct Fixture {
        dma: HostDma,
        pool: Arc<CommandPool>,
        replies: Arc<ReplyPool>,
    }

    impl Fixture {
        fn new() -> Self {
            let dma = HostDma::new();
            let rings = Arc::new(Rings::new(Arc::new(NoRegs), &dma, 16, 16).unwrap());
            let replies = ReplyPool::new(&dma, rings, 4, 128).unwrap();
            let pool = CommandPool::new(&dma, 4, 512).unwrap();
            Self { dma, pool, replies }
        }

        fn complete(&self, sie: ScsiIoErrorReply, timed_out: bool) -> Command {
            let addr = self.replies.base_addr() as u32;
            let mut frame = vec![0u8; 128];
            sie.encode(&mut frame);
            self.dma.write_at(addr as u64, &frame).unwrap();
            let mut cmd = self.pool.acquire().unwrap();
            cmd.complete(self.replies.lookup(addr), timed_out);
            cmd
        }
    }

    fn sie(ioc_status: u16, scsi_status: u8) -> ScsiIoErrorReply {
        ScsiIoErrorReply {
            header: ReplyHeader {
                ioc_status,
                ..Default::default()
            },
            scsi_status,
            transfer_count: 1024,
            ..Default::default()
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_scsi_status(SCSI_STATUS_GOOD), 0x00);
        assert_eq!(map_scsi_status(SCSI_STATUS_INTERMEDIATE_CONDMET), 0x10);
        assert_eq!(map_scsi_status(SCSI_STATUS_TASK_ABORTED), 0x22);
        assert_eq!(map_scsi_status(SCSI_STATUS_TASK_SET_FULL), 0x28);
        assert_eq!(map_scsi_status(SCSI_STATUS_ACA_ACTIVE), 0x30);
        assert_eq!(map_scsi_status(0x77), 0xFF);
    }

    #[test]
    fn test_no_reply_is_success() {
        let fx = Fixture::new();
        let cmd = fx.pool.acquire().unwrap();
        let result = TransferResult::from_completion(&cmd, 4096);
        assert_eq!(result, TransferResult::immediate(XferError::NoError));
    }

    #[test]
    fn test_underrun() {
        let fx = Fixture::new();
        let cmd = fx.complete(sie(IOCSTATUS_SCSI_DATA_UNDERRUN, SCSI_STATUS_GOOD), false);
        let result = TransferResult::from_completion(&cmd, 4096);
        assert_eq!(result.error, XferError::NoError);
        assert_eq!(result.residual, 3072);
        drop(cmd);

        let cmd = fx.complete(sie(IOCSTATUS_SCSI_DATA_UNDERRUN, SCSI_STATUS_CHECK_COND), false);
        let result = TransferResult::from_completion(&cmd, 4096);
        assert_eq!(result.error, XferError::Sense);
        assert_eq!(result.residual, 3072);
        drop(cmd);

        let cmd = fx.complete(sie(IOCSTATUS_SCSI_DATA_UNDERRUN, SCSI_STATUS_BUSY), false);
        assert_eq!(TransferResult::from_completion(&cmd, 4096).error, XferError::DriverStuffup);
    }

    #[test]
    fn test_error_classes() {
        let fx = Fixture::new();
        let cases = [
            (IOCSTATUS_SUCCESS, SCSI_STATUS_BUSY, XferError::Busy),
            (IOCSTATUS_SCSI_RECOVERED_ERROR, SCSI_STATUS_TASK_SET_FULL, XferError::Busy),
            (IOCSTATUS_SUCCESS, SCSI_STATUS_RESERVATION_CONFLICT, XferError::ReservationConflict),
            (IOCSTATUS_SUCCESS, SCSI_STATUS_ACA_ACTIVE, XferError::DriverStuffup),
            (IOCSTATUS_INSUFFICIENT_RESOURCES, SCSI_STATUS_GOOD, XferError::Busy),
            (IOCSTATUS_SCSI_DEVICE_NOT_THERE, SCSI_STATUS_GOOD, XferError::SelectionTimeout),
            (IOCSTATUS_SCSI_INVALID_DEVHANDLE | 0x8000, SCSI_STATUS_GOOD, XferError::SelectionTimeout),
            (IOCSTATUS_CONFIG_INVALID_PAGE, SCSI_STATUS_GOOD, XferError::DriverStuffup),
        ];
        for (ioc_status, scsi_status, expected) in cases {
            let cmd = fx.complete(sie(ioc_status, scsi_status), false);
            assert_eq!(
                TransferResult::from_completion(&cmd, 512).error,
                expected,
                "ioc status {:#x} scsi status {:#x}",
                ioc_status,
                scsi_status
            );
        }
    }

    #[test]
    fn test_terminated_depends_on_timeout() {
        let fx = Fixture::new();
        let cmd = fx.complete(sie(IOCSTATUS_SCSI_IOC_TERMINATED, SCSI_STATUS_GOOD), false);
        assert_eq!(TransferResult::from_completion(&cmd, 0).error, XferError::Reset);
        drop(cmd);
        let cmd = fx.complete(sie(IOCSTATUS_SCSI_TASK_TERMINATED, SCSI_STATUS_GOOD), true);
        assert_eq!(TransferResult::from_completion(&cmd, 0).error, XferError::Timeout);
    }

    #[test]
    fn test_autosense_read_from_frame_tail() {
        let fx = Fixture::new();
        let mut reply = sie(IOCSTATUS_SUCCESS, SCSI_STATUS_CHECK_COND);
        reply.scsi_state = SCSI_STATE_AUTOSENSE_VALID;
        let mut cmd = fx.complete(reply, false);
        let mut sense = [0u8; SENSE_LEN];
        sense[0] = 0x70;
        sense[2] = 0x06;
        cmd.write_frame(512 - SENSE_LEN, &sense);

        let result = TransferResult::from_completion(&cmd, 512);
        assert_eq!(result.error, XferError::Sense);
        assert_eq!(result.status, status::CHECK);
        assert_eq!(result.sense, Some(sense));
    }

    #[test]
    fn test_request_layout() {
        let xfer = Transfer {
            target: Target { target: 3, lun: 2 },
            direction: Direction::Write,
            cdb: vec![0x2A, 0, 0, 0, 0x10, 0, 0, 0, 8, 0],
            data_len: 4096,
            ..Default::default()
        };
        let req = xfer.request(0x0011, 0x1234_5000);
        let frame = req.to_bytes();
        let back = ScsiIoRequest::decode(&frame);
        assert_eq!(back.dev_handle, 0x0011);
        assert_eq!(back.cdb_length, 10);
        assert_eq!(back.control, SCSI_IO_CONTROL_WRITE);
        assert_eq!(back.sense_length, 32);
        assert_eq!(&frame[52..54], &[0, 2]);
        assert_eq!(back.cdb[0], 0x2A);
    }

    #[test]
    fn test_cdb_too_long_sense() {
        let result = TransferResult::cdb_too_long();
        assert_eq!(result.error, XferError::Sense);
        let sense = result.sense.unwrap();
        assert_eq!(sense[2] & 0x0F, 0x05);
        assert_eq!(sense[12], 0x20);
    }
}
