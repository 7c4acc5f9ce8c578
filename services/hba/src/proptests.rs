use crate::dma::DmaAllocator;
use crate::config::IocPage1;
use crate::controller::tests::{wait_for, Harness};
use crate::dispatch::SubmitMode;
use crate::mpi::{EventReply, EVENT_SAS_DEVICE_STATUS_CHANGE};
use crate::scsi::{DataSegment, Direction, Target, Transfer, XferError};
use crate::sim::SimIoc;
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use std::sync::mpsc::channel;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Event { ack: bool, context: u32 },
    Read { volume: bool, blocks: u8, poll: bool },
    ReadPage1,
}

const MAX_OPS: usize = 16;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (any::<bool>(), any::<u32>()).prop_map(|(ack, context)| Op::Event { ack, context }),
        4 => (any::<bool>(), 1u8..=8, any::<bool>())
            .prop_map(|(volume, blocks, poll)| Op::Read { volume, blocks, poll }),
        1 => Just(Op::ReadPage1),
    ]
}

fn read(hx: &Harness, volume: bool, blocks: u8, poll: bool) -> TestCaseResult {
    let handle = if volume {
        hx.sim.volumes()[0]
    } else {
        *hx.sim.targets().last().expect("plain target")
    };
    let slot = hx.hba.devices().find(handle).expect("attached").slot;
    let len = blocks as u32 * 512;
    let buf = hx.sim.dma().allocate(len as usize).expect("buffer");

    let (tx, rx) = channel();
    hx.hba.scsi_request(
        Transfer {
            target: Target { target: slot, lun: 0 },
            direction: Direction::Read,
            cdb: vec![0x28, 0, 0, 0, 0, 0, 0, 0, blocks, 0],
            data_len: len,
            segments: vec![DataSegment {
                addr: buf.device_addr(),
                len,
            }],
            poll,
            ..Default::default()
        },
        move |r| {
            let _ = tx.send(r);
        },
    );
    let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
    prop_assert_eq!(result.error, XferError::NoError);
    prop_assert_eq!(result.residual, 0);

    let mut data = vec![0u8; len as usize];
    buf.read_bytes(0, &mut data);
    for (off, byte) in data.iter().enumerate() {
        prop_assert_eq!(*byte, SimIoc::pattern(handle, off));
    }
    Ok(())
}

fn run(ops: &[Op]) -> TestCaseResult {
    let hx = Harness::attach();
    let mut acked = Vec::new();

    for op in ops {
        match *op {
            Op::Event { ack, context } => {
                hx.sim.inject_event(EventReply {
                    event: EVENT_SAS_DEVICE_STATUS_CHANGE,
                    ack_required: ack as u8,
                    context,
                    ..Default::default()
                });
                if ack {
                    acked.push((EVENT_SAS_DEVICE_STATUS_CHANGE, context));
                }
            }
            Op::Read { volume, blocks, poll } => read(&hx, volume, blocks, poll)?,
            Op::ReadPage1 => {
                let page: IocPage1 = hx
                    .hba
                    .config_pages()
                    .read(0, SubmitMode::Wait)
                    .expect("ioc page 1");
                prop_assert_eq!(page, hx.sim.ioc_page1());
            }
        }
    }

    prop_assert!(wait_for(|| hx.sim.acks() == acked));
    prop_assert!(wait_for(|| hx.hba.outstanding() == 0));
    prop_assert!(wait_for(|| hx.sim.replies_outstanding() == 0));
    prop_assert_eq!(hx.sim.violations(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 12,
        .. ProptestConfig::default()
    })]

    #[test]
    fn proptest_mixed_traffic_returns_every_frame(
        ops in prop::collection::vec(op_strategy(), 1..MAX_OPS)
    ) {
        run(&ops)?;
    }
}
