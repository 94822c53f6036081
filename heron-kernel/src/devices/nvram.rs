//! NVRAM driver task.
//!
//! Per-node non-volatile storage: a small calibration long and the
//! bootloader-enable switch read at boot. The part answers within the
//! addressing transaction, so jobs complete inside the handler with no
//! interrupt phase — the smallest possible driver.

use alloc::sync::Arc;

use spinning_top::Spinlock;

use heron_abi::{JobId, Message, Opcode, Payload, Status};

use crate::job::JobBody;
use crate::task::{Context, Task};

/// Job operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvramOp {
    ReadCalibration,
    WriteCalibration,
    ReadBootSwitch,
}

/// An NVRAM job record.
#[derive(Debug, Clone)]
pub struct NvramJob {
    pub op: NvramOp,
    pub value: u32,
    pub status: Status,
}

impl NvramJob {
    pub fn read_calibration() -> NvramJob {
        NvramJob {
            op: NvramOp::ReadCalibration,
            value: 0,
            status: Status::Ok,
        }
    }

    pub fn write_calibration(value: u32) -> NvramJob {
        NvramJob {
            op: NvramOp::WriteCalibration,
            value,
            status: Status::Ok,
        }
    }

    pub fn read_boot_switch() -> NvramJob {
        NvramJob {
            op: NvramOp::ReadBootSwitch,
            value: 0,
            status: Status::Ok,
        }
    }
}

/// Simulated NVRAM contents.
pub struct NvramHw {
    calibration: u32,
    boot_switch: u8,
}

impl NvramHw {
    pub fn new() -> Arc<Spinlock<NvramHw>> {
        Arc::new(Spinlock::new(NvramHw {
            calibration: 0,
            boot_switch: 0,
        }))
    }
}

/// Test/bench handle: preload the persisted contents.
pub fn preload(hw: &Arc<Spinlock<NvramHw>>, calibration: u32, boot_switch: u8) {
    let mut hw = hw.lock();
    hw.calibration = calibration;
    hw.boot_switch = boot_switch;
}

/// The NVRAM driver task.
pub struct NvramTask {
    hw: Arc<Spinlock<NvramHw>>,
}

impl NvramTask {
    pub fn new(hw: Arc<Spinlock<NvramHw>>) -> NvramTask {
        NvramTask { hw }
    }

    fn run_job(&mut self, ctx: &mut Context<'_>, id: JobId) {
        let mut hw = self.hw.lock();
        let status = match ctx.jobs.body_mut(id) {
            Some(JobBody::Nvram(job)) => {
                match job.op {
                    NvramOp::ReadCalibration => job.value = hw.calibration,
                    NvramOp::WriteCalibration => hw.calibration = job.value,
                    NvramOp::ReadBootSwitch => job.value = hw.boot_switch as u32,
                }
                job.status = Status::Ok;
                Status::Ok
            }
            _ => Status::Inval,
        };
        drop(hw);
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
    }
}

impl Task for NvramTask {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.run_job(ctx, id);
                Status::Ok
            }
            Opcode::Cancel => {
                // Jobs complete within the handler; nothing is ever pending.
                ctx.reply_result(msg.sender, Status::Inval);
                Status::Ok
            }
            Opcode::Init => Status::Ok,
            _ => Status::NoSys,
        }
    }
}
