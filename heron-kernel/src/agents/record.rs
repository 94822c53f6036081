//! Record-formatting agent.
//!
//! Turns a raw measurement `(sequence, tick, value, flags)` into the fixed
//! 24-byte on-store log record, checksum included. Stateless: every answer
//! is computed from the job record alone, so any number of tasks can use it
//! as a subroutine.

use zerocopy::IntoBytes;

use heron_abi::frame::LogRecord;
use heron_abi::{JobId, Message, Opcode, Payload, RECORD_LEN, Status};

use crate::job::JobBody;
use crate::task::{Context, Task};

/// A record-formatting job.
#[derive(Debug, Clone)]
pub struct RecordJob {
    pub seq: u16,
    pub tick: u32,
    pub value: i32,
    pub flags: u8,
    /// The formatted record, filled on completion.
    pub record: [u8; RECORD_LEN],
    pub status: Status,
}

impl RecordJob {
    pub fn new(seq: u16, tick: u32, value: i32, flags: u8) -> RecordJob {
        RecordJob {
            seq,
            tick,
            value,
            flags,
            record: [0; RECORD_LEN],
            status: Status::Ok,
        }
    }
}

/// The record-formatting agent task.
pub struct RecordAgent;

impl RecordAgent {
    pub fn new() -> RecordAgent {
        RecordAgent
    }

    fn run_job(&self, ctx: &mut Context<'_>, id: JobId) {
        let status = match ctx.jobs.body_mut(id) {
            Some(JobBody::Record(job)) => {
                let record = LogRecord::new(job.seq, job.tick, job.value, job.flags);
                job.record.copy_from_slice(record.as_bytes());
                job.status = Status::Ok;
                Status::Ok
            }
            _ => Status::Inval,
        };
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
    }
}

impl Default for RecordAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for RecordAgent {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.run_job(ctx, id);
                Status::Ok
            }
            Opcode::Init => Status::Ok,
            _ => Status::NoSys,
        }
    }
}
