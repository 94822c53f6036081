//! Ping secretary: the minimal bus service.
//!
//! Subscribes for `PING` frames and answers each with a `PONG` reply
//! carrying `EOK`, then re-subscribes. Useful as a liveness probe between
//! nodes and as the smallest worked example of the secretary shape.

use log::{debug, warn};

use heron_abi::frame::{FRAME_REPLY, OP_PING};
use heron_abi::{JobId, Message, Opcode, Payload, Status, TASK_BUS};

use crate::bus::BusJob;
use crate::job::JobBody;
use crate::task::{Context, Task};

/// The ping secretary task.
pub struct PingSecretary {
    /// Pending slave-receive subscription.
    sub: Option<JobId>,
    /// In-flight reply transmit.
    reply_out: Option<JobId>,
    /// Requests answered (diagnostics).
    served: u32,
}

impl PingSecretary {
    pub fn new() -> PingSecretary {
        PingSecretary {
            sub: None,
            reply_out: None,
            served: 0,
        }
    }

    pub fn served(&self) -> u32 {
        self.served
    }

    fn resubscribe(&mut self, ctx: &mut Context<'_>) {
        self.sub = ctx
            .submit(TASK_BUS, JobBody::Bus(BusJob::slave(OP_PING)))
            .ok();
    }
}

impl Default for PingSecretary {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for PingSecretary {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Init => {
                if self.sub.is_none() {
                    self.resubscribe(ctx);
                }
                Status::Ok
            }
            Opcode::ReplyInfo => {
                let Payload::Info { status, job } = msg.payload else {
                    return Status::Inval;
                };

                if self.sub == Some(job) {
                    self.sub = None;
                    let Some(JobBody::Bus(request)) = ctx.jobs.take(job) else {
                        return Status::Ok;
                    };
                    if !status.is_ok() {
                        // Cancelled subscription; stay down.
                        return Status::Ok;
                    }
                    debug!("ping from node {:#04x}", request.peer);
                    self.served += 1;

                    let pong = BusJob::transmit(
                        request.peer,
                        OP_PING | FRAME_REPLY,
                        ctx.own_id(),
                        &[Status::Ok.into()],
                    );
                    self.reply_out = ctx.submit(TASK_BUS, JobBody::Bus(pong)).ok();
                    self.resubscribe(ctx);
                } else if self.reply_out == Some(job) {
                    self.reply_out = None;
                    ctx.jobs.take(job);
                    if !status.is_ok() {
                        warn!("pong lost on the wire: {:?}", status);
                    }
                } else {
                    ctx.jobs.take(job);
                }
                Status::Ok
            }
            _ => Status::NoSys,
        }
    }
}
