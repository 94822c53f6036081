//! The bus secretary: driver task for the inter-node two-wire bus.
//!
//! The secretary multiplexes four transaction modes over the shared medium:
//! master-transmit, master-transmit-slave-receive (a request frame followed
//! by a reply frame addressed back to this node), master-receive from a
//! remote register window, and slave-receive subscriptions that hand
//! incoming frames to whichever local task asked for them.
//!
//! Master work goes through the standard driver job queue and runs in FIFO
//! submission order; every job gets exactly one `ReplyInfo`. Transient wire
//! errors (arbitration loss, address NAK) are retried a bounded number of
//! times with a short back-off between attempts; persistent failures
//! surface as `EBUSY` and `ENODEV`. Reply deadlines and back-off delays are
//! both clock alarms.
//!
//! Slave subscriptions are one-shot: a subscription is consumed when a
//! matching frame arrives and the subscriber must re-subscribe for the
//! next.

pub mod wire;

pub use wire::{Frame, Wire, WireError};

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use log::debug;
use spinning_top::Spinlock;

use heron_abi::frame::{FRAME_ANY, FRAME_REPLY};
use heron_abi::{
    BUS_REPLY_TIMEOUT_MS, BUS_RETRY_DELAY_MS, BUS_RETRY_LIMIT, IOCTL_BUS_TIMEOUT_MS, JobId,
    Message, Opcode, Payload, Status, TaskId,
};

use crate::job::{JobBody, JobList};
use crate::mailbox::Mailbox;
use crate::task::{Context, Task};

/// Bus transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    /// Send one request frame.
    MasterTransmit,
    /// Send a request frame, then await the matching reply frame.
    TransmitReceive,
    /// Pull bytes from a remote node's register window.
    MasterReceive,
    /// Wait for an incoming frame of a given opcode (one-shot).
    SlaveReceive,
}

/// A caller-owned bus operation record.
#[derive(Debug, Clone)]
pub struct BusJob {
    pub mode: BusMode,
    /// Destination node address (master modes).
    pub dest: u8,
    /// Frame opcode for transmit and slave modes; register number for
    /// master-receive. Slave subscriptions may use `FRAME_ANY`; the field
    /// is overwritten with the opcode actually received.
    pub op: u8,
    /// Remote task named in the request frame; overwritten with the frame's
    /// task field on slave receive.
    pub taskid: u8,
    /// Byte count for master-receive.
    pub len: u8,
    /// Transmit payload.
    pub data: Vec<u8>,
    /// Received bytes: the reply frame payload, the slave frame payload, or
    /// the master-receive window contents.
    pub reply: Vec<u8>,
    /// Address of the remote node a received frame came from.
    pub peer: u8,
    pub status: Status,
}

impl BusJob {
    fn blank(mode: BusMode) -> BusJob {
        BusJob {
            mode,
            dest: 0,
            op: 0,
            taskid: 0,
            len: 0,
            data: Vec::new(),
            reply: Vec::new(),
            peer: 0,
            status: Status::Ok,
        }
    }

    /// A fire-and-forget master-transmit.
    pub fn transmit(dest: u8, op: u8, taskid: TaskId, payload: &[u8]) -> BusJob {
        BusJob {
            dest,
            op,
            taskid: taskid.0,
            data: payload.to_vec(),
            ..BusJob::blank(BusMode::MasterTransmit)
        }
    }

    /// A request expecting a reply frame (`op | FRAME_REPLY`) back.
    pub fn request(dest: u8, op: u8, taskid: TaskId, payload: &[u8]) -> BusJob {
        BusJob {
            dest,
            op,
            taskid: taskid.0,
            data: payload.to_vec(),
            ..BusJob::blank(BusMode::TransmitReceive)
        }
    }

    /// Pull `len` bytes from remote register `reg`.
    pub fn receive(dest: u8, reg: u8, len: u8) -> BusJob {
        BusJob {
            dest,
            op: reg,
            len,
            ..BusJob::blank(BusMode::MasterReceive)
        }
    }

    /// A one-shot slave-receive subscription for frames of opcode `op`
    /// (`FRAME_ANY` accepts any frame no specific subscriber claims).
    pub fn slave(op: u8) -> BusJob {
        BusJob {
            op,
            ..BusJob::blank(BusMode::SlaveReceive)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusState {
    Idle,
    /// Request sent; waiting for the reply frame or the deadline.
    AwaitReply,
    /// Transient error; waiting out the back-off delay.
    Backoff,
}

/// The bus secretary task.
pub struct BusSecretary {
    addr: u8,
    wire: Wire,
    rx: Arc<Spinlock<VecDeque<Frame>>>,
    registers: Arc<Spinlock<Vec<u8>>>,
    queue: JobList,
    current: Option<JobId>,
    state: BusState,
    retries: u8,
    /// Deadline guarding the in-flight attempt; alarms older than this are
    /// stale and ignored.
    deadline: u64,
    timeout_ms: u32,
    subs: BTreeMap<u8, JobId>,
    sub_any: Option<JobId>,
}

impl BusSecretary {
    /// Build the secretary and attach its port to the wire at `addr`.
    pub fn new(addr: u8, own: TaskId, wire: &Wire, mailbox: Arc<Mailbox>) -> BusSecretary {
        let rx = Arc::new(Spinlock::new(VecDeque::new()));
        let registers = Arc::new(Spinlock::new(vec![0u8; 16]));
        wire.attach(addr, mailbox, own, rx.clone(), registers.clone());
        BusSecretary {
            addr,
            wire: wire.clone(),
            rx,
            registers,
            queue: JobList::new(),
            current: None,
            state: BusState::Idle,
            retries: 0,
            deadline: 0,
            timeout_ms: BUS_REPLY_TIMEOUT_MS,
            subs: BTreeMap::new(),
            sub_any: None,
        }
    }

    /// This node's bus address.
    pub fn addr(&self) -> u8 {
        self.addr
    }

    /// The register window remote masters can read with master-receive.
    pub fn registers(&self) -> Arc<Spinlock<Vec<u8>>> {
        self.registers.clone()
    }

    fn start_next(&mut self, ctx: &mut Context<'_>) {
        if self.current.is_some() {
            return;
        }
        let Some(id) = self.queue.pop(ctx.jobs) else {
            return;
        };
        self.current = Some(id);
        self.retries = 0;
        self.attempt(ctx);
    }

    fn attempt(&mut self, ctx: &mut Context<'_>) {
        let Some(id) = self.current else {
            return;
        };
        let Some(JobBody::Bus(job)) = ctx.jobs.body(id) else {
            self.finish_current(ctx, Status::Inval);
            return;
        };

        let mode = job.mode;
        let dest = job.dest;
        let op = job.op;
        let len = job.len;

        let attempt = match mode {
            BusMode::MasterTransmit | BusMode::TransmitReceive => {
                let frame = Frame::new(op, self.addr, job.taskid, &job.data);
                self.wire.master_transmit(dest, &frame).map(|()| Vec::new())
            }
            BusMode::MasterReceive => {
                let mut buf = vec![0u8; len as usize];
                self.wire.master_receive(dest, op, &mut buf).map(|()| buf)
            }
            // Subscriptions never reach the master queue.
            BusMode::SlaveReceive => {
                self.finish_current(ctx, Status::Inval);
                return;
            }
        };

        match attempt {
            Ok(received) => match mode {
                BusMode::MasterTransmit => self.finish_current(ctx, Status::Ok),
                BusMode::TransmitReceive => {
                    self.state = BusState::AwaitReply;
                    self.deadline = ctx.now_ms() + self.timeout_ms as u64;
                    ctx.set_alarm(self.timeout_ms);
                }
                BusMode::MasterReceive => {
                    if let Some(JobBody::Bus(job)) = ctx.jobs.body_mut(id) {
                        job.reply = received;
                    }
                    self.finish_current(ctx, Status::Ok);
                }
                BusMode::SlaveReceive => unreachable!(),
            },
            Err(err) => self.fail_or_retry(ctx, err),
        }
    }

    fn fail_or_retry(&mut self, ctx: &mut Context<'_>, err: WireError) {
        match err {
            // Mid-transfer breakdown is not retried.
            WireError::Fault => self.finish_current(ctx, Status::Io),
            WireError::Nak | WireError::ArbitrationLost => {
                self.retries += 1;
                if self.retries >= BUS_RETRY_LIMIT {
                    let status = if err == WireError::Nak {
                        Status::NoDev
                    } else {
                        Status::Busy
                    };
                    self.finish_current(ctx, status);
                } else {
                    self.state = BusState::Backoff;
                    self.deadline = ctx.now_ms() + BUS_RETRY_DELAY_MS as u64;
                    ctx.set_alarm(BUS_RETRY_DELAY_MS);
                }
            }
        }
    }

    /// Complete the in-flight job with `status` and start the next one.
    fn finish_current(&mut self, ctx: &mut Context<'_>, status: Status) {
        let Some(id) = self.current.take() else {
            return;
        };
        self.state = BusState::Idle;
        self.retries = 0;
        if let Some(JobBody::Bus(job)) = ctx.jobs.body_mut(id) {
            job.status = status;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
        self.start_next(ctx);
    }

    fn drain_rx(&mut self, ctx: &mut Context<'_>) {
        loop {
            let frame = self.rx.lock().pop_front();
            let Some(frame) = frame else {
                break;
            };
            self.dispatch_frame(ctx, frame);
        }
    }

    fn dispatch_frame(&mut self, ctx: &mut Context<'_>, frame: Frame) {
        // Does this frame answer the in-flight request?
        if self.state == BusState::AwaitReply
            && let Some(id) = self.current
            && let Some(JobBody::Bus(job)) = ctx.jobs.body(id)
            && frame.header.is_reply()
            && frame.header.op == (job.op | FRAME_REPLY)
            && frame.header.sender == job.dest
        {
            if let Some(JobBody::Bus(job)) = ctx.jobs.body_mut(id) {
                job.reply = frame.payload;
                job.peer = frame.header.sender;
            }
            ctx.cancel_alarm();
            self.finish_current(ctx, Status::Ok);
            return;
        }

        // One-shot subscriptions: a specific subscriber wins over ANY.
        let claimed = self
            .subs
            .remove(&frame.header.op)
            .or_else(|| self.sub_any.take());
        let Some(id) = claimed else {
            debug!("unclaimed frame op {:#04x} from {:#04x}", frame.header.op, frame.header.sender);
            return;
        };

        if let Some(JobBody::Bus(job)) = ctx.jobs.body_mut(id) {
            job.op = frame.header.op;
            job.taskid = frame.header.taskid;
            job.peer = frame.header.sender;
            job.reply = frame.payload;
            job.status = Status::Ok;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, Status::Ok, id);
    }

    fn accept_job(&mut self, ctx: &mut Context<'_>, sender: TaskId, id: JobId) {
        let Some(JobBody::Bus(job)) = ctx.jobs.body(id) else {
            ctx.reply_info(sender, Status::Inval, id);
            return;
        };

        match job.mode {
            BusMode::SlaveReceive => {
                let op = job.op;
                if op == FRAME_ANY {
                    if self.sub_any.is_some() {
                        ctx.reply_info(sender, Status::Busy, id);
                    } else {
                        self.sub_any = Some(id);
                    }
                } else if self.subs.contains_key(&op) {
                    ctx.reply_info(sender, Status::Busy, id);
                } else {
                    self.subs.insert(op, id);
                }
            }
            _ => {
                self.queue.push(ctx.jobs, id);
                self.start_next(ctx);
            }
        }
    }

    fn cancel_job(&mut self, ctx: &mut Context<'_>, sender: TaskId, id: JobId) {
        if self.current == Some(id) {
            // In flight; the next safe state in the simulated transfer is
            // right away.
            ctx.cancel_alarm();
            self.finish_current(ctx, Status::Canceled);
            return;
        }

        let subscribed_op = self
            .subs
            .iter()
            .find_map(|(&op, &sub)| (sub == id).then_some(op));
        if let Some(op) = subscribed_op {
            self.subs.remove(&op);
        } else if self.sub_any == Some(id) {
            self.sub_any = None;
        } else if !self.queue.unlink(ctx.jobs, id) {
            // Not ours.
            ctx.reply_result(sender, Status::Inval);
            return;
        }

        if let Some(JobBody::Bus(job)) = ctx.jobs.body_mut(id) {
            job.status = Status::Canceled;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, Status::Canceled, id);
    }
}

impl Task for BusSecretary {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.accept_job(ctx, msg.sender, id);
                Status::Ok
            }
            Opcode::Cancel => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.cancel_job(ctx, msg.sender, id);
                Status::Ok
            }
            Opcode::NotEmpty => {
                self.drain_rx(ctx);
                Status::Ok
            }
            Opcode::Alarm => {
                let now = ctx.now_ms();
                match self.state {
                    BusState::AwaitReply if now >= self.deadline => {
                        self.finish_current(ctx, Status::TimedOut);
                    }
                    BusState::Backoff if now >= self.deadline => {
                        self.state = BusState::Idle;
                        self.attempt(ctx);
                    }
                    // Stale alarm; the event it guarded already resolved.
                    _ => {}
                }
                Status::Ok
            }
            Opcode::SetIoctl => {
                let Payload::Ioctl { selector, count } = msg.payload else {
                    return Status::Inval;
                };
                let status = if selector == IOCTL_BUS_TIMEOUT_MS {
                    self.timeout_ms = count;
                    Status::Ok
                } else {
                    Status::Inval
                };
                ctx.reply_result(msg.sender, status);
                Status::Ok
            }
            Opcode::GetIoctl => {
                let Payload::Ioctl { selector, .. } = msg.payload else {
                    return Status::Inval;
                };
                if selector == IOCTL_BUS_TIMEOUT_MS {
                    ctx.reply_data(msg.sender, Status::Ok, self.timeout_ms);
                } else {
                    ctx.reply_data(msg.sender, Status::Inval, 0);
                }
                Status::Ok
            }
            Opcode::Init => Status::Ok,
            _ => Status::NoSys,
        }
    }
}
