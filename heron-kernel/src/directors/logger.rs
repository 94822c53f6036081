//! Measurement logger director.
//!
//! Runs the cluster's bread-and-butter recipe: every period, sample the
//! ADC, format the reading into a 24-byte record, and append it to a log
//! file on the node that runs the store. When the file's reserved zones run
//! out (`EXFULL`), the director rotates — advance to the next inode,
//! truncate, retry — and the record lands at offset 0 of the new file.
//!
//! Sessions come in as a job (`LogJob`) or via `Start` using the ioctl'd
//! defaults. Per-session staging lives in a scratch-pool block claimed at
//! session start and released at idle; pool exhaustion reports `ENOMEM` to
//! the originator. Every step that depends on somebody answering is guarded
//! by a clock alarm, and whatever happens — completion, failure, timeout,
//! `Cancel`, `Stop` — the originator hears exactly one outcome.

use log::{debug, info};
use zerocopy::IntoBytes;
use zerocopy::byteorder::little_endian::{U16, U32};

use heron_abi::frame::{FsWriteReply, FsWriteReq, OP_WRITE};
use heron_abi::{
    IOCTL_LOG_COUNT, IOCTL_LOG_FS_ADDR, IOCTL_LOG_INODE, IOCTL_LOG_PERIOD_MS, JobId, Message,
    Opcode, Payload, RECORD_LEN, Status, TASK_ADC, TASK_BUS, TASK_FS, TASK_RECORD, TaskId,
};

use crate::agents::record::RecordJob;
use crate::bus::BusJob;
use crate::devices::adc::AdcJob;
use crate::job::{JobBody, ScratchToken};
use crate::task::{Context, Task};

/// Guard deadline for any single recipe step, in milliseconds. Longer than
/// the bus reply timeout so the bus gets to report its own verdict first.
pub const LOG_STEP_TIMEOUT_MS: u32 = 250;

/// A logging-session job record.
#[derive(Debug, Clone)]
pub struct LogJob {
    /// First target inode.
    pub inode: u16,
    /// Records to log.
    pub count: u16,
    /// Sampling period.
    pub period_ms: u32,
    /// Bus address of the node running the store.
    pub fs_addr: u8,
    /// Records actually written (result).
    pub written: u16,
    /// Inode the session ended on, after any rotation (result).
    pub final_inode: u16,
    pub status: Status,
}

impl LogJob {
    pub fn new(inode: u16, count: u16, period_ms: u32, fs_addr: u8) -> LogJob {
        LogJob {
            inode,
            count,
            period_ms,
            fs_addr,
            written: 0,
            final_inode: inode,
            status: Status::Ok,
        }
    }
}

/// Where a session came from, and so where its one outcome goes.
#[derive(Debug, Clone, Copy)]
enum Origin {
    /// A `LogJob`; outcome is the job's `ReplyInfo`.
    Job(JobId),
    /// A `Start` from this task; outcome is a `ReplyResult`.
    Start(TaskId),
}

/// Recipe steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Idle,
    /// Between records, waiting out the period alarm.
    WaitPeriod,
    /// ADC job in flight.
    Sampling,
    /// Record-agent job in flight.
    Formatting,
    /// Store write (bus request) in flight.
    Writing,
}

struct Session {
    origin: Origin,
    scratch: ScratchToken,
    inode: u16,
    pos: u32,
    seq: u16,
    remaining: u16,
    written: u16,
    period_ms: u32,
    fs_addr: u8,
    /// Sub-job currently in flight, and who runs it.
    pending: Option<(JobId, TaskId)>,
    /// Step guard; alarms older than this are stale.
    deadline: u64,
    /// The current write already rotated once.
    rotated: bool,
    /// Graceful shutdown requested; finish at the next recipe boundary.
    stopping: Option<TaskId>,
    /// Latest sample, carried from the ADC step to the format step.
    sample: i32,
    sample_flags: u8,
}

/// The logger director task.
pub struct LoggerTask {
    state: LogState,
    session: Option<Session>,
    // `Start` defaults, set over ioctl.
    cfg_inode: u16,
    cfg_count: u16,
    cfg_period_ms: u32,
    cfg_fs_addr: u8,
}

impl LoggerTask {
    pub fn new() -> LoggerTask {
        LoggerTask {
            state: LogState::Idle,
            session: None,
            cfg_inode: 0,
            cfg_count: 0,
            cfg_period_ms: 1000,
            cfg_fs_addr: 0,
        }
    }

    fn start_session(
        &mut self,
        ctx: &mut Context<'_>,
        origin: Origin,
        inode: u16,
        count: u16,
        period_ms: u32,
        fs_addr: u8,
    ) {
        if count == 0 {
            self.report(ctx, origin, Status::Inval, inode, 0);
            return;
        }
        let scratch = match ctx.scratch.alloc() {
            Ok(token) => token,
            Err(status) => {
                self.report(ctx, origin, status, inode, 0);
                return;
            }
        };

        info!("logging {} records to inode {}", count, inode);
        self.session = Some(Session {
            origin,
            scratch,
            inode,
            pos: 0,
            seq: 0,
            remaining: count,
            written: 0,
            period_ms,
            fs_addr,
            pending: None,
            deadline: 0,
            rotated: false,
            stopping: None,
            sample: 0,
            sample_flags: 0,
        });
        self.wait_period(ctx);
    }

    /// Park until the next sampling period.
    fn wait_period(&mut self, ctx: &mut Context<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.deadline = ctx.now_ms() + session.period_ms as u64;
        let period = session.period_ms;
        self.state = LogState::WaitPeriod;
        ctx.set_alarm(period);
    }

    /// Issue the ADC sample job.
    fn step_sample(&mut self, ctx: &mut Context<'_>) {
        let job = JobBody::Adc(AdcJob::read_data(true));
        self.dispatch_step(ctx, TASK_ADC, job, LogState::Sampling);
    }

    /// Issue a sub-job and arm the step guard.
    fn dispatch_step(&mut self, ctx: &mut Context<'_>, to: TaskId, body: JobBody, state: LogState) {
        match ctx.submit(to, body) {
            Ok(id) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.pending = Some((id, to));
                session.deadline = ctx.now_ms() + LOG_STEP_TIMEOUT_MS as u64;
                self.state = state;
                ctx.set_alarm(LOG_STEP_TIMEOUT_MS);
            }
            Err(status) => self.finish(ctx, status),
        }
    }

    /// Issue the store write for the record staged in scratch.
    fn step_write(&mut self, ctx: &mut Context<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let header = FsWriteReq {
            inode: U16::new(session.inode),
            pos: U32::new(session.pos),
            truncate: session.rotated as u8,
            len: RECORD_LEN as u8,
        };
        let fs_addr = session.fs_addr;
        let mut payload = [0u8; size_of::<FsWriteReq>() + RECORD_LEN];
        payload[..size_of::<FsWriteReq>()].copy_from_slice(header.as_bytes());
        payload[size_of::<FsWriteReq>()..]
            .copy_from_slice(&ctx.scratch.block_mut(session.scratch)[..RECORD_LEN]);

        let job = JobBody::Bus(BusJob::request(fs_addr, OP_WRITE, TASK_FS, &payload));
        self.dispatch_step(ctx, TASK_BUS, job, LogState::Writing);
    }

    /// One record finished; advance, stop, or wind down.
    fn record_done(&mut self, ctx: &mut Context<'_>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.written += 1;
        session.seq += 1;
        session.remaining -= 1;
        session.rotated = false;

        if session.remaining == 0 {
            self.finish(ctx, Status::Ok);
        } else if session.stopping.is_some() {
            // Recipe boundary: honor the pending Stop.
            self.finish(ctx, Status::Ok);
        } else {
            self.wait_period(ctx);
        }
    }

    /// The store answered the write.
    fn write_done(&mut self, ctx: &mut Context<'_>, job: BusJob) {
        if !job.status.is_ok() {
            // Bus-level failure (ENODEV, EBUSY, EIO, ETIMEDOUT).
            self.finish(ctx, job.status);
            return;
        }
        let Some(reply) =
            <FsWriteReply as zerocopy::FromBytes>::read_from_bytes(
                job.reply.get(..size_of::<FsWriteReply>()).unwrap_or(&[]),
            )
            .ok()
        else {
            self.finish(ctx, Status::Io);
            return;
        };

        match Status::from_raw(reply.result) {
            Status::Ok => {
                if let Some(session) = self.session.as_mut() {
                    session.pos = reply.new_pos.get();
                }
                self.record_done(ctx);
            }
            Status::XFull => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                if session.rotated {
                    // Rotation already tried; the store is truly out of room.
                    self.finish(ctx, Status::XFull);
                    return;
                }
                // Rotate: next inode, truncate, retry the same record.
                session.inode += 1;
                session.pos = 0;
                session.rotated = true;
                debug!("log file full; rotating to inode {}", session.inode);
                self.step_write(ctx);
            }
            other => self.finish(ctx, other),
        }
    }

    /// Send the session's one outcome report.
    fn report(
        &mut self,
        ctx: &mut Context<'_>,
        origin: Origin,
        status: Status,
        final_inode: u16,
        written: u16,
    ) {
        match origin {
            Origin::Job(id) => {
                if let Some(JobBody::Log(job)) = ctx.jobs.body_mut(id) {
                    job.status = status;
                    job.written = written;
                    job.final_inode = final_inode;
                }
                let reply_to = ctx.jobs.reply_to(id);
                ctx.reply_info(reply_to, status, id);
            }
            Origin::Start(requester) => ctx.reply_result(requester, status),
        }
    }

    /// Tear the session down and report exactly once.
    fn finish(&mut self, ctx: &mut Context<'_>, status: Status) {
        let Some(session) = self.session.take() else {
            return;
        };
        self.state = LogState::Idle;
        ctx.cancel_alarm();

        // Disown any sub-job still in flight; its late reply is ignored.
        if let Some((id, to)) = session.pending {
            ctx.send(Message::cancel(ctx.own_id(), to, id));
        }
        ctx.scratch.release(session.scratch);

        self.report(ctx, session.origin, status, session.inode, session.written);
        if let Some(stopper) = session.stopping {
            ctx.reply_result(stopper, Status::Ok);
        }
    }

    fn on_alarm(&mut self, ctx: &mut Context<'_>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if ctx.now_ms() < session.deadline {
            // Stale alarm from a step that already resolved.
            return;
        }
        match self.state {
            LogState::WaitPeriod => {
                if self.session.as_ref().is_some_and(|s| s.stopping.is_some()) {
                    self.finish(ctx, Status::Ok);
                } else {
                    self.step_sample(ctx);
                }
            }
            // A guarded step went unanswered.
            LogState::Sampling | LogState::Formatting | LogState::Writing => {
                self.finish(ctx, Status::TimedOut);
            }
            LogState::Idle => {}
        }
    }

    fn on_reply(&mut self, ctx: &mut Context<'_>, status: Status, id: JobId) {
        let pending = self.session.as_ref().and_then(|s| s.pending);
        if pending.map(|(job, _)| job) != Some(id) {
            // Late reply for a disowned sub-job; just reclaim the record.
            ctx.jobs.take(id);
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.pending = None;
        }

        let Some(body) = ctx.jobs.take(id) else {
            return;
        };

        match (self.state, body) {
            (LogState::Sampling, JobBody::Adc(job)) => {
                if !status.is_ok() {
                    self.finish(ctx, status);
                    return;
                }
                let (sample, flags) = (job.sample(), job.status_byte());
                let tick = ctx.now_ms() as u32;
                let seq = self.session.as_ref().map_or(0, |s| s.seq);
                if let Some(session) = self.session.as_mut() {
                    session.sample = sample;
                    session.sample_flags = flags;
                }
                let format = JobBody::Record(RecordJob::new(seq, tick, sample, flags));
                self.dispatch_step(ctx, TASK_RECORD, format, LogState::Formatting);
            }
            (LogState::Formatting, JobBody::Record(job)) => {
                if !status.is_ok() {
                    self.finish(ctx, status);
                    return;
                }
                if let Some(session) = self.session.as_ref() {
                    ctx.scratch.block_mut(session.scratch)[..RECORD_LEN]
                        .copy_from_slice(&job.record);
                }
                self.step_write(ctx);
            }
            (LogState::Writing, JobBody::Bus(job)) => self.write_done(ctx, job),
            _ => self.finish(ctx, Status::Io),
        }
    }
}

impl Default for LoggerTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for LoggerTask {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                let Some(JobBody::Log(job)) = ctx.jobs.body(id) else {
                    ctx.reply_info(msg.sender, Status::Inval, id);
                    return Status::Ok;
                };
                if self.session.is_some() {
                    // One session at a time; this director does not queue.
                    ctx.reply_info(msg.sender, Status::Busy, id);
                    return Status::Ok;
                }
                let (inode, count, period_ms, fs_addr) =
                    (job.inode, job.count, job.period_ms, job.fs_addr);
                self.start_session(ctx, Origin::Job(id), inode, count, period_ms, fs_addr);
                Status::Ok
            }
            Opcode::Start => {
                if self.session.is_some() {
                    ctx.reply_result(msg.sender, Status::Busy);
                    return Status::Ok;
                }
                let (inode, count, period_ms, fs_addr) = (
                    self.cfg_inode,
                    self.cfg_count,
                    self.cfg_period_ms,
                    self.cfg_fs_addr,
                );
                self.start_session(ctx, Origin::Start(msg.sender), inode, count, period_ms, fs_addr);
                Status::Ok
            }
            Opcode::Cancel => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                let ours = matches!(
                    self.session.as_ref().map(|s| s.origin),
                    Some(Origin::Job(session_job)) if session_job == id
                );
                if ours {
                    self.finish(ctx, Status::Canceled);
                } else {
                    ctx.reply_result(msg.sender, Status::Inval);
                }
                Status::Ok
            }
            Opcode::Stop => {
                match self.session.as_mut() {
                    Some(session) => session.stopping = Some(msg.sender),
                    // Already idle.
                    None => ctx.reply_result(msg.sender, Status::Ok),
                }
                Status::Ok
            }
            Opcode::Alarm => {
                self.on_alarm(ctx);
                Status::Ok
            }
            Opcode::ReplyInfo => {
                let Payload::Info { status, job } = msg.payload else {
                    return Status::Inval;
                };
                self.on_reply(ctx, status, job);
                Status::Ok
            }
            Opcode::SetIoctl => {
                let Payload::Ioctl { selector, count } = msg.payload else {
                    return Status::Inval;
                };
                let status = match selector {
                    IOCTL_LOG_INODE => {
                        self.cfg_inode = count as u16;
                        Status::Ok
                    }
                    IOCTL_LOG_COUNT => {
                        self.cfg_count = count as u16;
                        Status::Ok
                    }
                    IOCTL_LOG_PERIOD_MS => {
                        self.cfg_period_ms = count;
                        Status::Ok
                    }
                    IOCTL_LOG_FS_ADDR => {
                        self.cfg_fs_addr = count as u8;
                        Status::Ok
                    }
                    _ => Status::Inval,
                };
                ctx.reply_result(msg.sender, status);
                Status::Ok
            }
            Opcode::GetIoctl => {
                let Payload::Ioctl { selector, .. } = msg.payload else {
                    return Status::Inval;
                };
                match selector {
                    IOCTL_LOG_INODE => ctx.reply_data(msg.sender, Status::Ok, self.cfg_inode as u32),
                    IOCTL_LOG_COUNT => ctx.reply_data(msg.sender, Status::Ok, self.cfg_count as u32),
                    IOCTL_LOG_PERIOD_MS => ctx.reply_data(msg.sender, Status::Ok, self.cfg_period_ms),
                    IOCTL_LOG_FS_ADDR => {
                        ctx.reply_data(msg.sender, Status::Ok, self.cfg_fs_addr as u32)
                    }
                    _ => ctx.reply_data(msg.sender, Status::Inval, 0),
                }
                Status::Ok
            }
            Opcode::Init => Status::Ok,
            _ => Status::NoSys,
        }
    }
}
