//! The `Task` trait and the dispatch context.
//!
//! A task is a named component with a single message handler and private
//! state. Handlers never block and never call into other tasks: every
//! progression is a message send followed by a return, and the only way to
//! resume is to receive another message.

use heron_abi::{JobId, Message, Opcode, Payload, Status, TASK_CLOCK, TaskId};

use crate::job::{JobBody, JobTable, ScratchPool};
use crate::mailbox::Mailbox;

/// A state-machine task.
pub trait Task {
    /// Handle one message.
    ///
    /// Returning [`Status::NoSys`] tells the scheduler the opcode is not
    /// implemented here; the message is counted as lost.
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status;
}

/// Per-dispatch context handed to a task's handler.
///
/// Carries the identity of the running task, the mailbox for sends, the
/// shared job table, the scratch pool and the current tick. Sends go through
/// the mailbox: a message sent from within a handler is dispatched only
/// after the handler returns.
pub struct Context<'a> {
    own: TaskId,
    mailbox: &'a Mailbox,
    pub jobs: &'a mut JobTable,
    pub scratch: &'a mut ScratchPool,
    now_ms: u64,
}

impl<'a> Context<'a> {
    pub fn new(
        own: TaskId,
        mailbox: &'a Mailbox,
        jobs: &'a mut JobTable,
        scratch: &'a mut ScratchPool,
        now_ms: u64,
    ) -> Context<'a> {
        Context {
            own,
            mailbox,
            jobs,
            scratch,
            now_ms,
        }
    }

    /// Identifier of the task currently dispatched.
    pub fn own_id(&self) -> TaskId {
        self.own
    }

    /// Monotonic millisecond tick at dispatch time.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Messages lost so far (diagnostics).
    pub fn lost_messages(&self) -> u32 {
        self.mailbox.lost()
    }

    /// Enqueue a message. Drops on a full mailbox are counted, not reported.
    pub fn send(&self, msg: Message) {
        self.mailbox.post(msg);
    }

    /// Allocate a job record and submit it to `to`.
    ///
    /// The record is lent to `to` until its `ReplyInfo` comes back; reclaim
    /// it with `ctx.jobs.take(id)` when handling the reply.
    pub fn submit(&mut self, to: TaskId, body: JobBody) -> Result<JobId, Status> {
        let id = self.jobs.insert(self.own, body).ok_or(Status::NoMem)?;
        self.send(Message::job(self.own, to, id));
        Ok(id)
    }

    /// Post a `ReplyResult` to `to`.
    pub fn reply_result(&self, to: TaskId, status: Status) {
        self.send(Message::reply_result(self.own, to, status));
    }

    /// Post a `ReplyInfo` for `job` to `to`, returning record ownership.
    pub fn reply_info(&self, to: TaskId, status: Status, job: JobId) {
        self.send(Message::reply_info(self.own, to, status, job));
    }

    /// Post a `ReplyData` to `to`.
    pub fn reply_data(&self, to: TaskId, status: Status, value: u32) {
        self.send(Message::reply_data(self.own, to, status, value));
    }

    /// Set (or overwrite) this task's clock alarm, `delay_ms` from now.
    pub fn set_alarm(&self, delay_ms: u32) {
        self.send(Message {
            sender: self.own,
            receiver: TASK_CLOCK,
            opcode: Opcode::AlarmSet,
            payload: Payload::Long(delay_ms),
        });
    }

    /// Drop this task's pending alarm, if any.
    pub fn cancel_alarm(&self) {
        self.send(Message::notify(self.own, TASK_CLOCK, Opcode::AlarmCancel));
    }
}
