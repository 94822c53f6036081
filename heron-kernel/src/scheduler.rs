//! Task table, message pump and virtual time.
//!
//! The scheduler loop is `extract_msg` → dispatch: dequeue the next message,
//! look the receiver up in the flat task table, run its handler to
//! completion. Exactly one handler executes at any instant; a handler that
//! does not understand an opcode returns `ENOSYS` and the message is counted
//! as lost.
//!
//! On hardware the loop never terminates and interrupts preempt it. Here the
//! interrupt sources are polled producers advanced by a virtual millisecond
//! clock: [`Kernel::advance`] bumps the tick, lets every ISR source post its
//! messages, notifies the clock task and drains the mailbox — which makes
//! whole multi-node scenarios deterministic.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use heron_abi::{MAILBOX_CAPACITY, MAX_TASKS, Message, Opcode, Status, TASK_CLOCK, TaskId};

use crate::job::{JobTable, ScratchPool};
use crate::mailbox::Mailbox;
use crate::task::{Context, Task};

/// An interrupt source, modeled as a mailbox producer polled once per
/// virtual millisecond.
///
/// On a bare-metal target this is the ISR itself: capture the event, post a
/// message to the owning task, return. Sources must not touch any task's
/// queue structures.
pub trait IsrSource {
    fn poll(&mut self, now_ms: u64, mailbox: &Mailbox);
}

/// Dispatch guard for one `run_until_idle` drain; a cooperative system
/// that exceeds this is ping-ponging.
const DRAIN_LIMIT: usize = 100_000;

/// One node's kernel: mailbox, task table, job table, interrupt sources and
/// the monotonic tick.
pub struct Kernel {
    mailbox: Arc<Mailbox>,
    tasks: Vec<Option<Box<dyn Task>>>,
    jobs: JobTable,
    scratch: ScratchPool,
    tick: Arc<AtomicU64>,
    isr_sources: Vec<Box<dyn IsrSource>>,
}

impl Kernel {
    /// A kernel with the default mailbox capacity.
    pub fn new() -> Kernel {
        Kernel::with_capacity(MAILBOX_CAPACITY)
    }

    /// A kernel with an explicit mailbox capacity (a platform choice).
    pub fn with_capacity(capacity: usize) -> Kernel {
        let mut tasks = Vec::with_capacity(MAX_TASKS);
        tasks.resize_with(MAX_TASKS, || None);
        Kernel {
            mailbox: Arc::new(Mailbox::new(capacity)),
            tasks,
            jobs: JobTable::new(),
            scratch: ScratchPool::new(),
            tick: Arc::new(AtomicU64::new(0)),
            isr_sources: Vec::new(),
        }
    }

    /// Install a task in the table. Identifier 0 is reserved.
    pub fn register(&mut self, id: TaskId, task: Box<dyn Task>) {
        assert!(!id.is_none(), "task id 0 is reserved");
        assert!(id.index() < self.tasks.len(), "task id out of range");
        self.tasks[id.index()] = Some(task);
    }

    /// Attach an interrupt source.
    pub fn attach_isr(&mut self, source: Box<dyn IsrSource>) {
        self.isr_sources.push(source);
    }

    /// Shared handle to the mailbox, for external producers (ISRs, the bus
    /// wire, test harnesses).
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }

    /// Shared handle to the monotonic tick counter.
    pub fn tick_counter(&self) -> Arc<AtomicU64> {
        self.tick.clone()
    }

    /// Current monotonic time in milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Enqueue a message from outside any handler.
    pub fn post(&self, msg: Message) {
        self.mailbox.post(msg);
    }

    /// Messages lost so far.
    pub fn lost_messages(&self) -> u32 {
        self.mailbox.lost()
    }

    /// Direct access to the job table, for originators outside the task
    /// table (tests, host shells).
    pub fn jobs_mut(&mut self) -> &mut JobTable {
        &mut self.jobs
    }

    /// Direct access to the scratch pool.
    pub fn scratch_mut(&mut self) -> &mut ScratchPool {
        &mut self.scratch
    }

    /// Broadcast `Init` to every registered task and drain.
    pub fn init_all(&mut self) {
        for index in 1..self.tasks.len() {
            if self.tasks[index].is_some() {
                self.mailbox
                    .post(Message::notify(TaskId::NONE, TaskId(index as u8), Opcode::Init));
            }
        }
        self.run_until_idle();
    }

    /// Extract and dispatch one message. Returns `false` if the mailbox was
    /// empty.
    pub fn step(&mut self) -> bool {
        let Some(msg) = self.mailbox.take() else {
            return false;
        };

        let index = msg.receiver.index();
        let handler = match self.tasks.get_mut(index) {
            Some(Some(task)) if index != 0 => task,
            _ => {
                debug!("no task {:?} for {:?}", msg.receiver, msg.opcode);
                self.mailbox.count_lost();
                return true;
            }
        };

        let now_ms = self.tick.load(Ordering::Relaxed);
        let mut ctx = Context::new(
            msg.receiver,
            &self.mailbox,
            &mut self.jobs,
            &mut self.scratch,
            now_ms,
        );
        let status = handler.handle(&msg, &mut ctx);
        if status == Status::NoSys {
            debug!("task {:?} rejected {:?}", msg.receiver, msg.opcode);
            self.mailbox.count_lost();
        }
        true
    }

    /// Dispatch until the mailbox is empty. Returns the number of messages
    /// handled.
    pub fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        while self.step() {
            handled += 1;
            if handled >= DRAIN_LIMIT {
                warn!("drain limit hit; tasks are ping-ponging");
                break;
            }
        }
        handled
    }

    /// Advance the virtual clock by one millisecond without dispatching:
    /// bump the tick, poll every interrupt source, notify the clock task.
    pub fn tick_1ms(&mut self) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        for source in &mut self.isr_sources {
            source.poll(now, &self.mailbox);
        }
        self.mailbox
            .post(Message::notify(TaskId::NONE, TASK_CLOCK, Opcode::Tick));
    }

    /// Advance the virtual clock by `ms` milliseconds, draining the mailbox
    /// after each tick.
    pub fn advance(&mut self, ms: u64) {
        for _ in 0..ms {
            self.tick_1ms();
            self.run_until_idle();
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
