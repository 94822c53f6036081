//! Support for exercising kernels in tests and host benches.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use heron_abi::{JobId, Message, Status, TaskId};

use crate::job::JobBody;
use crate::scheduler::Kernel;
use crate::task::{Context, Task};

/// A task that records every message it receives.
///
/// Tests register a probe at a spare task id and use it as the originator
/// of jobs: replies land in the shared inbox where assertions can read
/// them.
pub struct Probe {
    inbox: Arc<Spinlock<Vec<Message>>>,
}

impl Probe {
    /// The probe and a shared handle to its inbox.
    pub fn new() -> (Probe, Arc<Spinlock<Vec<Message>>>) {
        let inbox = Arc::new(Spinlock::new(Vec::new()));
        (
            Probe {
                inbox: inbox.clone(),
            },
            inbox,
        )
    }
}

impl Task for Probe {
    fn handle(&mut self, msg: &Message, _ctx: &mut Context<'_>) -> Status {
        self.inbox.lock().push(*msg);
        Status::Ok
    }
}

/// Drain a probe inbox, returning everything received so far.
pub fn drain(inbox: &Arc<Spinlock<Vec<Message>>>) -> Vec<Message> {
    core::mem::take(&mut *inbox.lock())
}

/// Allocate a job record on behalf of `from` and post it to `to`.
pub fn submit(kernel: &mut Kernel, from: TaskId, to: TaskId, body: JobBody) -> JobId {
    let id = kernel
        .jobs_mut()
        .insert(from, body)
        .expect("job table full");
    kernel.post(Message::job(from, to, id));
    id
}

/// Advance several kernels in lockstep by `ms` virtual milliseconds.
///
/// Each tick is applied to every kernel, then all mailboxes are drained
/// until the whole topology goes quiet — bus deliveries re-fill remote
/// mailboxes, so one drain round is not always enough.
pub fn run_lockstep(kernels: &mut [&mut Kernel], ms: u64) {
    for _ in 0..ms {
        for kernel in kernels.iter_mut() {
            kernel.tick_1ms();
        }
        loop {
            let mut moved = false;
            for kernel in kernels.iter_mut() {
                moved |= kernel.run_until_idle() > 0;
            }
            if !moved {
                break;
            }
        }
    }
}
