//! The clock task: monotonic tick and per-task alarms.
//!
//! The timer ISR posts `Tick` once per millisecond; everything else is
//! driven from those messages in main-loop context. A task asks for an
//! alarm with `AlarmSet` (overwriting any alarm it already has) and gets an
//! `Alarm` message back once the tick passes the deadline — never earlier,
//! possibly a tick late. Alarm management produces no reply traffic.
//!
//! No handler implements its own timeout: bus transactions, director
//! deadlines and init back-offs are all alarms observed as state-machine
//! inputs.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::debug;

use heron_abi::{Message, Opcode, Payload, Status, TaskId};

use crate::task::{Context, Task};

/// Clock task state: one outstanding deadline per task.
pub struct ClockTask {
    alarms: BTreeMap<TaskId, u64>,
}

impl ClockTask {
    pub fn new() -> ClockTask {
        ClockTask {
            alarms: BTreeMap::new(),
        }
    }

    /// Deadlines currently pending (diagnostics).
    pub fn pending(&self) -> usize {
        self.alarms.len()
    }

    fn deliver_due(&mut self, ctx: &Context<'_>) {
        let now = ctx.now_ms();
        let due: Vec<TaskId> = self
            .alarms
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&task, _)| task)
            .collect();

        for task in due {
            self.alarms.remove(&task);
            debug!("alarm for {:?} at {}", task, now);
            ctx.send(Message::notify(ctx.own_id(), task, Opcode::Alarm));
        }
    }
}

impl Default for ClockTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for ClockTask {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Tick => {
                self.deliver_due(ctx);
                Status::Ok
            }
            Opcode::AlarmSet => {
                let Payload::Long(delay_ms) = msg.payload else {
                    return Status::Inval;
                };
                // Overwrites any alarm the sender already holds.
                self.alarms
                    .insert(msg.sender, ctx.now_ms() + delay_ms as u64);
                Status::Ok
            }
            Opcode::AlarmCancel => {
                self.alarms.remove(&msg.sender);
                Status::Ok
            }
            Opcode::GetStats => {
                ctx.reply_data(msg.sender, Status::Ok, ctx.lost_messages());
                Status::Ok
            }
            Opcode::Init => Status::Ok,
            _ => Status::NoSys,
        }
    }
}
