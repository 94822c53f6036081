//! Job records and per-driver job queues.
//!
//! A job is a caller-owned parameter record submitted with a `Job` message;
//! its handle uniquely identifies the pending work. Instead of linking raw
//! pointers through caller memory, records live in a node-wide slab — the
//! [`JobTable`] — and queues are intrusive lists threading `next` indices
//! through the slots. Submitting a job lends the record to the callee; the
//! matching `ReplyInfo` returns ownership, and the caller reclaims the slot
//! with [`JobTable::take`]. Between those two points only the callee touches
//! the record.

use alloc::vec::Vec;

use heron_abi::{JobId, Status, TaskId};

use crate::agents::record::RecordJob;
use crate::bus::BusJob;
use crate::devices::adc::AdcJob;
use crate::devices::block::BlockJob;
use crate::devices::dac::DacJob;
use crate::devices::nvram::NvramJob;
use crate::directors::logger::LogJob;

/// Maximum pending jobs per node.
pub const MAX_JOBS: usize = 32;

/// Operation-specific job parameters and result fields.
#[derive(Debug, Clone)]
pub enum JobBody {
    Adc(AdcJob),
    Dac(DacJob),
    Block(BlockJob),
    Nvram(NvramJob),
    Bus(BusJob),
    Record(RecordJob),
    Log(LogJob),
}

impl JobBody {
    /// The job's completion status, wherever the body keeps it.
    pub fn status(&self) -> Status {
        match self {
            JobBody::Adc(job) => job.status,
            JobBody::Dac(job) => job.status,
            JobBody::Block(job) => job.status,
            JobBody::Nvram(job) => job.status,
            JobBody::Bus(job) => job.status,
            JobBody::Record(job) => job.status,
            JobBody::Log(job) => job.status,
        }
    }
}

struct JobSlot {
    /// Forward link used by the callee's queue.
    next: Option<JobId>,
    /// Task to post the completion reply to.
    reply_to: TaskId,
    body: JobBody,
}

/// Node-wide slab of job records.
pub struct JobTable {
    slots: Vec<Option<JobSlot>>,
}

impl JobTable {
    pub fn new() -> JobTable {
        let mut slots = Vec::with_capacity(MAX_JOBS);
        slots.resize_with(MAX_JOBS, || None);
        JobTable { slots }
    }

    /// Allocate a record. Returns `None` when the table is full.
    pub fn insert(&mut self, reply_to: TaskId, body: JobBody) -> Option<JobId> {
        let index = self.slots.iter().position(|slot| slot.is_none())?;
        self.slots[index] = Some(JobSlot {
            next: None,
            reply_to,
            body,
        });
        Some(JobId(index as u16))
    }

    /// Reclaim a record, returning the body by value. The caller does this
    /// after receiving the job's reply.
    pub fn take(&mut self, id: JobId) -> Option<JobBody> {
        self.slots
            .get_mut(id.0 as usize)?
            .take()
            .map(|slot| slot.body)
    }

    /// The task the completion reply goes to.
    pub fn reply_to(&self, id: JobId) -> TaskId {
        self.slot(id).map_or(TaskId::NONE, |slot| slot.reply_to)
    }

    pub fn body(&self, id: JobId) -> Option<&JobBody> {
        self.slot(id).map(|slot| &slot.body)
    }

    pub fn body_mut(&mut self, id: JobId) -> Option<&mut JobBody> {
        self.slot_mut(id).map(|slot| &mut slot.body)
    }

    /// Live records (diagnostics).
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn slot(&self, id: JobId) -> Option<&JobSlot> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    fn slot_mut(&mut self, id: JobId) -> Option<&mut JobSlot> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    fn next_of(&self, id: JobId) -> Option<JobId> {
        self.slot(id).and_then(|slot| slot.next)
    }

    fn set_next(&mut self, id: JobId, next: Option<JobId>) {
        if let Some(slot) = self.slot_mut(id) {
            slot.next = next;
        }
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO of job records, threaded through [`JobTable`] slots.
///
/// Drivers keep one of these as the `headp` of their inbox; jobs run in
/// submission order.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobList {
    head: Option<JobId>,
    tail: Option<JobId>,
}

impl JobList {
    pub const fn new() -> JobList {
        JobList {
            head: None,
            tail: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<JobId> {
        self.head
    }

    /// Append a job at the tail.
    pub fn push(&mut self, table: &mut JobTable, id: JobId) {
        table.set_next(id, None);
        match self.tail {
            Some(tail) => table.set_next(tail, Some(id)),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    /// Remove and return the head job.
    pub fn pop(&mut self, table: &mut JobTable) -> Option<JobId> {
        let head = self.head?;
        self.head = table.next_of(head);
        if self.head.is_none() {
            self.tail = None;
        }
        table.set_next(head, None);
        Some(head)
    }

    /// Unlink a job from anywhere in the list. Returns `false` if the job
    /// was not queued here.
    pub fn unlink(&mut self, table: &mut JobTable, id: JobId) -> bool {
        let mut prev: Option<JobId> = None;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == id {
                let next = table.next_of(current);
                match prev {
                    Some(prev) => table.set_next(prev, next),
                    None => self.head = next,
                }
                if self.tail == Some(current) {
                    self.tail = prev;
                }
                table.set_next(current, None);
                return true;
            }
            prev = cursor;
            cursor = table.next_of(current);
        }
        false
    }
}

// =============================================================================
// Director scratch pool
// =============================================================================

/// Bytes in one scratch block.
pub const SCRATCH_BLOCK_LEN: usize = 64;

/// Blocks in the pool.
pub const SCRATCH_BLOCKS: usize = 4;

/// Token naming an allocated scratch block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchToken(u8);

/// Small fixed-block arena for director per-invocation scratch.
///
/// Directors allocate at the start of a recipe and release when they return
/// to idle; exhaustion reports `ENOMEM` to the originator.
pub struct ScratchPool {
    blocks: [[u8; SCRATCH_BLOCK_LEN]; SCRATCH_BLOCKS],
    used: [bool; SCRATCH_BLOCKS],
}

impl ScratchPool {
    pub fn new() -> ScratchPool {
        ScratchPool {
            blocks: [[0; SCRATCH_BLOCK_LEN]; SCRATCH_BLOCKS],
            used: [false; SCRATCH_BLOCKS],
        }
    }

    /// Claim a zeroed block.
    pub fn alloc(&mut self) -> Result<ScratchToken, Status> {
        for (index, used) in self.used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                self.blocks[index] = [0; SCRATCH_BLOCK_LEN];
                return Ok(ScratchToken(index as u8));
            }
        }
        Err(Status::NoMem)
    }

    /// Return a block to the pool.
    pub fn release(&mut self, token: ScratchToken) {
        self.used[token.0 as usize] = false;
    }

    /// Access an allocated block.
    pub fn block_mut(&mut self, token: ScratchToken) -> &mut [u8; SCRATCH_BLOCK_LEN] {
        &mut self.blocks[token.0 as usize]
    }

    /// Blocks currently claimed (diagnostics).
    pub fn in_use(&self) -> usize {
        self.used.iter().filter(|used| **used).count()
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new()
    }
}
