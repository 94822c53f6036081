//! Storage-card (block device) driver task.
//!
//! The card needs a multi-step initialization handshake before it accepts
//! transfers: power-up probe, idle state, capacity-support negotiation and
//! an optional-capability probe. Each step is a serial transaction finished
//! by the transfer-complete interrupt; jobs arriving during the handshake
//! are queued but not started until the driver posts `InitOk` to itself.
//!
//! `MediaChange` invalidates the initialization flag: the next job request
//! re-runs the handshake before any transfer.

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info};
use spinning_top::Spinlock;

use heron_abi::{IOCTL_CARD_WRITE_PROTECT, JobId, Message, Opcode, Payload, SECTOR_LEN, Status, TaskId};

use super::XFER_MS;
use crate::job::{JobBody, JobList};
use crate::mailbox::Mailbox;
use crate::scheduler::IsrSource;
use crate::task::{Context, Task};

/// Sectors on the simulated card.
pub const CARD_SECTORS: usize = 64;

/// Job operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    ReadSector,
    WriteSector,
}

/// A block job record.
#[derive(Debug, Clone)]
pub struct BlockJob {
    pub op: BlockOp,
    /// Physical sector number.
    pub sector: u16,
    /// Sector buffer: source for writes, destination for reads.
    pub data: Vec<u8>,
    pub status: Status,
}

impl BlockJob {
    pub fn read(sector: u16) -> BlockJob {
        BlockJob {
            op: BlockOp::ReadSector,
            sector,
            data: Vec::new(),
            status: Status::Ok,
        }
    }

    pub fn write(sector: u16, data: &[u8]) -> BlockJob {
        BlockJob {
            op: BlockOp::WriteSector,
            sector,
            data: data.to_vec(),
            status: Status::Ok,
        }
    }
}

/// Simulated card state, shared between the driver and its ISR.
pub struct CardHw {
    sectors: Vec<[u8; SECTOR_LEN]>,
    /// Card inserted and answering.
    present: bool,
    busy_until: u64,
    irq_armed: bool,
}

impl CardHw {
    pub fn new() -> Arc<Spinlock<CardHw>> {
        let mut sectors = Vec::with_capacity(CARD_SECTORS);
        sectors.resize(CARD_SECTORS, [0u8; SECTOR_LEN]);
        Arc::new(Spinlock::new(CardHw {
            sectors,
            present: true,
            busy_until: 0,
            irq_armed: false,
        }))
    }

    fn start_op(&mut self, now: u64) {
        self.busy_until = now + XFER_MS;
        self.irq_armed = true;
    }
}

/// Test/bench handle: pull or remove the card.
pub fn set_present(hw: &Arc<Spinlock<CardHw>>, present: bool) {
    hw.lock().present = present;
}

/// Test/bench handle: a sector's current contents.
pub fn sector(hw: &Arc<Spinlock<CardHw>>, sector: usize) -> [u8; SECTOR_LEN] {
    hw.lock().sectors[sector]
}

/// The card's transfer-complete interrupt source.
pub struct CardIsr {
    hw: Arc<Spinlock<CardHw>>,
    owner: TaskId,
}

impl CardIsr {
    pub fn new(hw: Arc<Spinlock<CardHw>>, owner: TaskId) -> CardIsr {
        CardIsr { hw, owner }
    }
}

impl IsrSource for CardIsr {
    fn poll(&mut self, now_ms: u64, mailbox: &Mailbox) {
        let mut hw = self.hw.lock();
        if hw.irq_armed && now_ms >= hw.busy_until {
            hw.irq_armed = false;
            mailbox.post(Message::notify(TaskId::NONE, self.owner, Opcode::NotBusy));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    /// Not initialized (boot, or after a media change).
    Uninit,
    // Handshake phases, in order.
    PowerUp,
    IdleState,
    Negotiate,
    ProbeCaps,
    /// Handshake done; ready for transfers.
    Ready,
    /// Sector transfer in flight.
    Transfer,
}

/// The storage-card driver task.
pub struct CardTask {
    hw: Arc<Spinlock<CardHw>>,
    queue: JobList,
    current: Option<JobId>,
    state: CardState,
    doomed: bool,
    /// Media changed while a transfer was in flight.
    reinit_needed: bool,
    write_protect: bool,
}

impl CardTask {
    pub fn new(hw: Arc<Spinlock<CardHw>>) -> CardTask {
        CardTask {
            hw,
            queue: JobList::new(),
            current: None,
            state: CardState::Uninit,
            doomed: false,
            reinit_needed: false,
            write_protect: false,
        }
    }

    fn start_init(&mut self, ctx: &mut Context<'_>) {
        debug!("card handshake: power-up probe");
        self.state = CardState::PowerUp;
        self.hw.lock().start_op(ctx.now_ms());
    }

    /// Advance the handshake by one phase per transfer interrupt.
    fn init_step(&mut self, ctx: &mut Context<'_>) {
        if self.state == CardState::PowerUp && !self.hw.lock().present {
            info!("no card answered the power-up probe");
            self.state = CardState::Uninit;
            self.fail_queue(ctx, Status::NoDev);
            return;
        }

        self.state = match self.state {
            CardState::PowerUp => CardState::IdleState,
            CardState::IdleState => CardState::Negotiate,
            CardState::Negotiate => CardState::ProbeCaps,
            CardState::ProbeCaps => {
                // Handshake complete; queued jobs start once InitOk lands.
                ctx.send(Message::notify(ctx.own_id(), ctx.own_id(), Opcode::InitOk));
                CardState::Ready
            }
            other => other,
        };

        if self.state != CardState::Ready {
            self.hw.lock().start_op(ctx.now_ms());
        }
    }

    /// Drain the whole queue with `status` (card absent).
    fn fail_queue(&mut self, ctx: &mut Context<'_>, status: Status) {
        while let Some(id) = self.queue.pop(ctx.jobs) {
            if let Some(JobBody::Block(job)) = ctx.jobs.body_mut(id) {
                job.status = status;
            }
            let reply_to = ctx.jobs.reply_to(id);
            ctx.reply_info(reply_to, status, id);
        }
    }

    fn begin_next(&mut self, ctx: &mut Context<'_>) {
        while self.current.is_none() && self.state == CardState::Ready {
            let Some(id) = self.queue.pop(ctx.jobs) else {
                return;
            };
            let Some(JobBody::Block(job)) = ctx.jobs.body(id) else {
                let reply_to = ctx.jobs.reply_to(id);
                ctx.reply_info(reply_to, Status::Inval, id);
                continue;
            };

            if job.sector as usize >= CARD_SECTORS {
                self.finish(ctx, id, Status::Inval);
                continue;
            }
            if job.op == BlockOp::WriteSector && self.write_protect {
                self.finish(ctx, id, Status::Access);
                continue;
            }

            self.current = Some(id);
            self.doomed = false;
            self.state = CardState::Transfer;
            self.hw.lock().start_op(ctx.now_ms());
        }
    }

    fn apply(&mut self, ctx: &mut Context<'_>, id: JobId) -> Status {
        let mut hw = self.hw.lock();
        if !hw.present {
            return Status::NoDev;
        }
        let Some(JobBody::Block(job)) = ctx.jobs.body_mut(id) else {
            return Status::Inval;
        };
        let index = job.sector as usize;
        match job.op {
            BlockOp::ReadSector => {
                job.data.clear();
                job.data.extend_from_slice(&hw.sectors[index]);
            }
            BlockOp::WriteSector => {
                let mut block = [0u8; SECTOR_LEN];
                let take = job.data.len().min(SECTOR_LEN);
                block[..take].copy_from_slice(&job.data[..take]);
                hw.sectors[index] = block;
            }
        }
        Status::Ok
    }

    fn finish(&mut self, ctx: &mut Context<'_>, id: JobId, status: Status) {
        if let Some(JobBody::Block(job)) = ctx.jobs.body_mut(id) {
            job.status = status;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
        if self.current == Some(id) {
            self.current = None;
            self.state = CardState::Ready;
            if self.reinit_needed {
                self.reinit_needed = false;
                self.state = CardState::Uninit;
            }
        }
    }
}

impl Task for CardTask {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.queue.push(ctx.jobs, id);
                match self.state {
                    CardState::Uninit => self.start_init(ctx),
                    CardState::Ready => self.begin_next(ctx),
                    // Handshake or transfer in progress; job stays queued.
                    _ => {}
                }
                Status::Ok
            }
            Opcode::Cancel => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                if self.current == Some(id) {
                    self.doomed = true;
                } else if self.queue.unlink(ctx.jobs, id) {
                    self.finish(ctx, id, Status::Canceled);
                } else {
                    ctx.reply_result(msg.sender, Status::Inval);
                }
                Status::Ok
            }
            Opcode::NotBusy => {
                match self.state {
                    CardState::Transfer => {
                        let Some(id) = self.current else {
                            return Status::Ok;
                        };
                        let status = if self.doomed {
                            Status::Canceled
                        } else {
                            self.apply(ctx, id)
                        };
                        self.finish(ctx, id, status);
                        if self.state == CardState::Uninit {
                            if !self.queue.is_empty() {
                                self.start_init(ctx);
                            }
                        } else {
                            self.begin_next(ctx);
                        }
                    }
                    CardState::Uninit | CardState::Ready => {
                        debug!("stray card interrupt");
                    }
                    _ => self.init_step(ctx),
                }
                Status::Ok
            }
            Opcode::InitOk => {
                info!("card ready");
                self.begin_next(ctx);
                Status::Ok
            }
            Opcode::Init => {
                if self.state == CardState::Uninit {
                    self.start_init(ctx);
                }
                Status::Ok
            }
            Opcode::MediaChange => {
                match self.state {
                    CardState::Transfer => self.reinit_needed = true,
                    _ => {
                        self.state = CardState::Uninit;
                        if !self.queue.is_empty() {
                            self.start_init(ctx);
                        }
                    }
                }
                Status::Ok
            }
            Opcode::SetIoctl => {
                let Payload::Ioctl { selector, count } = msg.payload else {
                    return Status::Inval;
                };
                let status = if selector == IOCTL_CARD_WRITE_PROTECT {
                    self.write_protect = count != 0;
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
                if selector == IOCTL_CARD_WRITE_PROTECT {
                    ctx.reply_data(msg.sender, Status::Ok, self.write_protect as u32);
                } else {
                    ctx.reply_data(msg.sender, Status::Inval, 0);
                }
                Status::Ok
            }
            _ => Status::NoSys,
        }
    }
}
