//! ADC driver task.
//!
//! The converter is a register-file peripheral on a serial bus with a
//! ready pin: reads of the data register must wait until the pin falls at
//! the end of a conversion. The pin-change interrupt and the
//! transfer-complete interrupt both post `NotBusy` to the driver, so all
//! job progress happens in main-loop context.
//!
//! Jobs are `{mode, register, data-status flag, value union}`. A data
//! register read fills the value union with the conversion's 4 data bytes
//! in wire (big-endian) order, followed by the status byte in the top slot
//! when the data-status flag is set. Every other register round-trips as a
//! little-endian long, with read-only bits masked on write.

use alloc::sync::Arc;

use log::debug;
use spinning_top::Spinlock;

use heron_abi::{IOCTL_ADC_CONV_MS, JobId, Message, Opcode, Payload, Status, TaskId};

use super::XFER_MS;
use crate::job::{JobBody, JobList};
use crate::mailbox::Mailbox;
use crate::scheduler::IsrSource;
use crate::task::{Context, Task};

/// Registers in the converter's register file.
pub const ADC_REG_COUNT: usize = 16;

/// Status register (read-only).
pub const ADC_REG_STATUS: u8 = 0x00;
/// Control register.
pub const ADC_REG_CONTROL: u8 = 0x01;
/// Conversion data register (read-only; reads wait on the ready pin).
pub const ADC_REG_DATA: u8 = 0x02;
/// First of the channel configuration registers.
pub const ADC_REG_CONFIG0: u8 = 0x09;

/// Default milliseconds per conversion.
pub const ADC_CONV_MS: u32 = 4;

/// Register width: the converter carries 24-bit registers.
const REG_MASK: u32 = 0x00FF_FFFF;

/// Job operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcMode {
    Read,
    Write,
    Reset,
}

/// An ADC job record.
#[derive(Debug, Clone)]
pub struct AdcJob {
    pub mode: AdcMode,
    pub reg: u8,
    /// Append the status byte to data-register reads.
    pub data_status: bool,
    /// Value union: little-endian long for plain registers; big-endian data
    /// bytes plus status byte for the data register.
    pub value: [u8; 5],
    pub status: Status,
}

impl AdcJob {
    /// Read a register.
    pub fn read(reg: u8) -> AdcJob {
        AdcJob {
            mode: AdcMode::Read,
            reg,
            data_status: false,
            value: [0; 5],
            status: Status::Ok,
        }
    }

    /// Read the conversion data register, optionally with the status byte.
    pub fn read_data(data_status: bool) -> AdcJob {
        AdcJob {
            data_status,
            ..AdcJob::read(ADC_REG_DATA)
        }
    }

    /// Write a register.
    pub fn write(reg: u8, value: u32) -> AdcJob {
        let mut job = AdcJob {
            mode: AdcMode::Write,
            ..AdcJob::read(reg)
        };
        job.set_long(value);
        job
    }

    /// Reset the converter.
    pub fn reset() -> AdcJob {
        AdcJob {
            mode: AdcMode::Reset,
            ..AdcJob::read(0)
        }
    }

    /// The value union as a little-endian long.
    pub fn long(&self) -> u32 {
        u32::from_le_bytes([self.value[0], self.value[1], self.value[2], self.value[3]])
    }

    /// Store a little-endian long in the value union.
    pub fn set_long(&mut self, value: u32) {
        self.value[..4].copy_from_slice(&value.to_le_bytes());
    }

    /// A data-register result as a signed sample.
    pub fn sample(&self) -> i32 {
        i32::from_be_bytes([self.value[0], self.value[1], self.value[2], self.value[3]])
    }

    /// The status byte of a data-register read (top slot of the union).
    pub fn status_byte(&self) -> u8 {
        self.value[4]
    }
}

/// Simulated converter state, shared between the driver and its ISR.
pub struct AdcHw {
    regs: [u32; ADC_REG_COUNT],
    /// The sample the next data-register read returns.
    sample: i32,
    /// Status byte latched with each conversion.
    sample_status: u8,
    /// Tick at which the current conversion finishes (ready pin falls).
    ready_at: u64,
    /// Tick at which the in-flight register transfer finishes.
    busy_until: u64,
    /// Pin-change interrupt armed (waiting on the ready pin).
    irq_on_ready: bool,
    /// Transfer-complete interrupt armed.
    irq_on_busy: bool,
}

impl AdcHw {
    pub fn new() -> Arc<Spinlock<AdcHw>> {
        Arc::new(Spinlock::new(AdcHw {
            regs: [0; ADC_REG_COUNT],
            sample: 0,
            sample_status: 0,
            ready_at: 0,
            busy_until: 0,
            irq_on_ready: false,
            irq_on_busy: false,
        }))
    }

    fn reset(&mut self) {
        self.regs = [0; ADC_REG_COUNT];
    }

    /// Which bits of a register are writable.
    fn writable_mask(reg: u8) -> u32 {
        match reg {
            ADC_REG_STATUS | ADC_REG_DATA => 0,
            _ => REG_MASK,
        }
    }
}

/// Test/bench handle: set the sample the converter will report next.
pub fn set_sample(hw: &Arc<Spinlock<AdcHw>>, sample: i32, status: u8) {
    let mut hw = hw.lock();
    hw.sample = sample;
    hw.sample_status = status;
}

/// The converter's interrupt source: ready-pin edge and transfer-complete.
pub struct AdcIsr {
    hw: Arc<Spinlock<AdcHw>>,
    owner: TaskId,
}

impl AdcIsr {
    pub fn new(hw: Arc<Spinlock<AdcHw>>, owner: TaskId) -> AdcIsr {
        AdcIsr { hw, owner }
    }
}

impl IsrSource for AdcIsr {
    fn poll(&mut self, now_ms: u64, mailbox: &Mailbox) {
        let mut hw = self.hw.lock();
        if hw.irq_on_busy && now_ms >= hw.busy_until {
            hw.irq_on_busy = false;
            mailbox.post(Message::notify(TaskId::NONE, self.owner, Opcode::NotBusy));
        } else if hw.irq_on_ready && now_ms >= hw.ready_at {
            hw.irq_on_ready = false;
            mailbox.post(Message::notify(TaskId::NONE, self.owner, Opcode::NotBusy));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdcState {
    Idle,
    /// Data read parked on the ready pin.
    WaitReady,
    /// Register transfer clocking through.
    Transfer,
}

/// The ADC driver task.
pub struct AdcTask {
    hw: Arc<Spinlock<AdcHw>>,
    queue: JobList,
    current: Option<JobId>,
    state: AdcState,
    /// In-flight job marked for termination at the next safe state.
    doomed: bool,
    conv_ms: u32,
}

impl AdcTask {
    pub fn new(hw: Arc<Spinlock<AdcHw>>) -> AdcTask {
        AdcTask {
            hw,
            queue: JobList::new(),
            current: None,
            state: AdcState::Idle,
            doomed: false,
            conv_ms: ADC_CONV_MS,
        }
    }

    fn begin_next(&mut self, ctx: &mut Context<'_>) {
        while self.current.is_none() {
            let Some(id) = self.queue.pop(ctx.jobs) else {
                return;
            };
            let Some(JobBody::Adc(job)) = ctx.jobs.body(id) else {
                let reply_to = ctx.jobs.reply_to(id);
                ctx.reply_info(reply_to, Status::Inval, id);
                continue;
            };

            if job.reg as usize >= ADC_REG_COUNT {
                self.finish(ctx, id, Status::Inval);
                continue;
            }

            self.current = Some(id);
            self.doomed = false;

            let wants_data = job.mode == AdcMode::Read && job.reg == ADC_REG_DATA;
            let now = ctx.now_ms();
            let mut hw = self.hw.lock();
            if wants_data && now < hw.ready_at {
                // Conversion still running; park on the pin-change interrupt.
                hw.irq_on_ready = true;
                self.state = AdcState::WaitReady;
            } else {
                hw.busy_until = now + XFER_MS;
                hw.irq_on_busy = true;
                self.state = AdcState::Transfer;
            }
        }
    }

    /// Apply the completed transfer's register effect to the job record.
    fn apply(&mut self, ctx: &mut Context<'_>, id: JobId) {
        let now = ctx.now_ms();
        let mut hw = self.hw.lock();
        let Some(JobBody::Adc(job)) = ctx.jobs.body_mut(id) else {
            return;
        };

        match job.mode {
            AdcMode::Read if job.reg == ADC_REG_DATA => {
                job.value[..4].copy_from_slice(&hw.sample.to_be_bytes());
                job.value[4] = if job.data_status { hw.sample_status } else { 0 };
                // Reading the data register starts the next conversion.
                hw.ready_at = now + self.conv_ms as u64;
            }
            AdcMode::Read => {
                let raw = hw.regs[job.reg as usize];
                job.value = [0; 5];
                job.value[..4].copy_from_slice(&raw.to_le_bytes());
            }
            AdcMode::Write => {
                let mask = AdcHw::writable_mask(job.reg);
                hw.regs[job.reg as usize] = job.long() & mask;
            }
            AdcMode::Reset => hw.reset(),
        }
    }

    fn finish(&mut self, ctx: &mut Context<'_>, id: JobId, status: Status) {
        if let Some(JobBody::Adc(job)) = ctx.jobs.body_mut(id) {
            job.status = status;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
        if self.current == Some(id) {
            self.current = None;
            self.state = AdcState::Idle;
        }
    }
}

impl Task for AdcTask {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Job => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                self.queue.push(ctx.jobs, id);
                if self.current.is_none() {
                    self.begin_next(ctx);
                }
                Status::Ok
            }
            Opcode::Cancel => {
                let Payload::Job(id) = msg.payload else {
                    return Status::Inval;
                };
                if self.current == Some(id) {
                    // Mid-transfer; terminate at the next interrupt.
                    self.doomed = true;
                } else if self.queue.unlink(ctx.jobs, id) {
                    self.finish(ctx, id, Status::Canceled);
                } else {
                    ctx.reply_result(msg.sender, Status::Inval);
                }
                Status::Ok
            }
            Opcode::NotBusy => {
                let Some(id) = self.current else {
                    return Status::Ok;
                };
                if self.doomed {
                    self.finish(ctx, id, Status::Canceled);
                    self.begin_next(ctx);
                    return Status::Ok;
                }
                match self.state {
                    AdcState::WaitReady => {
                        // Ready pin fell; clock the data out.
                        let now = ctx.now_ms();
                        let mut hw = self.hw.lock();
                        hw.busy_until = now + XFER_MS;
                        hw.irq_on_busy = true;
                        drop(hw);
                        self.state = AdcState::Transfer;
                    }
                    AdcState::Transfer => {
                        self.apply(ctx, id);
                        self.finish(ctx, id, Status::Ok);
                        self.begin_next(ctx);
                    }
                    AdcState::Idle => debug!("stray converter interrupt"),
                }
                Status::Ok
            }
            Opcode::SetIoctl => {
                let Payload::Ioctl { selector, count } = msg.payload else {
                    return Status::Inval;
                };
                let status = if selector == IOCTL_ADC_CONV_MS && count > 0 {
                    self.conv_ms = count;
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
                if selector == IOCTL_ADC_CONV_MS {
                    ctx.reply_data(msg.sender, Status::Ok, self.conv_ms);
                } else {
                    ctx.reply_data(msg.sender, Status::Inval, 0);
                }
                Status::Ok
            }
            Opcode::Init => {
                self.hw.lock().reset();
                Status::Ok
            }
            _ => Status::NoSys,
        }
    }
}
