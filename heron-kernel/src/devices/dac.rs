//! DAC driver task.
//!
//! A four-channel converter with per-channel gain, reference and power
//! mode, plus an EEPROM image of the channel settings. Register transfers
//! complete through the transfer interrupt; EEPROM programming additionally
//! holds a busy pin, serviced exactly like the ADC's ready pin.

use alloc::sync::Arc;

use log::debug;
use spinning_top::Spinlock;

use heron_abi::{JobId, Message, Opcode, Payload, Status, TaskId};

use super::XFER_MS;
use crate::job::{JobBody, JobList};
use crate::mailbox::Mailbox;
use crate::scheduler::IsrSource;
use crate::task::{Context, Task};

/// Output channels on the part.
pub const DAC_CHANNELS: usize = 4;

/// Milliseconds an EEPROM program cycle holds the busy pin.
pub const DAC_EEPROM_MS: u64 = 5;

/// Full-scale code: the converter is 12-bit.
pub const DAC_CODE_MASK: u16 = 0x0FFF;

/// One channel's settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DacChannel {
    pub value: u16,
    pub gain: u8,
    pub reference: u8,
    pub power: u8,
}

/// A DAC job record.
///
/// With `read_flag` set, the job returns the addressed channel's current
/// settings in the same fields a write takes them from.
#[derive(Debug, Clone)]
pub struct DacJob {
    pub channel: u8,
    pub value: u16,
    pub gain: u8,
    pub reference: u8,
    pub power: u8,
    /// Do not latch the output; the value sits in the input register until
    /// a later update.
    pub inhibit_update: bool,
    /// Address the EEPROM image instead of the input registers.
    pub access_eeprom: bool,
    pub read_flag: bool,
    pub status: Status,
}

impl DacJob {
    /// Write a channel.
    pub fn write(channel: u8, value: u16, gain: u8, reference: u8, power: u8) -> DacJob {
        DacJob {
            channel,
            value,
            gain,
            reference,
            power,
            inhibit_update: false,
            access_eeprom: false,
            read_flag: false,
            status: Status::Ok,
        }
    }

    /// Read a channel's settings back.
    pub fn read(channel: u8) -> DacJob {
        DacJob {
            read_flag: true,
            ..DacJob::write(channel, 0, 0, 0, 0)
        }
    }
}

/// Simulated converter state, shared between the driver and its ISR.
pub struct DacHw {
    /// Input registers.
    regs: [DacChannel; DAC_CHANNELS],
    /// Latched outputs (what the pins carry).
    outputs: [u16; DAC_CHANNELS],
    /// EEPROM image.
    eeprom: [DacChannel; DAC_CHANNELS],
    busy_until: u64,
    irq_armed: bool,
}

impl DacHw {
    pub fn new() -> Arc<Spinlock<DacHw>> {
        Arc::new(Spinlock::new(DacHw {
            regs: [DacChannel::default(); DAC_CHANNELS],
            outputs: [0; DAC_CHANNELS],
            eeprom: [DacChannel::default(); DAC_CHANNELS],
            busy_until: 0,
            irq_armed: false,
        }))
    }
}

/// Test/bench handle: the latched output code of a channel.
pub fn output(hw: &Arc<Spinlock<DacHw>>, channel: usize) -> u16 {
    hw.lock().outputs[channel]
}

/// The converter's interrupt source: transfer-complete and EEPROM busy pin.
pub struct DacIsr {
    hw: Arc<Spinlock<DacHw>>,
    owner: TaskId,
}

impl DacIsr {
    pub fn new(hw: Arc<Spinlock<DacHw>>, owner: TaskId) -> DacIsr {
        DacIsr { hw, owner }
    }
}

impl IsrSource for DacIsr {
    fn poll(&mut self, now_ms: u64, mailbox: &Mailbox) {
        let mut hw = self.hw.lock();
        if hw.irq_armed && now_ms >= hw.busy_until {
            hw.irq_armed = false;
            mailbox.post(Message::notify(TaskId::NONE, self.owner, Opcode::NotBusy));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DacState {
    Idle,
    /// Register transfer clocking through.
    Transfer,
    /// EEPROM program cycle holding the busy pin.
    EepromWait,
}

/// The DAC driver task.
pub struct DacTask {
    hw: Arc<Spinlock<DacHw>>,
    queue: JobList,
    current: Option<JobId>,
    state: DacState,
    doomed: bool,
}

impl DacTask {
    pub fn new(hw: Arc<Spinlock<DacHw>>) -> DacTask {
        DacTask {
            hw,
            queue: JobList::new(),
            current: None,
            state: DacState::Idle,
            doomed: false,
        }
    }

    fn begin_next(&mut self, ctx: &mut Context<'_>) {
        while self.current.is_none() {
            let Some(id) = self.queue.pop(ctx.jobs) else {
                return;
            };
            let Some(JobBody::Dac(job)) = ctx.jobs.body(id) else {
                let reply_to = ctx.jobs.reply_to(id);
                ctx.reply_info(reply_to, Status::Inval, id);
                continue;
            };

            if job.channel as usize >= DAC_CHANNELS {
                self.finish(ctx, id, Status::Inval);
                continue;
            }

            self.current = Some(id);
            self.doomed = false;
            self.state = DacState::Transfer;

            let now = ctx.now_ms();
            let mut hw = self.hw.lock();
            hw.busy_until = now + XFER_MS;
            hw.irq_armed = true;
        }
    }

    /// Apply the completed transfer. Returns `true` if an EEPROM program
    /// cycle is still holding the busy pin.
    fn apply(&mut self, ctx: &mut Context<'_>, id: JobId) -> bool {
        let now = ctx.now_ms();
        let mut hw = self.hw.lock();
        let Some(JobBody::Dac(job)) = ctx.jobs.body_mut(id) else {
            return false;
        };
        let channel = job.channel as usize;

        if job.read_flag {
            let source = if job.access_eeprom {
                hw.eeprom[channel]
            } else {
                hw.regs[channel]
            };
            job.value = source.value;
            job.gain = source.gain;
            job.reference = source.reference;
            job.power = source.power;
            return false;
        }

        let settings = DacChannel {
            value: job.value & DAC_CODE_MASK,
            gain: job.gain,
            reference: job.reference,
            power: job.power,
        };
        hw.regs[channel] = settings;
        if !job.inhibit_update {
            hw.outputs[channel] = settings.value;
        }
        if job.access_eeprom {
            hw.eeprom[channel] = settings;
            hw.busy_until = now + DAC_EEPROM_MS;
            hw.irq_armed = true;
            return true;
        }
        false
    }

    fn finish(&mut self, ctx: &mut Context<'_>, id: JobId, status: Status) {
        if let Some(JobBody::Dac(job)) = ctx.jobs.body_mut(id) {
            job.status = status;
        }
        let reply_to = ctx.jobs.reply_to(id);
        ctx.reply_info(reply_to, status, id);
        if self.current == Some(id) {
            self.current = None;
            self.state = DacState::Idle;
        }
    }
}

impl Task for DacTask {
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
                    DacState::Transfer => {
                        if self.apply(ctx, id) {
                            self.state = DacState::EepromWait;
                        } else {
                            self.finish(ctx, id, Status::Ok);
                            self.begin_next(ctx);
                        }
                    }
                    DacState::EepromWait => {
                        // Busy pin released; programming done.
                        self.finish(ctx, id, Status::Ok);
                        self.begin_next(ctx);
                    }
                    DacState::Idle => debug!("stray converter interrupt"),
                }
                Status::Ok
            }
            Opcode::Init => {
                let mut hw = self.hw.lock();
                hw.regs = [DacChannel::default(); DAC_CHANNELS];
                hw.outputs = [0; DAC_CHANNELS];
                Status::Ok
            }
            _ => Status::NoSys,
        }
    }
}
