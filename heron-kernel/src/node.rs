//! Standard node bring-up.
//!
//! Assembles one measurement node the way the firmware image does: clock,
//! bus secretary on the wire, the four peripheral drivers with their
//! interrupt sources, the record agent, the logger director and the two bus
//! secretaries, all at their well-known task identifiers. `Init` is
//! broadcast at the end and the card handshake is given a few milliseconds
//! to settle, so the returned node is ready for work.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spinning_top::Spinlock;

use heron_abi::{
    TASK_ADC, TASK_BUS, TASK_CARD, TASK_CLOCK, TASK_DAC, TASK_FS, TASK_LOGGER, TASK_NVRAM,
    TASK_PING, TASK_RECORD,
};

use crate::agents::record::RecordAgent;
use crate::bus::{BusSecretary, Wire};
use crate::clock::ClockTask;
use crate::devices::adc::{AdcHw, AdcIsr, AdcTask};
use crate::devices::block::{CardHw, CardIsr, CardTask};
use crate::devices::dac::{DacHw, DacIsr, DacTask};
use crate::devices::nvram::{NvramHw, NvramTask};
use crate::directors::logger::LoggerTask;
use crate::fs::secretary::FsSecretary;
use crate::scheduler::Kernel;
use crate::secretaries::ping::PingSecretary;

/// One assembled node: the kernel plus handles to its simulated hardware.
pub struct Node {
    pub kernel: Kernel,
    pub addr: u8,
    pub adc: Arc<Spinlock<AdcHw>>,
    pub dac: Arc<Spinlock<DacHw>>,
    pub card: Arc<Spinlock<CardHw>>,
    pub nvram: Arc<Spinlock<NvramHw>>,
    /// The register window remote nodes read with master-receive.
    pub bus_registers: Arc<Spinlock<alloc::vec::Vec<u8>>>,
}

/// Milliseconds of settling time after `Init`: enough for the card
/// handshake to reach ready.
const SETTLE_MS: u64 = 8;

/// Build a standard node attached to `wire` at bus address `addr`.
pub fn bring_up(addr: u8, wire: &Wire) -> Node {
    let mut kernel = Kernel::new();

    kernel.register(TASK_CLOCK, Box::new(ClockTask::new()));

    let bus = BusSecretary::new(addr, TASK_BUS, wire, kernel.mailbox());
    let bus_registers = bus.registers();
    kernel.register(TASK_BUS, Box::new(bus));

    let adc = AdcHw::new();
    kernel.register(TASK_ADC, Box::new(AdcTask::new(adc.clone())));
    kernel.attach_isr(Box::new(AdcIsr::new(adc.clone(), TASK_ADC)));

    let dac = DacHw::new();
    kernel.register(TASK_DAC, Box::new(DacTask::new(dac.clone())));
    kernel.attach_isr(Box::new(DacIsr::new(dac.clone(), TASK_DAC)));

    let card = CardHw::new();
    kernel.register(TASK_CARD, Box::new(CardTask::new(card.clone())));
    kernel.attach_isr(Box::new(CardIsr::new(card.clone(), TASK_CARD)));

    let nvram = NvramHw::new();
    kernel.register(TASK_NVRAM, Box::new(NvramTask::new(nvram.clone())));

    kernel.register(TASK_RECORD, Box::new(RecordAgent::new()));
    kernel.register(TASK_LOGGER, Box::new(LoggerTask::new()));
    kernel.register(TASK_PING, Box::new(PingSecretary::new()));
    kernel.register(TASK_FS, Box::new(FsSecretary::new()));

    kernel.init_all();
    kernel.advance(SETTLE_MS);

    Node {
        kernel,
        addr,
        adc,
        dac,
        card,
        nvram,
        bus_registers,
    }
}
