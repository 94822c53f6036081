//! Simulated two-wire inter-node bus.
//!
//! The wire is the shared medium every node's bus secretary attaches to: a
//! map from bus address to the node's receive queue, exported register
//! window and mailbox. Master operations run synchronously against the
//! medium — a delivered frame is encoded to bytes and decoded again on the
//! far side, and arrival is signalled the way bus hardware would, by
//! posting `NotEmpty` to the receiving node's bus secretary from interrupt
//! context.
//!
//! Transient bus conditions (arbitration loss, transfer faults) are
//! injected by tests through the shared medium state.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spinning_top::Spinlock;

use heron_abi::frame::{FrameHeader, GENERAL_CALL_ADDR, MAX_FRAME_PAYLOAD};
use heron_abi::{Message, Opcode, TaskId};

use crate::mailbox::Mailbox;

/// One bus frame: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame; the payload is clamped to one frame's worth.
    pub fn new(op: u8, sender: u8, taskid: u8, payload: &[u8]) -> Frame {
        let take = payload.len().min(MAX_FRAME_PAYLOAD);
        Frame {
            header: FrameHeader {
                op,
                sender,
                taskid,
                len: take as u8,
            },
            payload: payload[..take].to_vec(),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FrameHeader::LEN + self.payload.len());
        bytes.extend_from_slice(zerocopy::IntoBytes::as_bytes(&self.header));
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decode from wire bytes. `None` if the header is short or the length
    /// field disagrees with the byte count.
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        if bytes.len() < FrameHeader::LEN {
            return None;
        }
        let header =
            <FrameHeader as zerocopy::FromBytes>::read_from_bytes(&bytes[..FrameHeader::LEN])
                .ok()?;
        let payload = &bytes[FrameHeader::LEN..];
        if payload.len() != header.len as usize {
            return None;
        }
        Some(Frame {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Why a master operation failed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// No node acknowledged the address.
    Nak,
    /// Lost arbitration against another master.
    ArbitrationLost,
    /// The transfer broke down mid-way.
    Fault,
}

struct Port {
    mailbox: Arc<Mailbox>,
    bus_task: TaskId,
    rx: Arc<Spinlock<VecDeque<Frame>>>,
    registers: Arc<Spinlock<Vec<u8>>>,
}

struct WireInner {
    ports: BTreeMap<u8, Port>,
    /// Master operations left that will lose arbitration.
    arb_losses: u32,
    /// Master operations left that will fault mid-transfer.
    faults: u32,
}

/// Handle to the shared bus medium. Cloning shares the medium.
#[derive(Clone)]
pub struct Wire {
    inner: Arc<Spinlock<WireInner>>,
}

impl Wire {
    pub fn new() -> Wire {
        Wire {
            inner: Arc::new(Spinlock::new(WireInner {
                ports: BTreeMap::new(),
                arb_losses: 0,
                faults: 0,
            })),
        }
    }

    /// Attach a node's bus port at `addr`.
    pub fn attach(
        &self,
        addr: u8,
        mailbox: Arc<Mailbox>,
        bus_task: TaskId,
        rx: Arc<Spinlock<VecDeque<Frame>>>,
        registers: Arc<Spinlock<Vec<u8>>>,
    ) {
        self.inner.lock().ports.insert(
            addr,
            Port {
                mailbox,
                bus_task,
                rx,
                registers,
            },
        );
    }

    /// Remove the node at `addr` from the medium (powered off / absent).
    pub fn detach(&self, addr: u8) {
        self.inner.lock().ports.remove(&addr);
    }

    /// The next `n` master operations lose arbitration.
    pub fn inject_arbitration_loss(&self, n: u32) {
        self.inner.lock().arb_losses = n;
    }

    /// The next `n` master operations fault mid-transfer.
    pub fn inject_fault(&self, n: u32) {
        self.inner.lock().faults = n;
    }

    /// Master-transmit `frame` to node `to` (or every other node, for the
    /// general-call address).
    pub fn master_transmit(&self, to: u8, frame: &Frame) -> Result<(), WireError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        take_injected(inner)?;

        // Round-trip through wire bytes; a frame that does not survive its
        // own encoding is a transfer fault.
        let delivered = Frame::decode(&frame.encode()).ok_or(WireError::Fault)?;

        if to == GENERAL_CALL_ADDR {
            for (&addr, port) in &inner.ports {
                if addr != frame.header.sender {
                    deliver(port, delivered.clone());
                }
            }
            return Ok(());
        }

        let port = inner.ports.get(&to).ok_or(WireError::Nak)?;
        deliver(port, delivered);
        Ok(())
    }

    /// Master-receive `buf.len()` bytes from node `to`'s register window,
    /// starting at register `reg`.
    pub fn master_receive(&self, to: u8, reg: u8, buf: &mut [u8]) -> Result<(), WireError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        take_injected(inner)?;

        let port = inner.ports.get(&to).ok_or(WireError::Nak)?;
        let registers = port.registers.lock();
        let start = reg as usize;
        let end = start + buf.len();
        if end > registers.len() {
            return Err(WireError::Fault);
        }
        buf.copy_from_slice(&registers[start..end]);
        Ok(())
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

fn take_injected(inner: &mut WireInner) -> Result<(), WireError> {
    if inner.arb_losses > 0 {
        inner.arb_losses -= 1;
        return Err(WireError::ArbitrationLost);
    }
    if inner.faults > 0 {
        inner.faults -= 1;
        return Err(WireError::Fault);
    }
    Ok(())
}

fn deliver(port: &Port, frame: Frame) {
    port.rx.lock().push_back(frame);
    // Receive interrupt: sender id 0, hardware context.
    port.mailbox
        .post(Message::notify(TaskId::NONE, port.bus_task, Opcode::NotEmpty));
}
