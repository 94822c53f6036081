//! Cooperative message-passing task kernel for heron measurement nodes.
//!
//! Every subsystem — bus secretary, peripheral drivers, directors,
//! secretaries, agents — is a state-machine task with a single message
//! handler and a private state block. Tasks communicate exclusively by
//! copying fixed-size messages through one process-wide mailbox; interrupt
//! sources are just additional mailbox producers. The scheduler extracts one
//! message at a time and dispatches it, so exactly one handler runs at any
//! instant and no handler ever blocks.
//!
//! # Module Structure
//!
//! - [`mailbox`]: the process-wide bounded message FIFO
//! - [`scheduler`]: task table, message pump, virtual time
//! - [`task`]: the `Task` trait and the dispatch `Context`
//! - [`job`]: the shared job table and per-driver job queues
//! - [`clock`]: monotonic tick and per-task alarms
//! - [`bus`]: the two-wire inter-node bus secretary and simulated wire
//! - [`devices`]: ADC, DAC, storage-card and NVRAM driver tasks
//! - [`directors`]: multi-step recipe tasks (measurement logger)
//! - [`secretaries`]: bus-facing request/reply services
//! - [`agents`]: stateless job-level subroutines
//! - [`fs`]: the little-filesystem store and its secretary
//! - [`node`]: standard node bring-up

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod agents;
pub mod bus;
pub mod clock;
pub mod devices;
pub mod directors;
pub mod fs;
pub mod job;
pub mod logging;
pub mod mailbox;
pub mod node;
pub mod scheduler;
pub mod secretaries;
pub mod task;
pub mod testing;

pub use heron_abi as abi;
