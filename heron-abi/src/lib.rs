//! Shared vocabulary for the heron node cluster.
//!
//! This crate contains the task identifiers, message opcodes, status codes,
//! payload types and tuning constants that every task — and every node on the
//! inter-node bus — needs to agree on. On-wire layouts live in [`frame`].

#![cfg_attr(not(test), no_std)]

pub mod frame;

// =============================================================================
// Task identifiers
// =============================================================================

/// A task identifier: a small dense integer indexing the node's task table.
///
/// Identifier `0` is reserved as "no task". Messages posted from interrupt
/// context carry `TaskId::NONE` as their sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u8);

impl TaskId {
    /// The reserved "no task / invalid sender" identifier.
    pub const NONE: TaskId = TaskId(0);

    /// Whether this is the reserved invalid identifier.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Index into the task table.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// Well-known task ids for a standard node. The task table is sized by
// MAX_TASKS; ids above the well-known block are free for test harnesses.

/// Clock task: monotonic tick, alarms, kernel diagnostics.
pub const TASK_CLOCK: TaskId = TaskId(1);
/// Bus secretary for the inter-node two-wire bus.
pub const TASK_BUS: TaskId = TaskId(2);
/// ADC driver.
pub const TASK_ADC: TaskId = TaskId(3);
/// DAC driver.
pub const TASK_DAC: TaskId = TaskId(4);
/// Storage-card (block device) driver.
pub const TASK_CARD: TaskId = TaskId(5);
/// NVRAM driver (calibration + boot switch).
pub const TASK_NVRAM: TaskId = TaskId(6);
/// Record-formatting agent.
pub const TASK_RECORD: TaskId = TaskId(7);
/// Measurement logger director.
pub const TASK_LOGGER: TaskId = TaskId(8);
/// Ping secretary.
pub const TASK_PING: TaskId = TaskId(9);
/// Filesystem secretary.
pub const TASK_FS: TaskId = TaskId(10);

/// Size of the task table. Identifier 0 is never dispatched.
pub const MAX_TASKS: usize = 16;

// =============================================================================
// Opcodes
// =============================================================================

/// Message opcodes. Each opcode fixes which [`Payload`] variant is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Submit a job record; payload is `Payload::Job`.
    Job,
    /// Cancel a previously submitted job; payload is `Payload::Job`.
    Cancel,
    /// Operation finished, no per-job state; payload is `Payload::Result`.
    ReplyResult,
    /// Operation finished, results are in the job record; payload is
    /// `Payload::Info`.
    ReplyInfo,
    /// Operation finished with a directly returned long value; payload is
    /// `Payload::Data`.
    ReplyData,
    /// Receive data became available (ISR notification); no payload.
    NotEmpty,
    /// A transfer completed or a busy/ready pin released (ISR notification);
    /// no payload.
    NotBusy,
    /// A clock alarm fired; no payload.
    Alarm,
    /// Begin initialization.
    Init,
    /// Initialization finished; drivers self-post this to start queued jobs.
    InitOk,
    /// Start a director's configured recipe.
    Start,
    /// Request graceful shutdown at the next recipe boundary.
    Stop,
    /// Configuration change; payload is `Payload::Ioctl`.
    SetIoctl,
    /// Query a configuration value; payload is `Payload::Ioctl`, answered
    /// with `ReplyData`.
    GetIoctl,
    /// Removable media changed; the driver must re-initialize.
    MediaChange,
    /// Set (or overwrite) the sender's alarm; payload is `Payload::Long`
    /// carrying the delay in milliseconds. Fire-and-forget.
    AlarmSet,
    /// Drop the sender's pending alarm, silently. Fire-and-forget.
    AlarmCancel,
    /// Timer-ISR tick notification to the clock task; no payload.
    Tick,
    /// Diagnostic query (lost-message count), answered with `ReplyData`.
    GetStats,
}

// =============================================================================
// Status codes
// =============================================================================

/// Status byte carried in every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Operation complete.
    Ok = 0,
    /// Transient failure; try again.
    Again = 1,
    /// Callee already serving and does not queue, or bus arbitration lost
    /// repeatedly.
    Busy = 2,
    /// No reply within the deadline.
    TimedOut = 3,
    /// Scratch allocation failed.
    NoMem = 4,
    /// Target has no more reserved zones.
    XFull = 5,
    /// No space left on the store.
    NoSpc = 6,
    /// Out-of-range or malformed parameter.
    Inval = 7,
    /// Opcode not implemented by the receiver.
    NoSys = 8,
    /// Operation forbidden by mode bits.
    Perm = 9,
    /// Name not found.
    NoEnt = 10,
    /// Name already exists.
    Exist = 11,
    /// Path component is not a directory.
    NotDir = 12,
    /// Name exceeds the on-store limit.
    NameTooLong = 13,
    /// Directory not empty.
    DirNotEmpty = 14,
    /// Link count limit reached.
    MLink = 15,
    /// Addressed hardware absent or non-responsive.
    NoDev = 16,
    /// Hardware error during transfer.
    Io = 17,
    /// Write-protected or similar access refusal.
    Access = 18,
    /// Job terminated by cancellation.
    Canceled = 19,
}

impl Status {
    /// Whether this status is `Ok`.
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Decode a status byte from the wire. Unknown bytes map to `Io`.
    pub fn from_raw(raw: u8) -> Status {
        match raw {
            0 => Status::Ok,
            1 => Status::Again,
            2 => Status::Busy,
            3 => Status::TimedOut,
            4 => Status::NoMem,
            5 => Status::XFull,
            6 => Status::NoSpc,
            7 => Status::Inval,
            8 => Status::NoSys,
            9 => Status::Perm,
            10 => Status::NoEnt,
            11 => Status::Exist,
            12 => Status::NotDir,
            13 => Status::NameTooLong,
            14 => Status::DirNotEmpty,
            15 => Status::MLink,
            16 => Status::NoDev,
            17 => Status::Io,
            18 => Status::Access,
            19 => Status::Canceled,
            _ => Status::Io,
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// Handle naming a job record in the node's job table.
///
/// The handle uniquely identifies pending work: the record it names is lent
/// to the callee from the `Job` message until the matching `ReplyInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u16);

// =============================================================================
// Messages
// =============================================================================

/// Tagged message payload. At most one long, one job handle, or one
/// selector/count pair — messages stay fixed-size and are copied whole into
/// and out of the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// No payload.
    None,
    /// One-byte status (for `ReplyResult`).
    Result(Status),
    /// A bare long value (for `AlarmSet`, `Start`).
    Long(u32),
    /// Status plus a directly returned long (for `ReplyData`).
    Data { status: Status, value: u32 },
    /// A job handle (for `Job` and `Cancel`).
    Job(JobId),
    /// Status plus the job handle whose record holds the results (for
    /// `ReplyInfo`).
    Info { status: Status, job: JobId },
    /// Configuration selector and long count (for `SetIoctl` / `GetIoctl`).
    Ioctl { selector: u16, count: u32 },
}

/// A fixed-size inter-task message.
///
/// Messages are value types: they are copied into the mailbox on send and
/// out of it on dispatch, so a sender may reuse its message storage
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub sender: TaskId,
    pub receiver: TaskId,
    pub opcode: Opcode,
    pub payload: Payload,
}

impl Message {
    /// Submit a job record.
    pub fn job(sender: TaskId, receiver: TaskId, job: JobId) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::Job,
            payload: Payload::Job(job),
        }
    }

    /// Cancel a previously submitted job.
    pub fn cancel(sender: TaskId, receiver: TaskId, job: JobId) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::Cancel,
            payload: Payload::Job(job),
        }
    }

    /// Reply with a bare status.
    pub fn reply_result(sender: TaskId, receiver: TaskId, status: Status) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::ReplyResult,
            payload: Payload::Result(status),
        }
    }

    /// Reply, returning the job record to its owner.
    pub fn reply_info(sender: TaskId, receiver: TaskId, status: Status, job: JobId) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::ReplyInfo,
            payload: Payload::Info { status, job },
        }
    }

    /// Reply with a directly returned long value.
    pub fn reply_data(sender: TaskId, receiver: TaskId, status: Status, value: u32) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::ReplyData,
            payload: Payload::Data { status, value },
        }
    }

    /// A payload-free notification (`NotEmpty`, `NotBusy`, `Init`, …).
    pub fn notify(sender: TaskId, receiver: TaskId, opcode: Opcode) -> Message {
        Message {
            sender,
            receiver,
            opcode,
            payload: Payload::None,
        }
    }

    /// A configuration change.
    pub fn set_ioctl(sender: TaskId, receiver: TaskId, selector: u16, count: u32) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::SetIoctl,
            payload: Payload::Ioctl { selector, count },
        }
    }

    /// A configuration query.
    pub fn get_ioctl(sender: TaskId, receiver: TaskId, selector: u16) -> Message {
        Message {
            sender,
            receiver,
            opcode: Opcode::GetIoctl,
            payload: Payload::Ioctl { selector, count: 0 },
        }
    }
}

// =============================================================================
// Ioctl selectors
// =============================================================================

/// ADC conversion time in milliseconds.
pub const IOCTL_ADC_CONV_MS: u16 = 0x01;
/// Card write-protect switch (nonzero = protected).
pub const IOCTL_CARD_WRITE_PROTECT: u16 = 0x02;
/// Bus master-transaction reply timeout in milliseconds.
pub const IOCTL_BUS_TIMEOUT_MS: u16 = 0x03;
/// Logger: target inode for `Start`-initiated sessions.
pub const IOCTL_LOG_INODE: u16 = 0x10;
/// Logger: record count for `Start`-initiated sessions.
pub const IOCTL_LOG_COUNT: u16 = 0x11;
/// Logger: sampling period in milliseconds.
pub const IOCTL_LOG_PERIOD_MS: u16 = 0x12;
/// Logger: bus address of the node running the filesystem secretary.
pub const IOCTL_LOG_FS_ADDR: u16 = 0x13;

// =============================================================================
// Tuning constants
// =============================================================================

/// Default mailbox capacity. A platform choice, not part of the contract;
/// kernels may be built with a different capacity.
pub const MAILBOX_CAPACITY: usize = 32;

/// Master transaction retry limit for transient bus errors (arbitration
/// loss, address NAK).
pub const BUS_RETRY_LIMIT: u8 = 3;

/// Back-off delay between bus retries, in milliseconds.
pub const BUS_RETRY_DELAY_MS: u32 = 2;

/// Reply deadline for master-transmit-slave-receive transactions, in
/// milliseconds.
pub const BUS_REPLY_TIMEOUT_MS: u32 = 200;

/// Sector length of the storage card, in bytes.
pub const SECTOR_LEN: usize = 128;

/// Length of one formatted log record, in bytes.
pub const RECORD_LEN: usize = 24;

/// Maximum file name length accepted by the filesystem secretary.
pub const FS_NAME_MAX: usize = 14;

/// Zone length of the little filesystem, in bytes.
pub const FS_ZONE_LEN: usize = 64;

/// Total data zones available on the store.
pub const FS_ZONE_COUNT: usize = 64;

/// Zones reserved per file when `mknod` does not say otherwise.
pub const FS_DEFAULT_ZONES: u8 = 2;

/// Inode number of the store root.
pub const FS_ROOT_INO: u16 = 1;

/// First sector used for zone data, for `OP_INDIR` sector mapping.
pub const FS_DATA_START_SECTOR: u16 = 8;
