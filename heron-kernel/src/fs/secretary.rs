//! The filesystem secretary.
//!
//! Serves the little-filesystem opcodes to the rest of the cluster. The
//! task spends its life enslaved on the bus — one wildcard slave-receive
//! subscription at a time — and for each request runs the store operation,
//! hands the reply frame to the bus, and re-subscribes. `OP_SECTOR`
//! requests are relayed to the card driver, so the secretary's work states
//! look like any other director step: issue a job, wait for the reply.
//!
//! At most one request is in flight; a new one can only arrive after the
//! previous reply has been handed to the bus for transmission.

use alloc::vec::Vec;
use core::mem::size_of;

use log::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use zerocopy::byteorder::little_endian::{U16, U32};

use heron_abi::frame::{
    FRAME_ANY, FRAME_REPLY, FsIndirReply, FsIndirReq, FsInodeReply, FsLinkReq, FsMknodReq,
    FsPathReq, FsReadReply, FsReadReq, FsResultReply, FsSectorReply, FsSectorReq, FsUnlinkReq,
    FsWriteReply, FsWriteReq, MAX_FRAME_PAYLOAD, OP_INDIR, OP_LINK, OP_MKFS, OP_MKNOD, OP_PATH,
    OP_READ, OP_SECTOR, OP_UNLINK, OP_WRITE,
};
use heron_abi::{JobId, Message, Opcode, Payload, Status, TASK_BUS, TASK_CARD};

use super::store::FileStore;
use crate::bus::BusJob;
use crate::devices::block::BlockJob;
use crate::job::JobBody;
use crate::task::{Context, Task};

/// Stashed context of an `OP_SECTOR` request while the card works.
struct SectorPending {
    peer: u8,
    len: u8,
}

/// The filesystem secretary task.
pub struct FsSecretary {
    store: FileStore,
    /// Pending slave-receive subscription.
    sub: Option<JobId>,
    /// In-flight reply transmit.
    reply_out: Option<JobId>,
    /// In-flight card job for `OP_SECTOR`.
    card_job: Option<JobId>,
    sector: Option<SectorPending>,
}

impl FsSecretary {
    pub fn new() -> FsSecretary {
        FsSecretary {
            store: FileStore::new(),
            sub: None,
            reply_out: None,
            card_job: None,
            sector: None,
        }
    }

    fn resubscribe(&mut self, ctx: &mut Context<'_>) {
        self.sub = ctx
            .submit(TASK_BUS, JobBody::Bus(BusJob::slave(FRAME_ANY)))
            .ok();
    }

    /// Hand the reply frame to the bus, then open up for the next request.
    fn send_reply(&mut self, ctx: &mut Context<'_>, peer: u8, op: u8, payload: &[u8]) {
        let job = BusJob::transmit(peer, op | FRAME_REPLY, ctx.own_id(), payload);
        self.reply_out = ctx.submit(TASK_BUS, JobBody::Bus(job)).ok();
        self.resubscribe(ctx);
    }

    fn handle_request(&mut self, ctx: &mut Context<'_>, peer: u8, op: u8, payload: &[u8]) {
        // The wildcard subscription also catches stray replies and frames
        // for protocols this node does not speak. Dropped, never answered.
        if op & FRAME_REPLY != 0 || !is_store_op(op) {
            debug!("dropping frame op {:#04x} from {:#04x}", op, peer);
            self.resubscribe(ctx);
            return;
        }

        let mut reply = Vec::new();
        match op {
            OP_MKNOD => {
                let answer = match decode::<FsMknodReq>(payload) {
                    Some(req) => {
                        let name = &req.name[..(req.name_len as usize).min(req.name.len())];
                        match self.store.mknod(name, req.zones, req.truncate != 0) {
                            Ok(ino) => inode_reply(Status::Ok, ino),
                            Err(status) => inode_reply(status, 0),
                        }
                    }
                    None => inode_reply(Status::Inval, 0),
                };
                reply.extend_from_slice(answer.as_bytes());
            }
            OP_PATH => {
                let answer = match decode::<FsPathReq>(payload) {
                    Some(req) => {
                        let name = &req.name[..(req.name_len as usize).min(req.name.len())];
                        match self.store.path(name) {
                            Ok(ino) => inode_reply(Status::Ok, ino),
                            Err(status) => inode_reply(status, 0),
                        }
                    }
                    None => inode_reply(Status::Inval, 0),
                };
                reply.extend_from_slice(answer.as_bytes());
            }
            OP_READ => {
                let head = size_of::<FsReadReply>();
                let room = MAX_FRAME_PAYLOAD - head;
                let (answer, bytes) = match decode::<FsReadReq>(payload) {
                    Some(req) => {
                        let want = (req.len as usize).min(room);
                        match self.store.read(req.inode.get(), req.pos.get(), want) {
                            Ok((bytes, new_pos)) => (
                                FsReadReply {
                                    result: Status::Ok.into(),
                                    new_pos: U32::new(new_pos),
                                    len: bytes.len() as u8,
                                },
                                bytes,
                            ),
                            Err(status) => (read_error(status), Vec::new()),
                        }
                    }
                    None => (read_error(Status::Inval), Vec::new()),
                };
                reply.extend_from_slice(answer.as_bytes());
                reply.extend_from_slice(&bytes);
            }
            OP_WRITE => {
                let head = size_of::<FsWriteReq>();
                let answer = match decode::<FsWriteReq>(payload) {
                    Some(req) if payload.len() >= head + req.len as usize => {
                        let data = &payload[head..head + req.len as usize];
                        match self
                            .store
                            .write(req.inode.get(), req.pos.get(), data, req.truncate != 0)
                        {
                            Ok(new_pos) => FsWriteReply {
                                result: Status::Ok.into(),
                                new_pos: U32::new(new_pos),
                            },
                            Err(status) => FsWriteReply {
                                result: status.into(),
                                new_pos: req.pos,
                            },
                        }
                    }
                    _ => FsWriteReply {
                        result: Status::Inval.into(),
                        new_pos: U32::new(0),
                    },
                };
                reply.extend_from_slice(answer.as_bytes());
            }
            OP_LINK => {
                let result = match decode::<FsLinkReq>(payload) {
                    Some(req) => {
                        let name = &req.name[..(req.name_len as usize).min(req.name.len())];
                        self.store.link(req.inode.get(), name)
                    }
                    None => Status::Inval,
                };
                reply.extend_from_slice(
                    FsResultReply {
                        result: result.into(),
                    }
                    .as_bytes(),
                );
            }
            OP_UNLINK => {
                let result = match decode::<FsUnlinkReq>(payload) {
                    Some(req) => {
                        let name = &req.name[..(req.name_len as usize).min(req.name.len())];
                        self.store.unlink(name)
                    }
                    None => Status::Inval,
                };
                reply.extend_from_slice(
                    FsResultReply {
                        result: result.into(),
                    }
                    .as_bytes(),
                );
            }
            OP_INDIR => {
                let answer = match decode::<FsIndirReq>(payload) {
                    Some(req) => match self.store.indir(req.inode.get(), req.zone) {
                        Ok(sector) => FsIndirReply {
                            result: Status::Ok.into(),
                            sector: U16::new(sector),
                        },
                        Err(status) => FsIndirReply {
                            result: status.into(),
                            sector: U16::new(0),
                        },
                    },
                    None => FsIndirReply {
                        result: Status::Inval.into(),
                        sector: U16::new(0),
                    },
                };
                reply.extend_from_slice(answer.as_bytes());
            }
            OP_MKFS => {
                let result = self.store.mkfs();
                reply.extend_from_slice(
                    FsResultReply {
                        result: result.into(),
                    }
                    .as_bytes(),
                );
            }
            OP_SECTOR => {
                // Relayed to the card driver; the reply goes out when the
                // card answers.
                if self.relay_sector(ctx, peer, payload) {
                    return;
                }
                reply.extend_from_slice(
                    FsSectorReply {
                        result: Status::Inval.into(),
                        len: 0,
                    }
                    .as_bytes(),
                );
            }
            _ => {
                // Filtered above.
                self.resubscribe(ctx);
                return;
            }
        }

        self.send_reply(ctx, peer, op, &reply);
    }

    /// Start the card job for an `OP_SECTOR` request. Returns `false` on a
    /// malformed request (the caller sends the error reply).
    fn relay_sector(&mut self, ctx: &mut Context<'_>, peer: u8, payload: &[u8]) -> bool {
        let head = size_of::<FsSectorReq>();
        let Some(req) = decode::<FsSectorReq>(payload) else {
            return false;
        };

        let job = if req.write != 0 {
            if payload.len() < head + req.len as usize {
                return false;
            }
            BlockJob::write(req.sector.get(), &payload[head..head + req.len as usize])
        } else {
            BlockJob::read(req.sector.get())
        };

        match ctx.submit(TASK_CARD, JobBody::Block(job)) {
            Ok(id) => {
                self.card_job = Some(id);
                self.sector = Some(SectorPending { peer, len: req.len });
                true
            }
            Err(_) => false,
        }
    }

    /// The card finished an `OP_SECTOR` relay; answer the remote node.
    fn finish_sector(&mut self, ctx: &mut Context<'_>, id: JobId, status: Status) {
        let Some(pending) = self.sector.take() else {
            ctx.jobs.take(id);
            return;
        };
        let body = ctx.jobs.take(id);

        let head_room = MAX_FRAME_PAYLOAD - size_of::<FsSectorReply>();
        let mut reply = Vec::new();
        let mut data = Vec::new();
        if status.is_ok()
            && let Some(JobBody::Block(job)) = body
        {
            let take = (pending.len as usize).min(head_room).min(job.data.len());
            data.extend_from_slice(&job.data[..take]);
        }
        reply.extend_from_slice(
            FsSectorReply {
                result: status.into(),
                len: data.len() as u8,
            }
            .as_bytes(),
        );
        reply.extend_from_slice(&data);
        self.send_reply(ctx, pending.peer, OP_SECTOR, &reply);
    }
}

impl Default for FsSecretary {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for FsSecretary {
    fn handle(&mut self, msg: &Message, ctx: &mut Context<'_>) -> Status {
        match msg.opcode {
            Opcode::Init => {
                if self.sub.is_none() {
                    self.resubscribe(ctx);
                }
                Status::Ok
            }
            Opcode::ReplyInfo => {
                let Payload::Info { status, job } = msg.payload else {
                    return Status::Inval;
                };

                if self.sub == Some(job) {
                    self.sub = None;
                    let Some(JobBody::Bus(request)) = ctx.jobs.take(job) else {
                        return Status::Ok;
                    };
                    if status.is_ok() {
                        self.handle_request(ctx, request.peer, request.op, &request.reply);
                    }
                    // A cancelled subscription stays down on purpose.
                } else if self.card_job == Some(job) {
                    self.card_job = None;
                    self.finish_sector(ctx, job, status);
                } else if self.reply_out == Some(job) {
                    self.reply_out = None;
                    ctx.jobs.take(job);
                    if !status.is_ok() {
                        warn!("store reply lost on the wire: {:?}", status);
                    }
                } else {
                    ctx.jobs.take(job);
                }
                Status::Ok
            }
            _ => Status::NoSys,
        }
    }
}

/// The request opcodes this secretary speaks.
fn is_store_op(op: u8) -> bool {
    matches!(
        op,
        OP_MKNOD
            | OP_READ
            | OP_WRITE
            | OP_LINK
            | OP_UNLINK
            | OP_PATH
            | OP_INDIR
            | OP_MKFS
            | OP_SECTOR
    )
}

fn decode<T: FromBytes + Copy>(payload: &[u8]) -> Option<T> {
    let want = size_of::<T>();
    if payload.len() < want {
        return None;
    }
    T::read_from_bytes(&payload[..want]).ok()
}

fn inode_reply(status: Status, ino: u16) -> FsInodeReply {
    FsInodeReply {
        result: status.into(),
        inode: U16::new(ino),
    }
}

fn read_error(status: Status) -> FsReadReply {
    FsReadReply {
        result: status.into(),
        new_pos: U32::new(0),
        len: 0,
    }
}
