//! Storage-card driver tests: init handshake, deferral, media change,
//! write protect, absent card.

use heron_abi::{
    IOCTL_CARD_WRITE_PROTECT, JobId, Message, Opcode, Payload, SECTOR_LEN, Status, TASK_CARD,
    TASK_CLOCK, TaskId,
};
use heron_kernel::bus::Wire;
use heron_kernel::clock::ClockTask;
use heron_kernel::devices::block::{self, BlockJob, CardHw, CardIsr, CardTask};
use heron_kernel::job::JobBody;
use heron_kernel::node::bring_up;
use heron_kernel::scheduler::Kernel;
use heron_kernel::testing::{Probe, drain, submit};

const PROBE: TaskId = TaskId(14);

fn reply_for(messages: &[Message], id: JobId) -> Option<Status> {
    messages.iter().find_map(|m| match m.payload {
        Payload::Info { status, job } if job == id => Some(status),
        _ => None,
    })
}

/// A bare kernel with just clock, card and probe — the card has NOT been
/// initialized yet.
fn cold_card_kernel() -> (
    Kernel,
    std::sync::Arc<spinning_top::Spinlock<CardHw>>,
    std::sync::Arc<spinning_top::Spinlock<Vec<Message>>>,
) {
    let mut kernel = Kernel::new();
    kernel.register(TASK_CLOCK, Box::new(ClockTask::new()));
    let card = CardHw::new();
    kernel.register(TASK_CARD, Box::new(CardTask::new(card.clone())));
    kernel.attach_isr(Box::new(CardIsr::new(card.clone(), TASK_CARD)));
    let (probe, inbox) = Probe::new();
    kernel.register(PROBE, Box::new(probe));
    (kernel, card, inbox)
}

/// The first job triggers the four-phase handshake; the job is deferred
/// until `InitOk` and then completes.
#[test]
fn test_first_job_runs_the_handshake() {
    let (mut kernel, _card, inbox) = cold_card_kernel();

    let id = submit(
        &mut kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::write(3, b"hello card")),
    );

    // Four handshake phases at 1 ms each; the transfer cannot have
    // finished after 3 ms.
    kernel.advance(3);
    assert_eq!(reply_for(&drain(&inbox), id), None, "job ran before init");

    kernel.advance(4);
    assert_eq!(reply_for(&drain(&inbox), id), Some(Status::Ok));
    kernel.jobs_mut().take(id);
}

/// Reads return what writes stored, whole sectors at a time.
#[test]
fn test_write_then_read_sector() {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));

    let write = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::write(7, b"sector payload")),
    );
    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(7)),
    );
    node.kernel.advance(4);

    let received = drain(&inbox);
    assert_eq!(reply_for(&received, write), Some(Status::Ok));
    assert_eq!(reply_for(&received, read), Some(Status::Ok));
    node.kernel.jobs_mut().take(write);

    let Some(JobBody::Block(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(job.data.len(), SECTOR_LEN);
    assert_eq!(&job.data[..14], b"sector payload");
    assert_eq!(&block::sector(&node.card, 7)[..14], b"sector payload");
}

/// `MediaChange` invalidates the init flag; the next job re-runs the
/// handshake before transferring, and data written before the change is
/// still there (same card back in the slot).
#[test]
fn test_media_change_forces_reinit() {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));

    let write = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::write(1, b"before")),
    );
    node.kernel.advance(3);
    node.kernel.jobs_mut().take(write);
    drain(&inbox);

    node.kernel
        .post(Message::notify(TaskId::NONE, TASK_CARD, Opcode::MediaChange));
    node.kernel.run_until_idle();

    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(1)),
    );
    // Handshake (4 ms) plus transfer: no answer in the first 3 ms.
    node.kernel.advance(3);
    assert_eq!(reply_for(&drain(&inbox), read), None);
    node.kernel.advance(4);
    assert_eq!(reply_for(&drain(&inbox), read), Some(Status::Ok));
    let Some(JobBody::Block(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(&job.data[..6], b"before");
}

/// With no card in the slot the handshake fails and every queued job is
/// answered `ENODEV`.
#[test]
fn test_absent_card_is_nodev() {
    let (mut kernel, card, inbox) = cold_card_kernel();
    block::set_present(&card, false);

    let first = submit(
        &mut kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(0)),
    );
    let second = submit(
        &mut kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(1)),
    );
    kernel.advance(3);

    let received = drain(&inbox);
    assert_eq!(reply_for(&received, first), Some(Status::NoDev));
    assert_eq!(reply_for(&received, second), Some(Status::NoDev));
    kernel.jobs_mut().take(first);
    kernel.jobs_mut().take(second);
}

/// Write-protect refuses writes with `EACCES` but leaves reads alone.
#[test]
fn test_write_protect() {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));

    node.kernel.post(Message::set_ioctl(
        PROBE,
        TASK_CARD,
        IOCTL_CARD_WRITE_PROTECT,
        1,
    ));
    node.kernel.run_until_idle();
    drain(&inbox);

    let write = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::write(0, b"nope")),
    );
    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(0)),
    );
    node.kernel.advance(4);

    let received = drain(&inbox);
    assert_eq!(reply_for(&received, write), Some(Status::Access));
    assert_eq!(reply_for(&received, read), Some(Status::Ok));
    node.kernel.jobs_mut().take(write);
    node.kernel.jobs_mut().take(read);
}

/// Sector numbers off the card are rejected.
#[test]
fn test_sector_out_of_range() {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));

    let id = submit(
        &mut node.kernel,
        PROBE,
        TASK_CARD,
        JobBody::Block(BlockJob::read(4096)),
    );
    node.kernel.advance(2);
    assert_eq!(reply_for(&drain(&inbox), id), Some(Status::Inval));
    node.kernel.jobs_mut().take(id);
}
