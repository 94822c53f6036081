//! DAC driver tests: write/read-back, output latching, EEPROM programming.

use heron_abi::{JobId, Message, Payload, Status, TASK_DAC, TaskId};
use heron_kernel::bus::Wire;
use heron_kernel::devices::dac::{self, DacJob};
use heron_kernel::job::JobBody;
use heron_kernel::node::{Node, bring_up};
use heron_kernel::testing::{Probe, drain, submit};

const PROBE: TaskId = TaskId(14);

fn node_with_probe() -> (Node, std::sync::Arc<spinning_top::Spinlock<Vec<Message>>>) {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));
    (node, inbox)
}

fn reply_for(messages: &[Message], id: JobId) -> Option<Status> {
    messages.iter().find_map(|m| match m.payload {
        Payload::Info { status, job } if job == id => Some(status),
        _ => None,
    })
}

/// SC2: write channel 0, then read it back — the read reply carries the
/// value just written.
#[test]
fn test_write_then_read_back() {
    let (mut node, inbox) = node_with_probe();

    let write = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob::write(0, 2048, 0, 1, 0)),
    );
    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob::read(0)),
    );
    node.kernel.advance(4);

    let received = drain(&inbox);
    assert_eq!(reply_for(&received, write), Some(Status::Ok));
    assert_eq!(reply_for(&received, read), Some(Status::Ok));
    node.kernel.jobs_mut().take(write);

    let Some(JobBody::Dac(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(job.value, 2048);
    assert_eq!(job.reference, 1);
    assert_eq!(dac::output(&node.dac, 0), 2048);
}

/// With the update inhibited, the input register takes the value but the
/// output pin does not move.
#[test]
fn test_inhibit_update_holds_output() {
    let (mut node, inbox) = node_with_probe();

    let latch = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob::write(1, 100, 0, 0, 0)),
    );
    node.kernel.advance(2);
    node.kernel.jobs_mut().take(latch);

    let staged = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob {
            inhibit_update: true,
            ..DacJob::write(1, 3000, 0, 0, 0)
        }),
    );
    node.kernel.advance(2);
    drain(&inbox);
    node.kernel.jobs_mut().take(staged);

    assert_eq!(dac::output(&node.dac, 1), 100);

    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob::read(1)),
    );
    node.kernel.advance(2);
    assert_eq!(reply_for(&drain(&inbox), read), Some(Status::Ok));
    let Some(JobBody::Dac(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(job.value, 3000, "input register should hold the staged value");
}

/// EEPROM writes hold the busy pin: the reply only arrives after the
/// program cycle, and the image reads back what was written.
#[test]
fn test_eeprom_program_cycle() {
    let (mut node, inbox) = node_with_probe();

    let program = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob {
            access_eeprom: true,
            ..DacJob::write(2, 1234, 1, 1, 0)
        }),
    );

    // Transfer takes 1 ms, programming 5 more; no reply after 3.
    node.kernel.advance(3);
    assert_eq!(reply_for(&drain(&inbox), program), None);

    node.kernel.advance(5);
    assert_eq!(reply_for(&drain(&inbox), program), Some(Status::Ok));
    node.kernel.jobs_mut().take(program);

    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob {
            access_eeprom: true,
            ..DacJob::read(2)
        }),
    );
    node.kernel.advance(2);
    drain(&inbox);
    let Some(JobBody::Dac(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(job.value, 1234);
    assert_eq!(job.gain, 1);
}

/// A channel number off the part is rejected.
#[test]
fn test_invalid_channel() {
    let (mut node, inbox) = node_with_probe();
    let id = submit(
        &mut node.kernel,
        PROBE,
        TASK_DAC,
        JobBody::Dac(DacJob::write(7, 1, 0, 0, 0)),
    );
    node.kernel.advance(2);
    assert_eq!(reply_for(&drain(&inbox), id), Some(Status::Inval));
    node.kernel.jobs_mut().take(id);
}
