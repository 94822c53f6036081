//! NVRAM driver tests: calibration persistence and the boot switch.

use heron_abi::{JobId, Message, Payload, Status, TASK_NVRAM, TaskId};
use heron_kernel::bus::Wire;
use heron_kernel::devices::nvram::{self, NvramJob};
use heron_kernel::job::JobBody;
use heron_kernel::node::bring_up;
use heron_kernel::testing::{Probe, drain, submit};

const PROBE: TaskId = TaskId(14);

fn reply_for(messages: &[Message], id: JobId) -> Option<Status> {
    messages.iter().find_map(|m| match m.payload {
        Payload::Info { status, job } if job == id => Some(status),
        _ => None,
    })
}

/// Calibration writes read back, and the boot switch reflects what the
/// hardware was preloaded with.
#[test]
fn test_calibration_round_trip() {
    let mut node = bring_up(0x21, &Wire::new());
    let (probe, inbox) = Probe::new();
    node.kernel.register(PROBE, Box::new(probe));
    nvram::preload(&node.nvram, 0, 1);

    let write = submit(
        &mut node.kernel,
        PROBE,
        TASK_NVRAM,
        JobBody::Nvram(NvramJob::write_calibration(0x00C0FFEE)),
    );
    let read = submit(
        &mut node.kernel,
        PROBE,
        TASK_NVRAM,
        JobBody::Nvram(NvramJob::read_calibration()),
    );
    let boot = submit(
        &mut node.kernel,
        PROBE,
        TASK_NVRAM,
        JobBody::Nvram(NvramJob::read_boot_switch()),
    );
    node.kernel.run_until_idle();

    let received = drain(&inbox);
    assert_eq!(reply_for(&received, write), Some(Status::Ok));
    assert_eq!(reply_for(&received, read), Some(Status::Ok));
    assert_eq!(reply_for(&received, boot), Some(Status::Ok));
    node.kernel.jobs_mut().take(write);

    let Some(JobBody::Nvram(job)) = node.kernel.jobs_mut().take(read) else {
        panic!("job record gone");
    };
    assert_eq!(job.value, 0x00C0FFEE);

    let Some(JobBody::Nvram(job)) = node.kernel.jobs_mut().take(boot) else {
        panic!("job record gone");
    };
    assert_eq!(job.value, 1);
}
