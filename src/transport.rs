//! The boundary between the task dispatcher and whatever delivers commands to a
//! device.

use crate::task::{Completer, ServiceResponse, Task, TaskStatus};

/// What a transport did with a task it was offered.
pub enum Acceptance {
    /// The transport cannot take more work right now. The task goes back to the
    /// front of the queue and is offered again on the next submission or completion.
    Rejected(Task),
    /// The command already ran on the calling thread.
    Completed {
        task: Task,
        response: ServiceResponse,
        status: TaskStatus,
    },
    /// The transport kept the task and will hand it to the [`Completer`] later.
    Pending,
}

/// Delivers commands to a device.
///
/// `accept` runs the task's [`Task::active_command`] against [`Task::buffer_mut`],
/// records the byte count with [`Task::set_transferred`], and reports the service
/// response and status either in the return value or, for [`Acceptance::Pending`],
/// through `completer`, exactly once. A transport that reads sense data on its own
/// may attach it with [`Task::set_sense_data`].
///
/// A timed out command is reported as
/// [`ServiceResponse::ServiceDeliveryOrTargetFailure`].
pub trait Transport: Send + Sync {
    fn accept(&self, task: Task, completer: Completer) -> Acceptance;
}
