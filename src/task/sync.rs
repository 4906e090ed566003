//! Waiting on a single task.

use tokio::sync::oneshot;

use super::{Dispatcher, Task};
use crate::error::CommandError;

impl Dispatcher {
    /// Submit `task` and wait for it to complete, returning the finished task.
    ///
    /// The task's own completion callback is replaced. Only fails if the transport
    /// drops the task without completing it.
    pub async fn execute(&self, task: Task) -> Result<Task, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.submit(task.on_complete(move |task| {
            // The receiver only goes away if the waiting future was dropped
            let _ = tx.send(task);
        }));
        rx.await.map_err(|_| CommandError::Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::scsi::{BlockCommands, command};
    use crate::task::{Completer, ServiceResponse, TaskStatus};
    use crate::test_support::{Reply, ScriptedTransport};
    use crate::transport::{Acceptance, Transport};

    #[tokio::test]
    async fn waits_for_asynchronous_completion() {
        let transport = ScriptedTransport::new(true, |_: &Task| Reply::data(vec![0, 0x80, 2]));
        let dispatcher = Dispatcher::new(transport.clone(), Arc::new(BlockCommands), 1);
        let task = dispatcher.execute(Task::new(command::inquiry(36))).await.unwrap();
        assert!(task.is_good());
        assert_eq!(task.data(), &[0, 0x80, 2]);
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn reports_failures_as_finished_tasks() {
        let transport = ScriptedTransport::new(false, |_: &Task| Reply::Failure);
        let dispatcher = Dispatcher::new(transport, Arc::new(BlockCommands), 1);
        let task = dispatcher
            .execute(Task::new(command::test_unit_ready()))
            .await
            .unwrap();
        assert_eq!(
            task.service_response(),
            ServiceResponse::ServiceDeliveryOrTargetFailure
        );
        assert_eq!(task.status(), TaskStatus::NoStatus);
    }

    struct Losing;

    impl Transport for Losing {
        fn accept(&self, task: Task, completer: Completer) -> Acceptance {
            drop((task, completer));
            Acceptance::Pending
        }
    }

    #[tokio::test]
    async fn dropped_task_is_abandoned() {
        let dispatcher = Dispatcher::new(Arc::new(Losing), Arc::new(BlockCommands), 1);
        let result = dispatcher.execute(Task::new(command::test_unit_ready())).await;
        assert!(matches!(result, Err(CommandError::Abandoned)));
    }
}
