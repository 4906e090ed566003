//! Moves tasks from the [`CommandQueue`] to the transport and back to their callers.
//!
//! Tasks go out strictly in submission order. The two exceptions both use the
//! head of the queue: a task the transport turned away returns there, and so does
//! a task that needs its autosense REQUEST SENSE, which therefore runs before any
//! task submitted after it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, trace, warn};

use super::{CommandQueue, ExecutionMode, ServiceResponse, Task, TaskState, TaskStatus};
use crate::scsi::CommandSet;
use crate::scsi::sense::SENSE_DATA_LEN;
use crate::transport::{Acceptance, Transport};

struct Shared {
    queue: CommandQueue,
    transport: Arc<dyn Transport>,
    command_set: Arc<dyn CommandSet>,
    accepting: AtomicBool,
    /// Set while one thread runs the dispatch loop.
    draining: AtomicBool,
    /// Set by anyone who wants the dispatch loop to look at the queue again.
    rerun: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: usize,
    outstanding: AtomicUsize,
}

/// Holds the dispatcher alive for as long as a submitted task has not completed.
pub(crate) struct InFlight {
    shared: Arc<Shared>,
}

impl InFlight {
    fn acquire(shared: &Arc<Shared>) -> Self {
        shared.outstanding.fetch_add(1, Ordering::SeqCst);
        InFlight {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands an asynchronously accepted task back to the dispatcher.
///
/// Consumed on use, so each accepted task completes once.
pub struct Completer {
    dispatcher: Dispatcher,
}

impl Completer {
    pub fn complete(self, task: Task, response: ServiceResponse, status: TaskStatus) {
        self.dispatcher.completed(task, response, status);
    }
}

/// The task queue and its completion state machine. Cheap to clone.
///
/// Call [`Dispatcher::terminate`] before dropping the last handle: queued tasks
/// keep the dispatcher alive until they complete.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    /// `max_in_flight` bounds how many tasks the transport holds at once. With one,
    /// autosense follow-ups always run directly after the task they belong to.
    pub fn new(
        transport: Arc<dyn Transport>,
        command_set: Arc<dyn CommandSet>,
        max_in_flight: usize,
    ) -> Self {
        Dispatcher {
            shared: Arc::new(Shared {
                queue: CommandQueue::new(),
                transport,
                command_set,
                accepting: AtomicBool::new(true),
                draining: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                max_in_flight: max_in_flight.max(1),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn command_set(&self) -> &Arc<dyn CommandSet> {
        &self.shared.command_set
    }

    /// Queue a task. Its completion callback runs exactly once, possibly before
    /// `submit` returns.
    pub fn submit(&self, mut task: Task) {
        task.reset_for_submission();
        task.in_flight = Some(InFlight::acquire(&self.shared));
        if !self.is_accepting() {
            debug!(task = task.id, "not accepting service requests");
            self.finalize(
                task,
                ServiceResponse::ServiceDeliveryOrTargetFailure,
                TaskStatus::NoStatus,
            );
            return;
        }
        trace!(
            task = task.id,
            opcode = task.command.opcode(),
            attribute = ?task.attribute,
            "submitted"
        );
        self.shared.queue.enqueue_tail(task);
        self.drain_queue();
    }

    /// Complete every queued task with a delivery failure.
    pub fn reject_all(&self) {
        let tasks = self.shared.queue.drain_all();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "rejecting queued tasks");
        }
        for task in tasks {
            self.finalize(
                task,
                ServiceResponse::ServiceDeliveryOrTargetFailure,
                TaskStatus::NoStatus,
            );
        }
    }

    /// Stop accepting service requests and reject what is queued. Tasks the
    /// transport still holds fail when they come back.
    pub fn terminate(&self) {
        self.set_accepting(false);
        self.reject_all();
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Submitted tasks that have not completed yet.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    /// Run the dispatch loop unless another thread already is, in which case that
    /// thread makes one more pass.
    fn drain_queue(&self) {
        let shared = &self.shared;
        shared.rerun.store(true, Ordering::SeqCst);
        while shared.rerun.load(Ordering::SeqCst) {
            if shared.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            while shared.rerun.swap(false, Ordering::SeqCst) {
                self.dispatch_pass();
            }
            shared.draining.store(false, Ordering::SeqCst);
        }
    }

    fn dispatch_pass(&self) {
        let shared = &self.shared;
        loop {
            if !self.is_accepting()
                || shared.in_flight.load(Ordering::SeqCst) >= shared.max_in_flight
            {
                return;
            }
            let Some(mut task) = shared.queue.dequeue_head() else {
                return;
            };
            task.state = TaskState::Dispatched;
            trace!(task = task.id, mode = ?task.mode(), "dispatching");
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            let completer = Completer {
                dispatcher: self.clone(),
            };
            match shared.transport.accept(task, completer) {
                Acceptance::Rejected(task) => {
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    debug!(task = task.id, "transport busy, requeueing at head");
                    shared.queue.enqueue_head(task);
                    return;
                }
                Acceptance::Completed {
                    task,
                    response,
                    status,
                } => {
                    shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.conclude(task, response, status);
                }
                Acceptance::Pending => {}
            }
        }
    }

    fn completed(&self, task: Task, response: ServiceResponse, status: TaskStatus) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.conclude(task, response, status);
        self.drain_queue();
    }

    fn conclude(&self, mut task: Task, response: ServiceResponse, status: TaskStatus) {
        if !self.is_accepting() {
            debug!(task = task.id, "completed after service requests were disallowed");
            self.finalize(
                task,
                ServiceResponse::ServiceDeliveryOrTargetFailure,
                TaskStatus::NoStatus,
            );
            return;
        }
        match task.mode() {
            ExecutionMode::CommandExecution if task.needs_autosense(response, status) => {
                match self.shared.command_set.request_sense(SENSE_DATA_LEN) {
                    Ok(command) => {
                        debug!(task = task.id, "CHECK CONDITION, requesting sense");
                        task.begin_autosense(command, response, status);
                        self.shared.queue.enqueue_head(task);
                    }
                    Err(e) => {
                        warn!(task = task.id, error = %e, "cannot build REQUEST SENSE");
                        self.finalize(task, response, status);
                    }
                }
            }
            ExecutionMode::CommandExecution => self.finalize(task, response, status),
            ExecutionMode::Autosense => {
                let (response, status) = task.end_autosense(response, status);
                self.finalize(task, response, status);
            }
        }
    }

    fn finalize(&self, mut task: Task, response: ServiceResponse, status: TaskStatus) {
        task.state = TaskState::Ended;
        task.service_response = response;
        task.status = status;
        drop(task.in_flight.take());
        trace!(task = task.id, ?response, ?status, "ended");
        if let Some(completion) = task.completion.take() {
            completion(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::scsi::sense::{SenseData, SenseKey};
    use crate::scsi::{BlockCommands, command};
    use crate::test_support::{Reply, ScriptedTransport};

    fn dispatcher(transport: &Arc<ScriptedTransport>) -> Dispatcher {
        Dispatcher::new(transport.clone(), Arc::new(BlockCommands), 1)
    }

    /// Submit a task and record its id in `done` when it completes.
    fn submit(dispatcher: &Dispatcher, done: &Arc<Mutex<Vec<Task>>>) -> u64 {
        let done = done.clone();
        let task = Task::new(command::test_unit_ready()).on_complete(move |t| done.lock().push(t));
        let id = task.id();
        dispatcher.submit(task);
        id
    }

    fn not_ready() -> Vec<u8> {
        SenseData::new(SenseKey::NotReady, 0x3A, 0).to_fixed().to_vec()
    }

    fn autosense_script(first: u64) -> impl Fn(&Task) -> Reply + Send + Sync {
        move |task: &Task| match task.active_command().opcode() {
            0x03 => Reply::data(not_ready()),
            _ if task.id() == first => Reply::CheckCondition,
            _ => Reply::Good,
        }
    }

    async fn end_to_end(asynchronous: bool) {
        let first = Arc::new(Mutex::new(0));
        let script_first = first.clone();
        let transport = ScriptedTransport::new(asynchronous, move |task: &Task| {
            autosense_script(*script_first.lock())(task)
        });
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));

        // Hold the transport so all three tasks queue up first
        transport.set_rejecting(true);
        let a = submit(&dispatcher, &done);
        *first.lock() = a;
        let b = submit(&dispatcher, &done);
        let c = submit(&dispatcher, &done);
        assert_eq!(dispatcher.queued(), 3);
        assert_eq!(dispatcher.outstanding(), 3);
        transport.set_rejecting(false);
        dispatcher.drain_queue();
        transport.settle().await;

        assert_eq!(
            transport.dispatched(),
            vec![
                (a, ExecutionMode::CommandExecution),
                (a, ExecutionMode::Autosense),
                (b, ExecutionMode::CommandExecution),
                (c, ExecutionMode::CommandExecution),
            ]
        );
        let done = done.lock();
        assert_eq!(done.iter().map(Task::id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(done[0].status(), TaskStatus::CheckCondition);
        assert_eq!(done[0].mode(), ExecutionMode::CommandExecution);
        assert_eq!(
            done[0].sense_data().map(|s| s.additional_sense_code),
            Some(0x3A)
        );
        assert!(done[1].is_good() && done[2].is_good());
        assert!(done.iter().all(|t| t.state() == TaskState::Ended));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn autosense_runs_before_later_tasks_sync() {
        end_to_end(false).await;
    }

    #[tokio::test]
    async fn autosense_runs_before_later_tasks_async() {
        end_to_end(true).await;
    }

    #[tokio::test]
    async fn rejection_keeps_order() {
        let transport = ScriptedTransport::new(true, |_: &Task| Reply::Good);
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        transport.reject_next(1);
        let ids: Vec<_> = (0..4).map(|_| submit(&dispatcher, &done)).collect();
        // The first offer was turned away; the retry happens on the next submission
        transport.settle().await;
        assert_eq!(
            done.lock().iter().map(Task::id).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(transport.rejections(), 1);
    }

    #[tokio::test]
    async fn reject_all_completes_each_task_once() {
        let transport = ScriptedTransport::new(false, |_: &Task| Reply::Good);
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        transport.set_rejecting(true);
        for _ in 0..3 {
            submit(&dispatcher, &done);
        }
        dispatcher.reject_all();
        assert_eq!(dispatcher.queued(), 0);
        assert_eq!(dispatcher.outstanding(), 0);
        let done = done.lock();
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|t| {
            t.service_response() == ServiceResponse::ServiceDeliveryOrTargetFailure
                && t.status() == TaskStatus::NoStatus
        }));
        assert!(transport.dispatched().is_empty());
    }

    #[tokio::test]
    async fn terminated_dispatcher_fails_new_and_returning_tasks() {
        let transport = ScriptedTransport::new(true, |_: &Task| Reply::Good);
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        submit(&dispatcher, &done);
        // The first task is with the transport when the device goes away
        dispatcher.terminate();
        submit(&dispatcher, &done);
        transport.settle().await;
        let done = done.lock();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|t| !t.is_good()));
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(transport.dispatched().len(), 1);
    }

    #[tokio::test]
    async fn sense_from_the_transport_skips_request_sense() {
        let transport = ScriptedTransport::new(false, |_: &Task| {
            Reply::CheckConditionWithSense(not_ready())
        });
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        submit(&dispatcher, &done);
        assert_eq!(transport.dispatched().len(), 1);
        assert_eq!(
            done.lock()[0].sense_data().map(|s| s.sense_key),
            Some(SenseKey::NotReady)
        );
    }

    #[tokio::test]
    async fn autosense_can_be_declined() {
        let transport = ScriptedTransport::new(false, |_: &Task| Reply::CheckCondition);
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        let inner = done.clone();
        dispatcher.submit(
            Task::new(command::test_unit_ready())
                .with_autosense(false)
                .on_complete(move |t| inner.lock().push(t)),
        );
        assert_eq!(transport.dispatched().len(), 1);
        assert_eq!(done.lock()[0].status(), TaskStatus::CheckCondition);
        assert!(done.lock()[0].sense_bytes().is_none());
    }

    #[tokio::test]
    async fn completion_can_submit_more_work() {
        let transport = ScriptedTransport::new(false, |_: &Task| Reply::Good);
        let dispatcher = dispatcher(&transport);
        let done = Arc::new(Mutex::new(Vec::new()));
        let (inner_dispatcher, inner_done) = (dispatcher.clone(), done.clone());
        dispatcher.submit(Task::new(command::test_unit_ready()).on_complete(move |t| {
            inner_done.lock().push(t);
            submit(&inner_dispatcher, &inner_done);
        }));
        assert_eq!(done.lock().len(), 2);
        assert_eq!(dispatcher.outstanding(), 0);
    }
}
