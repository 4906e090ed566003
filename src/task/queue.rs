//! The ordered set of tasks waiting for the transport.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{Task, TaskState};

/// Pending tasks, oldest first.
///
/// The lock is only held while the deque is touched. Never call into a transport
/// with it held: a synchronous transport completes on the calling thread and the
/// completion path takes the lock again.
#[derive(Default)]
pub struct CommandQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append behind everything already waiting.
    pub fn enqueue_tail(&self, mut task: Task) {
        task.state = TaskState::Queued;
        self.tasks.lock().push_back(task);
    }

    /// Put a task in front of everything else. Only for tasks the transport
    /// turned away and for autosense follow-ups.
    pub fn enqueue_head(&self, mut task: Task) {
        task.state = TaskState::Queued;
        self.tasks.lock().push_front(task);
    }

    pub fn dequeue_head(&self) -> Option<Task> {
        self.tasks.lock().pop_front()
    }

    /// Empty the queue, returning its tasks in order.
    pub fn drain_all(&self) -> Vec<Task> {
        self.tasks.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
