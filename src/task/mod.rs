//! SCSI tasks and the machinery that moves them to a transport.
//!
//! A [`Task`] is one command in flight. It is owned by the caller until
//! [`Dispatcher::submit`], shared between the [`CommandQueue`] and the transport
//! while it is outstanding, and handed back through its completion callback exactly
//! once.

pub mod dispatcher;
pub mod queue;
mod sync;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use dispatcher::{Completer, Dispatcher};
pub use queue::CommandQueue;

use crate::scsi::{CommandBlock, DataDirection, SenseData};
use dispatcher::InFlight;

/// Default timeout for commands that do not say otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique, increasing task identifier. Only used for tracing and tests.
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Whether the transport should run the task's own command or its autosense
/// REQUEST SENSE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    CommandExecution,
    Autosense,
}

/// SAM-2 task attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TaskAttribute {
    #[default]
    Simple,
    Ordered,
    HeadOfQueue,
    Aca,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Enabled,
    Queued,
    Dispatched,
    Ended,
}

/// SAM-2 5.1 service response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceResponse {
    /// Not delivered yet.
    Pending,
    TaskComplete,
    ServiceDeliveryOrTargetFailure,
    FunctionComplete,
    FunctionRejected,
}

/// SAM-2 5.3.1 status codes, plus `NoStatus` for tasks that never reached the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Good,
    CheckCondition,
    ConditionMet,
    Busy,
    ReservationConflict,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    NoStatus,
}

impl TaskStatus {
    pub fn from_u8(n: u8) -> Self {
        match n {
            0x00 => TaskStatus::Good,
            0x02 => TaskStatus::CheckCondition,
            0x04 => TaskStatus::ConditionMet,
            0x08 => TaskStatus::Busy,
            0x18 => TaskStatus::ReservationConflict,
            0x28 => TaskStatus::TaskSetFull,
            0x30 => TaskStatus::AcaActive,
            0x40 => TaskStatus::TaskAborted,
            _ => TaskStatus::NoStatus,
        }
    }
}

pub type CompletionFn = Box<dyn FnOnce(Task) + Send>;

/// The follow-up REQUEST SENSE of a task that ended with CHECK CONDITION, together
/// with the result of the command it explains.
struct Autosense {
    command: CommandBlock,
    buffer: Vec<u8>,
    transferred: usize,
    stashed_response: ServiceResponse,
    stashed_status: TaskStatus,
}

pub struct Task {
    id: TaskId,
    command: CommandBlock,
    data: Vec<u8>,
    transferred: usize,
    attribute: TaskAttribute,
    state: TaskState,
    service_response: ServiceResponse,
    status: TaskStatus,
    timeout: Duration,
    autosense_requested: bool,
    sense: Option<Vec<u8>>,
    autosense: Option<Autosense>,
    application_ref: Option<Box<dyn Any + Send>>,
    completion: Option<CompletionFn>,
    in_flight: Option<InFlight>,
}

impl Task {
    /// A task for `command`. Data-in commands get a zeroed buffer sized to their
    /// transfer length; data-out commands need [`Task::with_data_out`].
    pub fn new(command: CommandBlock) -> Self {
        let data = match command.direction {
            DataDirection::DataIn => vec![0; command.data_transfer_len as usize],
            _ => Vec::new(),
        };
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            command,
            data,
            transferred: 0,
            attribute: TaskAttribute::Simple,
            state: TaskState::Enabled,
            service_response: ServiceResponse::Pending,
            status: TaskStatus::NoStatus,
            timeout: DEFAULT_TIMEOUT,
            autosense_requested: true,
            sense: None,
            autosense: None,
            application_ref: None,
            completion: None,
            in_flight: None,
        }
    }

    pub fn with_data_out(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_attribute(mut self, attribute: TaskAttribute) -> Self {
        self.attribute = attribute;
        self
    }

    /// Whether a CHECK CONDITION should be followed by REQUEST SENSE. On by default.
    pub fn with_autosense(mut self, requested: bool) -> Self {
        self.autosense_requested = requested;
        self
    }

    /// Attach an opaque value the caller gets back on completion.
    pub fn with_application_ref(mut self, value: Box<dyn Any + Send>) -> Self {
        self.application_ref = Some(value);
        self
    }

    /// Called with the finished task. Replaces any earlier callback.
    pub fn on_complete(mut self, f: impl FnOnce(Task) + Send + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn command(&self) -> &CommandBlock {
        &self.command
    }

    pub fn attribute(&self) -> TaskAttribute {
        self.attribute
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.autosense.is_some() {
            ExecutionMode::Autosense
        } else {
            ExecutionMode::CommandExecution
        }
    }

    pub fn service_response(&self) -> ServiceResponse {
        self.service_response
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Task complete with GOOD status.
    pub fn is_good(&self) -> bool {
        self.service_response == ServiceResponse::TaskComplete && self.status == TaskStatus::Good
    }

    /// Bytes moved in the data phase of the task's own command.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// The data-in bytes actually received, or the data-out payload.
    pub fn data(&self) -> &[u8] {
        match self.command.direction {
            DataDirection::DataIn => &self.data[..self.transferred.min(self.data.len())],
            _ => &self.data,
        }
    }

    pub fn into_data(mut self) -> Vec<u8> {
        if self.command.direction == DataDirection::DataIn {
            self.data.truncate(self.transferred);
        }
        std::mem::take(&mut self.data)
    }

    /// Raw sense bytes, when the command ended in CHECK CONDITION and sense was fetched.
    pub fn sense_bytes(&self) -> Option<&[u8]> {
        self.sense.as_deref()
    }

    pub fn sense_data(&self) -> Option<SenseData> {
        self.sense.as_deref().and_then(SenseData::parse)
    }

    pub fn take_application_ref(&mut self) -> Option<Box<dyn Any + Send>> {
        self.application_ref.take()
    }

    // Transport side.

    /// The command the transport should run right now.
    pub fn active_command(&self) -> &CommandBlock {
        match &self.autosense {
            Some(autosense) => &autosense.command,
            None => &self.command,
        }
    }

    /// Data buffer of the active command: the sense buffer during autosense.
    pub fn buffer(&self) -> &[u8] {
        match &self.autosense {
            Some(autosense) => &autosense.buffer,
            None => &self.data,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.autosense {
            Some(autosense) => &mut autosense.buffer,
            None => &mut self.data,
        }
    }

    /// Record how many bytes the active command moved.
    pub fn set_transferred(&mut self, len: usize) {
        let len = len.min(self.buffer().len());
        match &mut self.autosense {
            Some(autosense) => autosense.transferred = len,
            None => self.transferred = len,
        }
    }

    /// Transports that collect sense data themselves hand it over here, which
    /// makes a separate REQUEST SENSE unnecessary.
    pub fn set_sense_data(&mut self, sense: &[u8]) {
        self.sense = Some(sense.to_vec());
    }

    // Dispatcher side.

    fn needs_autosense(&self, response: ServiceResponse, status: TaskStatus) -> bool {
        response == ServiceResponse::TaskComplete
            && status == TaskStatus::CheckCondition
            && self.autosense_requested
            && self.autosense.is_none()
            && self.sense.is_none()
    }

    fn begin_autosense(
        &mut self,
        command: CommandBlock,
        response: ServiceResponse,
        status: TaskStatus,
    ) {
        let buffer = vec![0; command.data_transfer_len as usize];
        self.autosense = Some(Autosense {
            command,
            buffer,
            transferred: 0,
            stashed_response: response,
            stashed_status: status,
        });
    }

    /// Leave autosense mode, keeping the sense bytes if REQUEST SENSE worked, and
    /// return the result of the original command.
    fn end_autosense(
        &mut self,
        response: ServiceResponse,
        status: TaskStatus,
    ) -> (ServiceResponse, TaskStatus) {
        match self.autosense.take() {
            Some(mut autosense) => {
                if response == ServiceResponse::TaskComplete
                    && status == TaskStatus::Good
                    && autosense.transferred > 0
                {
                    autosense.buffer.truncate(autosense.transferred);
                    self.sense = Some(autosense.buffer);
                }
                (autosense.stashed_response, autosense.stashed_status)
            }
            None => (response, status),
        }
    }

    /// Back to a freshly submitted task.
    fn reset_for_submission(&mut self) {
        self.state = TaskState::Enabled;
        self.autosense = None;
        self.sense = None;
        self.transferred = 0;
        self.service_response = ServiceResponse::Pending;
        self.status = TaskStatus::NoStatus;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("mode", &self.mode())
            .field("state", &self.state)
            .field("service_response", &self.service_response)
            .field("status", &self.status)
            .field("transferred", &self.transferred)
            .finish_non_exhaustive()
    }
}
