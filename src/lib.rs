//! A userland SCSI initiator for removable block devices.
//!
//! [`task::Dispatcher`] queues SCSI tasks, hands them to a [`transport::Transport`]
//! one after another, and collects sense data for the ones that fail.
//! [`device::ScsiDevice`] probes a logical unit through it and tracks the medium.
//! [`usb`] provides the bulk-only transport for USB mass storage devices.

pub mod config;
pub mod device;
pub mod error;
pub mod scsi;
pub mod task;
pub mod transport;
pub mod usb;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use device::{DeviceState, MediaEvent, PollingState, ScsiDevice};
pub use error::{CommandError, IoError, ProbeError};
pub use task::{Dispatcher, Task};
pub use transport::{Acceptance, Transport};
