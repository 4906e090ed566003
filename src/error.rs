//! Error types surfaced by the library.
//!
//! Failed tasks are not errors: a task always completes, carrying its service
//! response and status. These types cover the calls layered on top of tasks.

use thiserror::Error;

use crate::task::{ServiceResponse, TaskStatus};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0} is not supported by this command set")]
    Unsupported(&'static str),
    #[error("invalid parameter for {command}: {reason}")]
    InvalidParameter {
        command: &'static str,
        reason: String,
    },
    #[error("task was dropped without completing")]
    Abandoned,
    #[error("command 0x{opcode:02x} failed: {response:?} / {status:?}")]
    Failed {
        opcode: u8,
        response: ServiceResponse,
        status: TaskStatus,
    },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("logical unit does not exist")]
    LogicalUnitNotPresent,
    #[error("INQUIRY did not succeed after {attempts} attempts")]
    InquiryFailed { attempts: u32 },
    #[error("device was torn down during the probe")]
    Terminated,
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error("no medium present")]
    NoMedia,
    #[error("medium is write protected")]
    WriteProtected,
    #[error("blocks {lba}..{end} are outside the medium ({block_count} blocks)")]
    OutOfRange { lba: u64, end: u64, block_count: u64 },
    #[error("buffer of {len} bytes is not a whole number of {block_size} byte blocks")]
    Unaligned { len: usize, block_size: u32 },
    #[error(transparent)]
    Command(#[from] CommandError),
}
