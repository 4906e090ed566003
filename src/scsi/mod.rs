//! SCSI protocol and format implementation as described in:
//! - SCSI Primary Commands – 2 (SPC-2):
//!   <https://www.rockbox.org/wiki/pub/Main/DataSheets/spc2r20.pdf>
//!   This is an older version of the SCSI specification.
//!   It has enough information to describe almost every command we need to know,
//!   except for some information specific to block devices, which is described in the next SCSI
//!   specification linked below.
//! - SCSI Block Commands – 2 (SBC-2)
//!   <https://raw.githubusercontent.com/carmark/papers/master/storage/scsi/sbc2r16.pdf>
//!   This is an older version of the SCSI block commands specification. It contains information
//!   about commands specific to block devices.

pub mod command;
mod command_descriptor;
pub mod command_set;
pub mod response;
pub mod sense;

pub use command::{CommandBlock, DataDirection};
pub use command_descriptor::OpCode;
pub use command_set::{BlockCommands, CommandSet, ReducedBlockCommands};
pub use sense::{Outcome, SenseData, SenseKey, classify};

/// Command blocks are at most 16 bytes, SPC-2 4.3.2 table 4
pub const CDB_SIZE: usize = 16;
