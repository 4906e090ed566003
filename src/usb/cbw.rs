//! The bulk-only transport wrappers around a SCSI command: the command block
//! wrapper sent before it, and the command status wrapper read back after it.

use color_eyre::Result;
use color_eyre::eyre::ensure;

use crate::scsi::{CDB_SIZE, CommandBlock, DataDirection};

/// Signature that identifies a packet as a CBW.
///
/// This packet contains the below magic number (little endian).
///
/// See USB Mass Storage Class - Bulk Only Transport, section 5
const CBW_SIGNATURE: u32 = 0x43425355;
/// Signature that identifies a packet as a CSW.
///
/// The packet will start with the below magic number (little endian).
const CSW_SIGNATURE: u32 = 0x53425355;

/// A command block wrapper is *always* 31 bytes in size
const CBW_SIZE: usize = 31;
/// A command status wrapper is *always* 13 bytes in size
pub const CSW_SIZE: usize = 13;

/// `bmCBWFlags`. Bit 7 is the direction, every other bit is reserved.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CBWDirection {
    /// Data-Out: from host to the device
    DataOut = 0x00,
    /// Data-In: from the device to the host
    DataIn = 0x80,
}

impl From<DataDirection> for CBWDirection {
    fn from(direction: DataDirection) -> Self {
        match direction {
            DataDirection::DataIn => CBWDirection::DataIn,
            // "the device shall ignore the value of the Direction bit" when there
            // is no data, so Data-Out is as good as anything
            DataDirection::DataOut | DataDirection::NonDirectional => CBWDirection::DataOut,
        }
    }
}

/// The CBW wraps an SCSI command.
///
/// The CBW is always exactly 31 bytes in size, and in little endian format.
///
/// Spec info can be found in the USB Mass Storage Class - Bulk Only Transport document,
/// section 5.1.
#[repr(C, packed)]
pub struct CommandBlockWrapper {
    /// `dCBWSignature`, always [`CBW_SIGNATURE`].
    signature: [u8; 4],
    /// `dCBWTag` - "The device shall echo the contents of this field back to the
    /// host in the dCSWTag field of the associated CSW."
    tag: [u8; 4],
    /// `dCBWDataTransferLength` - "If this field is zero, the device and the host
    /// shall transfer no data between the CBW and associated CSW, and the device
    /// shall ignore the value of the *Direction* bit in *bmCBWFlags*."
    data_transfer_length: [u8; 4],
    /// `bmCBWFlags`
    direction: CBWDirection,
    /// `bCBWLUN`
    lun: u8,
    /// `bCBWCBLength` - "The only legal values are 1 through 16 (01h through 10h)."
    command_block_length: u8,
    /// `CBWCB` - "The device shall ignore the content of *CBWCB* field past the
    /// offset (15 + *bCBWCBLength* - 1)."
    command: [u8; CDB_SIZE],
}

impl CommandBlockWrapper {
    pub fn new(command: &CommandBlock, tag: u32, lun: u8) -> Self {
        Self {
            signature: CBW_SIGNATURE.to_le_bytes(),
            tag: tag.to_le_bytes(),
            data_transfer_length: command.data_transfer_len.to_le_bytes(),
            direction: command.direction.into(),
            lun,
            command_block_length: command.len() as u8,
            command: command.get(),
        }
    }

    /// Returns a slice containing the entirety of `self` that is exactly [`CBW_SIZE`] bytes in length
    pub fn as_slice(&self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<CommandBlockWrapper>() == CBW_SIZE,
                "CommandBlockWrapper not 31 bytes in size"
            );
        };
        // SAFETY: the struct is packed, contains only bytes, and the const
        // assertion above pins its size.
        unsafe {
            let ptr = self as *const CommandBlockWrapper as *const u8;
            std::slice::from_raw_parts(ptr, CBW_SIZE)
        }
    }
}

/// `bCSWStatus`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandStatus {
    /// "Command Passed ("good status")"
    Passed,
    /// "Command Failed"
    Failed,
    /// "Phase Error". The host must perform reset recovery.
    PhaseError,
}

/// The status of a command block, as read back from the device (section 5.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandStatusWrapper {
    /// `dCSWTag`, the tag of the CBW this answers.
    pub tag: u32,
    /// `dCSWDataResidue` - "the difference between the amount of data expected as
    /// stated in the *dCBWDataTransferLength* and the actual amount of relevant
    /// data" processed or sent by the device.
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl CommandStatusWrapper {
    /// Parse a CSW, validating its size, signature and status byte.
    pub fn parse(buf: &[u8]) -> Result<CommandStatusWrapper> {
        ensure!(
            buf.len() == CSW_SIZE,
            "a command status wrapper is {CSW_SIZE} bytes, got {}",
            buf.len()
        );
        let field = |offset: usize| {
            u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
        };
        let signature = field(0);
        ensure!(
            signature == CSW_SIGNATURE,
            "invalid magic number for command status wrapper, should be 0x53425355, is 0x{signature:X}"
        );
        let status = match buf[12] {
            0 => CommandStatus::Passed,
            1 => CommandStatus::Failed,
            2 => CommandStatus::PhaseError,
            other => color_eyre::eyre::bail!(
                "the command status field is invalid, should be in 0..=2, was {other}"
            ),
        };
        Ok(CommandStatusWrapper {
            tag: field(4),
            data_residue: field(8),
            status,
        })
    }
}

/// Used for generating unique-ish command block tags.
pub struct TagGenerator(u32);

impl TagGenerator {
    pub fn new() -> TagGenerator {
        // Distinct from the zeroes around it in a capture
        Self(123)
    }

    /// Returns a u32 that's different from the previously returned value.
    pub fn tag(&mut self) -> u32 {
        let output = self.0;
        self.0 = self.0.wrapping_add(1);
        output
    }
}
