//! Representations for SCSI commands.
//!
//! This module uses the term "command descriptor" to describe a struct and implementation specific
//! details behind a CDB, and uses the term "command block" to describe a "black box" containing
//! a valid CDB.
//!
//! Commands are exposed as a function that returns a [`CommandBlock`]. These functions wrap
//! the more granular [`X6CommandDescriptor`], [`X10CommandDescriptor`] and
//! [`X16CommandDescriptor`] structs.

use super::CDB_SIZE;
use super::command_descriptor::*;

/// Page code of the caching mode page (SBC-2 6.3.3).
pub const CACHING_MODE_PAGE: u8 = 0x08;
/// Page code requesting every supported mode page.
pub const ALL_MODE_PAGES: u8 = 0x3F;

/// Which way data moves during the data phase of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDirection {
    /// Data-In: from the device to the host
    DataIn,
    /// Data-Out: from host to the device
    DataOut,
    /// For commands with a data transfer length of zero.
    NonDirectional,
}

/// A serialized command block ready to be submitted
#[derive(Clone, PartialEq, Eq)]
pub struct CommandBlock {
    command: [u8; CDB_SIZE],
    len: u8,
    pub direction: DataDirection,
    pub data_transfer_len: u32,
}

impl CommandBlock {
    fn new<D: CommandDescriptor>(
        descriptor: D,
        direction: DataDirection,
        data_transfer_len: u32,
    ) -> Self {
        let bytes = descriptor.as_slice();
        let mut command = [0; CDB_SIZE];
        command[..bytes.len()].copy_from_slice(bytes);
        Self {
            command,
            len: bytes.len() as u8,
            direction,
            data_transfer_len,
        }
    }

    /// Returns the length of the underlying command block.
    ///
    /// Will always be at most 16 bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The operation code, always the first byte of a CDB.
    pub fn opcode(&self) -> u8 {
        self.command[0]
    }

    /// The significant bytes of the command block.
    pub fn as_bytes(&self) -> &[u8] {
        &self.command[..self.len()]
    }

    /// Returns a valid command block, prepared as described by USB Mass
    /// Storage Class - Bulk Only Transport section 5.1 (CBWCB).
    pub fn get(&self) -> [u8; CDB_SIZE] {
        self.command
    }
}

impl std::fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBlock")
            .field("cdb", &format_args!("{:02x?}", self.as_bytes()))
            .field("direction", &self.direction)
            .field("data_transfer_len", &self.data_transfer_len)
            .finish()
    }
}

fn x6(operation_code: OpCode, params: [u8; 3], misc_len: u8) -> X6CommandDescriptor {
    X6CommandDescriptor {
        operation_code,
        params,
        misc_len,
        control: 0,
    }
}

/// "The TEST UNIT READY command provides a means to check if the logical unit is ready.
///
/// If the logical unit is able to accept an appropriate medium access command without
/// returning CHECK CONDITION status, this command shall return a GOOD status. If the logical
/// unit is unable to become operational or is in a state such that an applicaton client action
/// (e.g START UNIT command) is required to make the unit ready, the device server shall return
/// CHECK CONDITION status with a sense key of NOT READY."
///
/// Defined in SPC2 7.25
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock::new(
        x6(OpCode::TestUnitReady, [0, 0, 0], 0),
        DataDirection::NonDirectional,
        0,
    )
}

/// "The INQUIRY command requests that information regarding parameters
/// of the target and a component logical unit be sent to the application client.
/// Options allow the client to request additional information."
///
/// "The standard INQUIRY data shall contain at least 36 bytes" (table 46), but some
/// devices only behave when asked for exactly what they return, so the allocation
/// length is left to the caller.
///
/// Defined in SPC2 7.3.1 table 45
pub fn inquiry(allocation_len: u8) -> CommandBlock {
    CommandBlock::new(
        x6(OpCode::Inquiry, [0, 0, 0], allocation_len),
        DataDirection::DataIn,
        allocation_len as u32,
    )
}

/// "The REQUEST SENSE command requests that the device server transfer sense data
/// to the application client."
///
/// Fixed format sense data is requested (DESC = 0).
///
/// SPC-2 7.20
pub fn request_sense(allocation_len: u8) -> CommandBlock {
    CommandBlock::new(
        x6(OpCode::RequestSense, [0, 0, 0], allocation_len),
        DataDirection::DataIn,
        allocation_len as u32,
    )
}

/// MODE SENSE(6), current values of `page_code`.
///
/// With `disable_block_descriptors` set the device may omit block descriptors
/// from the returned parameter data.
///
/// SPC-2 7.8
pub fn mode_sense6(
    disable_block_descriptors: bool,
    page_code: u8,
    allocation_len: u8,
) -> CommandBlock {
    let dbd = if disable_block_descriptors { 0b0000_1000 } else { 0 };
    CommandBlock::new(
        x6(OpCode::ModeSense6, [dbd, page_code & 0x3F, 0], allocation_len),
        DataDirection::DataIn,
        allocation_len as u32,
    )
}

/// MODE SENSE(10), current values of `page_code`.
///
/// SPC-2 7.10
pub fn mode_sense10(
    disable_block_descriptors: bool,
    page_code: u8,
    allocation_len: u16,
) -> CommandBlock {
    let dbd = if disable_block_descriptors { 0b0000_1000 } else { 0 };
    CommandBlock::new(
        X10CommandDescriptor {
            operation_code: OpCode::ModeSense10,
            service_action: dbd,
            logical_block_address: [page_code & 0x3F, 0, 0, 0],
            group: 0,
            misc_len: allocation_len.to_be_bytes(),
            control: 0,
        },
        DataDirection::DataIn,
        allocation_len as u32,
    )
}

/// MODE SELECT(6) with the page format bit set.
///
/// "A save pages (SP) bit of one specifies that the device server shall perform the
/// specified MODE SELECT operation, and shall save to a nonvolatile vendor-specific
/// location all the savable pages."
///
/// SPC-2 7.6
pub fn mode_select6(save_pages: bool, parameter_list_len: u8) -> CommandBlock {
    let flags = 0b0001_0000 | if save_pages { 0b0000_0001 } else { 0 };
    CommandBlock::new(
        x6(OpCode::ModeSelect6, [flags, 0, 0], parameter_list_len),
        DataDirection::DataOut,
        parameter_list_len as u32,
    )
}

/// "The `READ CAPACITY` command provides a means for the application client
/// to request information regarding the capacity of the block device."
///
/// The response is 8 bytes: the last logical block address followed by the
/// block length, both big endian.
///
/// SBC-2 5.1.10
pub fn read_capacity() -> CommandBlock {
    CommandBlock::new(
        X10CommandDescriptor {
            operation_code: OpCode::ReadCapacity10,
            service_action: 0,
            logical_block_address: [0; 4],
            group: 0,
            misc_len: [0; 2],
            control: 0,
        },
        DataDirection::DataIn,
        8,
    )
}

/// Length of the READ CAPACITY(16) parameter data requested.
pub const READ_CAPACITY16_LEN: u32 = 32;

/// READ CAPACITY(16), issued when READ CAPACITY(10) reports a last LBA of
/// `0xFFFF_FFFF`.
///
/// SBC-2 5.1.11
pub fn read_capacity16() -> CommandBlock {
    CommandBlock::new(
        X16CommandDescriptor {
            operation_code: OpCode::ServiceActionIn16,
            service_action: 0x10,
            logical_block_address: [0; 8],
            param: READ_CAPACITY16_LEN.to_be_bytes(),
            _reserved: 0,
            control: 0,
        },
        DataDirection::DataIn,
        READ_CAPACITY16_LEN,
    )
}

/// START STOP UNIT. `load_eject` together with `start == false` ejects the medium.
///
/// SBC-2 5.1.18
pub fn start_stop_unit(start: bool, load_eject: bool) -> CommandBlock {
    let power = (load_eject as u8) << 1 | start as u8;
    CommandBlock::new(
        x6(OpCode::StartStopUnit, [0, 0, 0], power),
        DataDirection::NonDirectional,
        0,
    )
}

/// "The PREVENT ALLOW MEDIUM REMOVAL" command (see table 77) requests that
/// the target enable or disable the removal of the medium in the logical unit.
/// The logical unit shall not allow medium removal if any initiator current
/// has medium removal prevented."
///
/// SPC-2 7.12
pub fn prevent_allow_medium_removal(prevent: bool) -> CommandBlock {
    CommandBlock::new(
        x6(OpCode::PreventAllowMediumRemoval, [0, 0, 0], prevent as u8),
        DataDirection::NonDirectional,
        0,
    )
}

/// READ(10) of `blocks` logical blocks starting at `lba`, moving `transfer_len` bytes.
///
/// SBC-2 5.1.6
pub fn read10(lba: u32, blocks: u16, transfer_len: u32) -> CommandBlock {
    CommandBlock::new(
        X10CommandDescriptor {
            operation_code: OpCode::Read10,
            service_action: 0,
            logical_block_address: lba.to_be_bytes(),
            group: 0,
            misc_len: blocks.to_be_bytes(),
            control: 0,
        },
        DataDirection::DataIn,
        transfer_len,
    )
}

/// WRITE(10) of `blocks` logical blocks starting at `lba`, moving `transfer_len` bytes.
///
/// SBC-2 5.1.21
pub fn write10(lba: u32, blocks: u16, transfer_len: u32) -> CommandBlock {
    CommandBlock::new(
        X10CommandDescriptor {
            operation_code: OpCode::Write10,
            service_action: 0,
            logical_block_address: lba.to_be_bytes(),
            group: 0,
            misc_len: blocks.to_be_bytes(),
            control: 0,
        },
        DataDirection::DataOut,
        transfer_len,
    )
}

/// SYNCHRONIZE CACHE(10) covering the whole medium.
///
/// SBC-2 5.1.19
pub fn synchronize_cache() -> CommandBlock {
    CommandBlock::new(
        X10CommandDescriptor {
            operation_code: OpCode::SynchronizeCache10,
            service_action: 0,
            logical_block_address: [0; 4],
            group: 0,
            misc_len: [0; 2],
            control: 0,
        },
        DataDirection::NonDirectional,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_block() {
        // A six byte command is packed at the front, the rest stays zeroed
        let cb = test_unit_ready();
        assert_eq!(cb.len(), 6);
        let mut serialized_cb = cb.get().into_iter();
        assert!(serialized_cb.next() == Some(0));
        assert!(serialized_cb.all(|b| b == 0));
    }

    #[test]
    fn inquiry_carries_allocation_length() {
        let cb = inquiry(36);
        assert_eq!(cb.as_bytes(), &[0x12, 0, 0, 0, 36, 0]);
        assert_eq!(cb.direction, DataDirection::DataIn);
        assert_eq!(cb.data_transfer_len, 36);
    }

    #[test]
    fn mode_pages_are_addressed() {
        assert_eq!(
            mode_sense6(false, CACHING_MODE_PAGE, 64).as_bytes(),
            &[0x1A, 0, 0x08, 0, 64, 0]
        );
        assert_eq!(
            mode_sense10(true, ALL_MODE_PAGES, 0x100).as_bytes(),
            &[0x5A, 0x08, 0x3F, 0, 0, 0, 0, 0x01, 0x00, 0]
        );
        let select = mode_select6(true, 24);
        assert_eq!(select.as_bytes(), &[0x15, 0x11, 0, 0, 24, 0]);
        assert_eq!(select.direction, DataDirection::DataOut);
    }

    #[test]
    fn block_addresses_are_big_endian() {
        let cb = read10(0x0102_0304, 8, 4096);
        assert_eq!(cb.as_bytes(), &[0x28, 0, 1, 2, 3, 4, 0, 0, 8, 0]);
        assert_eq!(cb.data_transfer_len, 4096);
        assert_eq!(write10(1, 1, 2048).data_transfer_len, 2048);
    }

    #[test]
    fn start_stop_and_lock_bits() {
        assert_eq!(start_stop_unit(true, false).as_bytes()[4], 0b01);
        assert_eq!(start_stop_unit(false, true).as_bytes()[4], 0b10);
        assert_eq!(prevent_allow_medium_removal(true).as_bytes(), &[0x1E, 0, 0, 0, 1, 0]);
        assert_eq!(prevent_allow_medium_removal(false).as_bytes()[4], 0);
    }

    #[test]
    fn read_capacity16_is_a_service_action() {
        let cb = read_capacity16();
        assert_eq!(cb.len(), 16);
        assert_eq!(&cb.as_bytes()[..2], &[0x9E, 0x10]);
        assert_eq!(&cb.as_bytes()[10..14], &[0, 0, 0, 32]);
    }
}
