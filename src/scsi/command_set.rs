//! Command sets: which commands a device understands and how they are built.
//!
//! The dispatcher, the probe and the media poller never build CDBs directly. They
//! ask a [`CommandSet`] for each command, and an unsupported command comes back as
//! [`CommandError::Unsupported`] so the caller can fall back.

use super::command::{self, CommandBlock};
use crate::error::CommandError;

/// Builders for the commands this crate issues.
///
/// The provided methods follow SPC-2 and SBC-2. Command sets for devices that only
/// implement a subset override the relevant methods.
pub trait CommandSet: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn test_unit_ready(&self) -> Result<CommandBlock, CommandError> {
        Ok(command::test_unit_ready())
    }

    fn inquiry(&self, allocation_len: u8) -> Result<CommandBlock, CommandError> {
        if allocation_len < 5 {
            return Err(CommandError::InvalidParameter {
                command: "INQUIRY",
                reason: format!("allocation length {allocation_len} cannot hold the header"),
            });
        }
        Ok(command::inquiry(allocation_len))
    }

    fn request_sense(&self, allocation_len: u8) -> Result<CommandBlock, CommandError> {
        Ok(command::request_sense(allocation_len))
    }

    fn mode_sense6(&self, page_code: u8, allocation_len: u8) -> Result<CommandBlock, CommandError> {
        Ok(command::mode_sense6(false, page_code, allocation_len))
    }

    fn mode_sense10(
        &self,
        page_code: u8,
        allocation_len: u16,
    ) -> Result<CommandBlock, CommandError> {
        Ok(command::mode_sense10(false, page_code, allocation_len))
    }

    fn mode_select6(
        &self,
        save_pages: bool,
        parameter_list_len: usize,
    ) -> Result<CommandBlock, CommandError> {
        let len = u8::try_from(parameter_list_len).map_err(|_| CommandError::InvalidParameter {
            command: "MODE SELECT(6)",
            reason: format!("parameter list of {parameter_list_len} bytes"),
        })?;
        Ok(command::mode_select6(save_pages, len))
    }

    fn read_capacity(&self) -> Result<CommandBlock, CommandError> {
        Ok(command::read_capacity())
    }

    fn read_capacity16(&self) -> Result<CommandBlock, CommandError> {
        Ok(command::read_capacity16())
    }

    fn start_stop_unit(&self, start: bool, load_eject: bool) -> Result<CommandBlock, CommandError> {
        Ok(command::start_stop_unit(start, load_eject))
    }

    fn prevent_allow_medium_removal(&self, prevent: bool) -> Result<CommandBlock, CommandError> {
        Ok(command::prevent_allow_medium_removal(prevent))
    }

    fn read10(&self, lba: u64, blocks: u32, block_size: u32) -> Result<CommandBlock, CommandError> {
        let (lba, blocks, transfer_len) = ten_byte_range("READ(10)", lba, blocks, block_size)?;
        Ok(command::read10(lba, blocks, transfer_len))
    }

    fn write10(&self, lba: u64, blocks: u32, block_size: u32) -> Result<CommandBlock, CommandError> {
        let (lba, blocks, transfer_len) = ten_byte_range("WRITE(10)", lba, blocks, block_size)?;
        Ok(command::write10(lba, blocks, transfer_len))
    }

    fn synchronize_cache(&self) -> Result<CommandBlock, CommandError> {
        Ok(command::synchronize_cache())
    }
}

fn ten_byte_range(
    command: &'static str,
    lba: u64,
    blocks: u32,
    block_size: u32,
) -> Result<(u32, u16, u32), CommandError> {
    let lba = u32::try_from(lba).map_err(|_| CommandError::InvalidParameter {
        command,
        reason: format!("LBA {lba} does not fit in 32 bits"),
    })?;
    let blocks = u16::try_from(blocks).map_err(|_| CommandError::InvalidParameter {
        command,
        reason: format!("{blocks} blocks do not fit in 16 bits"),
    })?;
    // The CBW and the transport carry the byte count in 32 bits
    let transfer_len = u32::from(blocks).checked_mul(block_size).ok_or_else(|| {
        CommandError::InvalidParameter {
            command,
            reason: format!("{blocks} blocks of {block_size} bytes exceed a 32 bit transfer"),
        }
    })?;
    Ok((lba, blocks, transfer_len))
}

/// SCSI Block Commands: hard disks, flash drives and most USB card readers.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockCommands;

impl CommandSet for BlockCommands {
    fn name(&self) -> &'static str {
        "SBC"
    }
}

/// Reduced Block Commands, as spoken by some firewire and USB bridges.
///
/// RBC only has the 6 byte mode commands and no READ CAPACITY(16). Bridges that
/// cannot lock their medium are built with `lockable: false`.
#[derive(Clone, Copy, Debug)]
pub struct ReducedBlockCommands {
    pub lockable: bool,
}

impl Default for ReducedBlockCommands {
    fn default() -> Self {
        Self { lockable: true }
    }
}

impl CommandSet for ReducedBlockCommands {
    fn name(&self) -> &'static str {
        "RBC"
    }

    fn mode_sense10(&self, _page_code: u8, _allocation_len: u16) -> Result<CommandBlock, CommandError> {
        Err(CommandError::Unsupported("MODE SENSE(10)"))
    }

    fn read_capacity16(&self) -> Result<CommandBlock, CommandError> {
        Err(CommandError::Unsupported("READ CAPACITY(16)"))
    }

    fn prevent_allow_medium_removal(&self, prevent: bool) -> Result<CommandBlock, CommandError> {
        if !self.lockable {
            return Err(CommandError::Unsupported("PREVENT ALLOW MEDIUM REMOVAL"));
        }
        Ok(command::prevent_allow_medium_removal(prevent))
    }
}
