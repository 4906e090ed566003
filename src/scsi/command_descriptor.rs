//! Underlying structures that commands are issued in

/// Operation codes for a Command Descriptor Block, specifying what operation you want
/// to do as described in 7.1 of SPC-2.
///
/// This enum is not complete, and is intended to grow
/// as needed
#[repr(u8)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// SPC-2 7.25
    TestUnitReady = 0x00,
    /// SPC-2 7.20
    RequestSense = 0x03,
    /// SPC-2 7.3
    Inquiry = 0x12,
    /// SPC-2 7.6
    ModeSelect6 = 0x15,
    /// SPC-2 7.8
    ModeSense6 = 0x1A,
    /// SBC-2 5.1.18
    StartStopUnit = 0x1B,
    /// SPC-2 7.12
    PreventAllowMediumRemoval = 0x1E,
    /// SBC-2 5.1.10, table 27
    ReadCapacity10 = 0x25,
    /// SBC-2 5.1.6
    Read10 = 0x28,
    /// SBC-2 5.1.21
    Write10 = 0x2A,
    /// SBC-2 5.1.19
    SynchronizeCache10 = 0x35,
    /// SPC-2 7.10
    ModeSense10 = 0x5A,
    /// SBC-2 5.1.11 (SERVICE ACTION IN, service action 0x10)
    ServiceActionIn16 = 0x9E,
}

/// As described in SPC-2 4.3.2 table 1, a typical CDB for 6 byte commands.
#[repr(C, packed)]
pub struct X6CommandDescriptor {
    ///"The `OPERATION CODE` field contains the code value identifying the operation
    /// being requested by the CDB. SAM-2 defines the general structure of the operation
    /// code value. The `OPERATION CODE` field has a consistently defined meaning across
    /// all commands. This standard specifies the operation code values used by the commands
    /// defined herein."
    pub operation_code: OpCode,
    /// Bytes 1 through 3. "A six-byte CDB contains a 21-bit `LOGICAL BLOCK ADDRESS` field",
    /// but almost none of the commands issued here address blocks, so these bytes
    /// carry command-specific flags instead (EVPD, page codes, IMMED, ...).
    pub params: [u8; 3],
    /// Depending on the opcode, this field is one of `TRANSFER LENGTH`,
    /// `PARAMETER LIST LENGTH`, or `ALLOCATION LENGTH`.
    ///
    /// More info can be found in SCSI SPC2 4.3
    pub misc_len: u8,
    /// "The contents of the `CONTROL` field are defined in SAM-2. The `CONTROL` field
    /// has a consistently defined meaning across all commands."
    ///
    /// As far as I can tell, this value is set to zero by most modern implementations.
    pub control: u8,
}

impl CommandDescriptor for X6CommandDescriptor {
    const SIZE: usize = 6;
}

/// As described in SPC-2 4.3.2 table 2, a typical CDB for 10 byte commands.
#[repr(C, packed)]
pub struct X10CommandDescriptor {
    ///"The `OPERATION CODE` field contains the code value identifying the operation
    /// being requested by the CDB."
    pub operation_code: OpCode,
    /// (if required) the lower 5 bits identify a function to be performed under the
    /// more general command specified in the `OPERATION CODE` field. Otherwise flag bits
    /// such as DBD or FUA.
    pub service_action: u8,
    /// Big endian. The use of this field varies from command to command.
    pub logical_block_address: [u8; 4],
    /// Reserved or `GROUP NUMBER`, depending on the command.
    pub group: u8,
    /// Big endian `TRANSFER LENGTH`, `PARAMETER LIST LENGTH` or `ALLOCATION LENGTH`.
    pub misc_len: [u8; 2],
    pub control: u8,
}

impl CommandDescriptor for X10CommandDescriptor {
    const SIZE: usize = 10;
}

/// SPC-2 4.3.2 table 4, a typical CDB for 16 byte commands. Only READ CAPACITY(16)
/// is issued with this layout.
#[repr(C, packed)]
pub struct X16CommandDescriptor {
    pub operation_code: OpCode,
    /// Lower 5 bits: `SERVICE ACTION`
    pub service_action: u8,
    /// Big endian.
    pub logical_block_address: [u8; 8],
    /// Big endian `ALLOCATION LENGTH` for service action commands.
    pub param: [u8; 4],
    pub _reserved: u8,
    pub control: u8,
}

impl CommandDescriptor for X16CommandDescriptor {
    const SIZE: usize = 16;
}

pub trait CommandDescriptor: Sized {
    /// Length of the descriptor on the wire.
    const SIZE: usize;

    fn as_slice(&'_ self) -> &[u8] {
        const {
            assert!(
                std::mem::size_of::<Self>() == Self::SIZE,
                "command descriptor has padding or the wrong field widths"
            );
        };
        // SAFETY: the const assertion above guarantees the struct is exactly
        // `SIZE` bytes, every descriptor is `repr(C, packed)` with only
        // byte-sized fields, and the slice borrows `self`.
        let slice: &'_ [u8] = unsafe {
            let ptr = self as *const Self as *const u8;
            std::slice::from_raw_parts(ptr, Self::SIZE)
        };
        slice
    }
}
