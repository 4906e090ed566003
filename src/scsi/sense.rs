//! Sense data and its interpretation.
//!
//! When a command ends with CHECK CONDITION the device keeps "sense data" around
//! that explains why, SPC-2 7.20.2. [`classify`] reduces a finished command to the
//! handful of outcomes the probe and the media poller act on.

use crate::task::TaskStatus;

/// Sense buffer length requested by autosense and explicit REQUEST SENSE.
pub const SENSE_DATA_LEN: u8 = 18;

/// SPC-2 table 107
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    Obsolete = 0xC,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
    Reserved = 0xF,
}

impl SenseKey {
    pub fn from_u8(n: u8) -> Self {
        match n & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xB => SenseKey::AbortedCommand,
            0xC => SenseKey::Obsolete,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            _ => SenseKey::Reserved,
        }
    }
}

/// Additional sense codes this crate reacts to.
pub mod asc {
    /// LOGICAL UNIT NOT READY, with the qualifiers below
    pub const LOGICAL_UNIT_NOT_READY: u8 = 0x04;
    pub const BECOMING_READY: u8 = 0x01;
    pub const INITIALIZING_COMMAND_REQUIRED: u8 = 0x02;
    /// NOT READY TO READY CHANGE, MEDIUM MAY HAVE CHANGED
    pub const MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
    /// LOGICAL UNIT NOT SUPPORTED
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    /// MEDIUM NOT PRESENT (any qualifier)
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
}

/// Parsed sense data, either format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SenseData {
    pub response_code: u8,
    pub sense_key: SenseKey,
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    information: Option<u32>,
}

impl SenseData {
    pub fn new(sense_key: SenseKey, asc: u8, ascq: u8) -> Self {
        SenseData {
            response_code: 0x70,
            sense_key,
            additional_sense_code: asc,
            additional_sense_code_qualifier: ascq,
            information: None,
        }
    }

    /// Parse fixed (0x70/0x71) or descriptor (0x72/0x73) format sense data.
    ///
    /// Plenty of devices never set the VALID bit, so it only gates the INFORMATION
    /// field. The sense key and additional sense bytes are taken as returned.
    pub fn parse(buf: &[u8]) -> Option<SenseData> {
        let response_code = *buf.first()? & 0x7F;
        match response_code {
            0x70 | 0x71 => {
                let sense_key = SenseKey::from_u8(*buf.get(2)?);
                let valid = buf[0] & 0x80 != 0;
                let information = match (valid, buf.get(3..7)) {
                    (true, Some(bytes)) => Some(u32::from_be_bytes([
                        bytes[0], bytes[1], bytes[2], bytes[3],
                    ])),
                    _ => None,
                };
                Some(SenseData {
                    response_code,
                    sense_key,
                    additional_sense_code: buf.get(12).copied().unwrap_or(0),
                    additional_sense_code_qualifier: buf.get(13).copied().unwrap_or(0),
                    information,
                })
            }
            0x72 | 0x73 => Some(SenseData {
                response_code,
                sense_key: SenseKey::from_u8(*buf.get(1)?),
                additional_sense_code: buf.get(2).copied().unwrap_or(0),
                additional_sense_code_qualifier: buf.get(3).copied().unwrap_or(0),
                information: None,
            }),
            _ => None,
        }
    }

    /// The INFORMATION field, only when the device flagged it as valid.
    pub fn information(&self) -> Option<u32> {
        self.information
    }

    /// Fixed format encoding, as a device would return it.
    pub fn to_fixed(&self) -> [u8; SENSE_DATA_LEN as usize] {
        let mut buf = [0u8; SENSE_DATA_LEN as usize];
        buf[0] = 0x70;
        buf[2] = self.sense_key as u8;
        buf[7] = SENSE_DATA_LEN - 8;
        buf[12] = self.additional_sense_code;
        buf[13] = self.additional_sense_code_qualifier;
        buf
    }
}

/// What a finished command means for the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Good,
    /// The unit is becoming ready; wait and poll again.
    NotReadyRetry,
    /// The unit needs a START UNIT before it becomes ready.
    NotReadySpinUp,
    NoMedia,
    MediaChanged,
    /// The logical unit does not exist; stop interrogating it.
    InvalidLun,
    Other,
}

/// Classify a command's status and sense data.
pub fn classify(status: TaskStatus, sense: Option<&SenseData>) -> Outcome {
    match status {
        TaskStatus::Good | TaskStatus::ConditionMet => return Outcome::Good,
        TaskStatus::CheckCondition => {}
        _ => return Outcome::Other,
    }
    let Some(sense) = sense else {
        return Outcome::Other;
    };
    match (
        sense.sense_key,
        sense.additional_sense_code,
        sense.additional_sense_code_qualifier,
    ) {
        (SenseKey::NotReady, asc::LOGICAL_UNIT_NOT_READY, asc::BECOMING_READY) => {
            Outcome::NotReadyRetry
        }
        (SenseKey::NotReady, asc::LOGICAL_UNIT_NOT_READY, asc::INITIALIZING_COMMAND_REQUIRED) => {
            Outcome::NotReadySpinUp
        }
        (_, asc::MEDIUM_NOT_PRESENT, _) => Outcome::NoMedia,
        (_, asc::MEDIUM_MAY_HAVE_CHANGED, 0x00) => Outcome::MediaChanged,
        (SenseKey::IllegalRequest, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0x00) => Outcome::InvalidLun,
        _ => Outcome::Other,
    }
}
