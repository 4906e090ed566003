//! Representations for responses to SCSI commands.

use color_eyre::Result;
use color_eyre::eyre::ensure;

/// "The standard INQUIRY data shall contain at least 36 bytes" (SPC-2 table 46)
pub const STANDARD_INQUIRY_LEN: u8 = 36;

/// Peripheral qualifier meaning "the device server is not capable of supporting a
/// peripheral device on this logical unit".
pub const PERIPHERAL_QUALIFIER_NOT_SUPPORTED: u8 = 0b011;

/// The parsed form of the standard INQUIRY data, SPC-2 7.3.2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inquiry {
    /// The PERIPHERAL QUALIFIER field (bits 7:5 of byte 0) describes the current state
    /// of the device.
    ///
    /// - 0b000 - The specified device type is currently connected. This
    ///   does not mean the device is ready for access.
    /// - 0b011 - No device can exist on this logical unit.
    ///
    /// (see SPC-2 table 47 for exact definitions).
    pub peripheral_qualifier: u8,
    /// PERIPHERAL DEVICE TYPE (bits 4:0 of byte 0). A USB flash drive is a direct
    /// access device (0x00), see table 48.
    pub peripheral_device_type: u8,
    /// "A removable medium (RMB) bit of zero indicates that the medium is not removable.
    /// A RMB bit of one indicates that the medium is removable."
    pub removable: bool,
    /// The ANSI-approved version of the standard the device claims to follow.
    pub version: u8,
    /// "The command queuing (CMDQUE) bit shall be set to one indicating that the logical
    /// unit supports the task management model"
    pub command_queue: bool,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl Inquiry {
    pub fn parse(buf: &[u8]) -> Result<Inquiry> {
        ensure!(
            buf.len() >= 5,
            "INQUIRY data too short to carry its header, got {} bytes",
            buf.len()
        );
        let field = |range: std::ops::Range<usize>| {
            buf.get(range)
                .map(trim_identification)
                .unwrap_or_default()
        };
        Ok(Inquiry {
            peripheral_qualifier: buf[0] >> 5,
            peripheral_device_type: buf[0] & 0b1_1111,
            removable: buf[1] & 0b1000_0000 != 0,
            version: buf[2] & 0b111,
            command_queue: buf.get(7).is_some_and(|flags| flags & 0b10 != 0),
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
        })
    }

    /// True when the device server says no logical unit exists at this address.
    pub fn logical_unit_absent(&self) -> bool {
        self.peripheral_qualifier == PERIPHERAL_QUALIFIER_NOT_SUPPORTED
    }
}

/// Identification fields are fixed width ASCII, left aligned and padded with spaces.
pub fn trim_identification(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_end_matches(' ')
        .to_owned()
}

/// Block count and size of the medium, as reported by READ CAPACITY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capacity {
    /// Number of addressable blocks: the returned last LBA plus one.
    pub block_count: u64,
    pub block_size: u32,
}

impl Capacity {
    /// READ CAPACITY(10) parameter data: "RETURNED LOGICAL BLOCK ADDRESS" then
    /// "BLOCK LENGTH IN BYTES", both big endian (SBC-2 table 28).
    pub fn parse10(buf: &[u8]) -> Result<Capacity> {
        ensure!(
            buf.len() >= 8,
            "READ CAPACITY(10) data must be 8 bytes, got {}",
            buf.len()
        );
        let last_lba = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let block_size = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Capacity {
            block_count: last_lba as u64 + 1,
            block_size,
        })
    }

    /// READ CAPACITY(16) parameter data, an 8 byte last LBA then a 4 byte block length.
    pub fn parse16(buf: &[u8]) -> Result<Capacity> {
        ensure!(
            buf.len() >= 12,
            "READ CAPACITY(16) data must be at least 12 bytes, got {}",
            buf.len()
        );
        let mut lba = [0; 8];
        lba.copy_from_slice(&buf[..8]);
        let last_lba = u64::from_be_bytes(lba);
        let block_size = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Capacity {
            block_count: last_lba.saturating_add(1),
            block_size,
        })
    }

    /// READ CAPACITY(10) answers `0xFFFF_FFFF` when the medium is too large to describe.
    pub fn needs_long_form(&self) -> bool {
        self.block_count == u32::MAX as u64 + 1
    }
}

/// The header in front of MODE SENSE / MODE SELECT parameter data, SPC-2 8.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeParameterHeader {
    pub mode_data_length: u16,
    pub medium_type: u8,
    /// For direct access devices bit 7 is the write protect (WP) bit.
    pub device_specific: u8,
    pub block_descriptor_length: u16,
    /// Size of the header itself: 4 bytes for the 6 byte commands, 8 for the 10 byte ones.
    pub header_length: usize,
}

impl ModeParameterHeader {
    /// SPC-2 table 145, mode parameter header(6).
    pub fn parse6(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= 4, "mode parameter header(6) is 4 bytes, got {}", buf.len());
        Ok(Self {
            mode_data_length: buf[0] as u16,
            medium_type: buf[1],
            device_specific: buf[2],
            block_descriptor_length: buf[3] as u16,
            header_length: 4,
        })
    }

    /// SPC-2 table 146, mode parameter header(10).
    pub fn parse10(buf: &[u8]) -> Result<Self> {
        ensure!(buf.len() >= 8, "mode parameter header(10) is 8 bytes, got {}", buf.len());
        Ok(Self {
            mode_data_length: u16::from_be_bytes([buf[0], buf[1]]),
            medium_type: buf[2],
            device_specific: buf[3],
            block_descriptor_length: u16::from_be_bytes([buf[6], buf[7]]),
            header_length: 8,
        })
    }

    /// "A WP bit of one indicates that the medium is write-protected." (SBC-2 6.3.1)
    pub fn write_protected(&self) -> bool {
        self.device_specific & 0b1000_0000 != 0
    }

    /// Offset of the first mode page.
    pub fn page_offset(&self) -> usize {
        self.header_length + self.block_descriptor_length as usize
    }
}

/// Shortest caching page accepted. SCSI-2 devices report 0x0A, newer ones 0x12.
pub const MIN_CACHING_PAGE_LENGTH: u8 = 0x0A;

/// The caching mode page (SBC-2 6.3.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachingPage {
    /// "A writeback cache enable (WCE) bit of one specifies that the device server may
    /// return GOOD status for a WRITE command after successfully receiving the data
    /// and prior to having successfully written it to the medium."
    pub write_cache_enabled: bool,
    pub read_cache_disabled: bool,
}

impl CachingPage {
    /// Locate and parse the caching page that follows `header` in `buf`.
    pub fn parse(buf: &[u8], header: &ModeParameterHeader) -> Result<CachingPage> {
        let offset = header.page_offset();
        ensure!(
            offset + 3 <= buf.len(),
            "block descriptor length {} leaves no room for a mode page in {} bytes",
            header.block_descriptor_length,
            buf.len()
        );
        let page_code = buf[offset] & 0x3F;
        ensure!(
            page_code == super::command::CACHING_MODE_PAGE,
            "expected the caching page, got page 0x{page_code:02x}"
        );
        let page_length = buf[offset + 1];
        ensure!(
            page_length >= MIN_CACHING_PAGE_LENGTH,
            "caching page length 0x{page_length:02x} is too short"
        );
        let flags = buf[offset + 2];
        Ok(CachingPage {
            write_cache_enabled: flags & 0b100 != 0,
            read_cache_disabled: flags & 0b1 != 0,
        })
    }
}

/// Turn MODE SENSE(6) data into a MODE SELECT(6) parameter list that stores the same
/// values.
///
/// "The MODE DATA LENGTH field is reserved when using the MODE SELECT command", the
/// WP bit is ignored, and the PS bit of every page must be zero.
pub fn mode_select_parameters(sensed: &[u8], header: &ModeParameterHeader) -> Result<Vec<u8>> {
    let offset = header.page_offset();
    ensure!(offset + 2 <= sensed.len(), "mode data does not contain a page");
    // Trust the page length over the transfer, but never read past what arrived
    let end = (offset + 2 + sensed[offset + 1] as usize).min(sensed.len());
    let mut parameters = sensed[..end].to_vec();
    parameters[0] = 0;
    parameters[2] = 0;
    parameters[offset] &= 0x3F;
    Ok(parameters)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inquiry_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 36];
        buf[1] = 0x80;
        buf[2] = 0x04;
        buf[7] = 0x02;
        buf[8..16].copy_from_slice(b"SEAGATE ");
        buf[16..32].copy_from_slice(b"ST3500418AS     ");
        buf[32..36].copy_from_slice(b"CC38");
        buf
    }

    #[test]
    fn parses_standard_inquiry() {
        let inquiry = Inquiry::parse(&inquiry_bytes()).unwrap();
        assert_eq!(inquiry.peripheral_device_type, 0);
        assert!(inquiry.removable);
        assert!(inquiry.command_queue);
        assert_eq!(inquiry.version, 4);
        assert_eq!(inquiry.vendor, "SEAGATE");
        assert_eq!(inquiry.product, "ST3500418AS");
        assert_eq!(inquiry.revision, "CC38");
        assert!(!inquiry.logical_unit_absent());
    }

    #[test]
    fn short_inquiry_leaves_identification_empty() {
        let inquiry = Inquiry::parse(&[0x7F, 0, 2, 2, 0]).unwrap();
        assert!(inquiry.logical_unit_absent());
        assert_eq!(inquiry.vendor, "");
        let e = Inquiry::parse(&[0; 4]).expect_err("should reject a truncated header");
        assert!(e.root_cause().to_string().contains("too short"));
    }

    #[test]
    fn trims_space_padding() {
        assert_eq!(trim_identification(b"SEAGATE "), "SEAGATE");
        assert_eq!(trim_identification(b"        "), "");
        assert_eq!(trim_identification(b" LEAD"), " LEAD");
    }

    #[test]
    fn capacity_counts_the_last_block() {
        let capacity = Capacity::parse10(&[0, 0x0E, 0xFF, 0xFF, 0, 0, 2, 0]).unwrap();
        assert_eq!(capacity.block_count, 0x000F_0000);
        assert_eq!(capacity.block_size, 512);
        assert!(!capacity.needs_long_form());
        assert!(Capacity::parse10(&[0xFF; 8]).unwrap().needs_long_form());
    }

    #[test]
    fn long_capacity() {
        let mut buf = [0u8; 32];
        buf[..8].copy_from_slice(&0xEA_5FFF_FFBE_u64.to_be_bytes());
        buf[8..12].copy_from_slice(&0x0000_0200_u32.to_be_bytes());
        let capacity = Capacity::parse16(&buf).unwrap();
        assert_eq!(capacity.block_count, 0xEA_5FFF_FFBF);
        assert_eq!(capacity.block_size, 512);
    }

    #[test]
    fn write_protect_bit_in_both_headers() {
        let six = ModeParameterHeader::parse6(&[3, 0, 0x80, 0]).unwrap();
        assert!(six.write_protected());
        let ten = ModeParameterHeader::parse10(&[0, 6, 0, 0x00, 0, 0, 0, 0]).unwrap();
        assert!(!ten.write_protected());
        assert_eq!(ten.page_offset(), 8);
    }

    fn caching_sense(page_length: u8, flags: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + 8 + 2 + page_length as usize];
        buf[0] = (buf.len() - 1) as u8;
        buf[3] = 8;
        buf[12] = 0x80 | CACHING_PAGE;
        buf[13] = page_length;
        buf[14] = flags;
        buf
    }

    const CACHING_PAGE: u8 = super::super::command::CACHING_MODE_PAGE;

    #[test]
    fn caching_page_behind_block_descriptor() {
        let buf = caching_sense(0x12, 0b100);
        let header = ModeParameterHeader::parse6(&buf).unwrap();
        let page = CachingPage::parse(&buf, &header).unwrap();
        assert!(page.write_cache_enabled);
        assert!(!page.read_cache_disabled);
    }

    #[test]
    fn caching_page_rejects_garbage() {
        let short = caching_sense(0x02, 0b100);
        let header = ModeParameterHeader::parse6(&short).unwrap();
        assert!(CachingPage::parse(&short, &header).is_err());

        let mut wrong_page = caching_sense(0x12, 0);
        wrong_page[12] = 0x01;
        let header = ModeParameterHeader::parse6(&wrong_page).unwrap();
        assert!(CachingPage::parse(&wrong_page, &header).is_err());

        let insane = [3u8, 0, 0, 200];
        let header = ModeParameterHeader::parse6(&insane).unwrap();
        assert!(CachingPage::parse(&insane, &header).is_err());
    }

    #[test]
    fn mode_select_clears_reserved_fields() {
        let mut sensed = caching_sense(0x12, 0b100);
        sensed[2] = 0x80;
        let header = ModeParameterHeader::parse6(&sensed).unwrap();
        let parameters = mode_select_parameters(&sensed, &header).unwrap();
        assert_eq!(parameters.len(), sensed.len());
        assert_eq!(parameters[0], 0);
        assert_eq!(parameters[2], 0);
        assert_eq!(parameters[12], CACHING_PAGE);
        assert_eq!(parameters[14], 0b100);
    }
}
