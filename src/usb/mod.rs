//! Interactions with USB mass storage devices
//!
//! Flash drives use the mass storage class (0x08), SCSI transparent command set subclass (0x06),
//! and the bulk-only transport protocol (0x50). That means two bulk endpoints, one per direction,
//! carrying a 31-byte command block wrapper (CBW), optional data, and a 13-byte command status
//! wrapper (CSW) for every SCSI command. GET MAX LUN goes over the control endpoint.
//!
//! <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>

mod cbw;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use nusb::transfer::{Bulk, ControlIn, ControlType, In, Out, Recipient};
use nusb::{Device, DeviceInfo, list_devices};
use tracing::{debug, info};

use crate::scsi::{BlockCommands, CommandSet, ReducedBlockCommands};

pub use transport::BulkOnlyTransport;

/// https://www.usb.org/defined-class-codes
const MASS_STORAGE_USB_CLASS: u8 = 0x08;

/// `bInterfaceSubClass` of devices that speak Reduced Block Commands.
const RBC_SUBCLASS: u8 = 0x01;

/// Size of the endpoint reader and writer buffers.
const TRANSFER_SIZE: usize = 64 * 1024;

/// Returns a list of every USB storage device currently connected to the host machine
pub async fn enumerate_usb_storage_devices() -> Result<impl Iterator<Item = DeviceInfo>> {
    let all_usb_devices = list_devices().await?;

    // Each USB device typically exposes one or more *interfaces* as a
    // way to interact with specific functionality of the device.
    let usb_storage_devices = all_usb_devices.filter(|dev| {
        debug!("scanning usb device: {:#?}", dev);
        dev.class() == MASS_STORAGE_USB_CLASS
            || dev
                .interfaces()
                .any(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
    });
    Ok(usb_storage_devices)
}

/// The command set announced by the mass storage interface's subclass.
pub fn command_set_for(device_info: &DeviceInfo) -> Arc<dyn CommandSet> {
    let subclass = device_info
        .interfaces()
        .find(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
        .map(|interface| interface.subclass());
    match subclass {
        Some(RBC_SUBCLASS) => Arc::new(ReducedBlockCommands::default()),
        _ => Arc::new(BlockCommands),
    }
}

/// Bulk endpoint addresses of the mass storage interface.
#[derive(Clone, Copy, Debug)]
pub struct Endpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
}

impl Default for Endpoints {
    fn default() -> Self {
        Endpoints {
            bulk_in: 0x81,
            bulk_out: 0x02,
        }
    }
}

/// As described by the USB Mass Storage Class - Bulk Only Transport spec,
/// section 3.2.
///
/// "The device shall return one byte of data that contains the maximum LUN
/// supported by the device."
fn max_lun_request(interface: u8) -> ControlIn {
    ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Interface,
        request: 0xfe,
        value: 0,
        index: interface as u16,
        length: 1,
    }
}

/// Opens the provided USB mass storage device and returns a transport for LUN 0.
///
/// This initialization sequence follows the order
/// described here: <https://www.downtowndougbrown.com/2018/12/usb-mass-storage-with-embedded-devices-tips-and-quirks/>.
/// The SCSI side of it (TEST UNIT READY, INQUIRY and so on) is left to
/// [`crate::device::ScsiDevice::start`].
#[tracing::instrument(skip_all, fields(vendor = device_info.vendor_id(), product = device_info.product_id()))]
pub async fn open_usb_device(
    device_info: &DeviceInfo,
    endpoints: Endpoints,
) -> Result<BulkOnlyTransport> {
    let interface_number = device_info
        .interfaces()
        .find(|interface| interface.class() == MASS_STORAGE_USB_CLASS)
        .map(|interface| interface.interface_number())
        .ok_or_else(|| eyre!("device has no mass storage interface"))?;

    // 1. Claim the USB device to read and write to it
    debug!(interface_number, "opening device");
    let device: Device = device_info.open().await?;
    let interface: nusb::Interface = device.claim_interface(interface_number).await?;

    // 2. Request the maximum LUN. Devices with a single LUN may stall this request.
    let max_lun = match interface
        .control_in(max_lun_request(interface_number), Duration::from_millis(500))
        .await
    {
        Ok(data) => data.first().copied().unwrap_or(0),
        Err(e) => {
            debug!(error = %e, "GET MAX LUN failed, assuming one LUN");
            0
        }
    };
    if max_lun > 0 {
        info!(luns = max_lun as u16 + 1, "only LUN 0 will be used");
    }

    let writer = interface
        .endpoint::<Bulk, Out>(endpoints.bulk_out)?
        .writer(TRANSFER_SIZE)
        .with_num_transfers(8);
    let reader = interface
        .endpoint::<Bulk, In>(endpoints.bulk_in)?
        .reader(TRANSFER_SIZE)
        .with_num_transfers(8);

    Ok(BulkOnlyTransport::new(writer, reader, 0))
}
