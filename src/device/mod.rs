//! A removable-media block device on top of the task dispatcher.
//!
//! [`ScsiDevice::start`] interrogates the logical unit, then hands it to the
//! [`MediaPoller`], which keeps [`DeviceState`] in step with the medium and tells
//! subscribers when it comes and goes.

mod poller;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub use poller::{MediaPoller, PollingState};

use crate::config::Config;
use crate::error::{CommandError, IoError, ProbeError};
use crate::scsi::command::ALL_MODE_PAGES;
use crate::scsi::response::{Capacity, Inquiry, ModeParameterHeader};
use crate::scsi::{CommandBlock, CommandSet};
use crate::task::{Dispatcher, Task};
use crate::transport::Transport;

/// Allocation length for the write protect MODE SENSE. Some USB bridges hang
/// when asked for the full 255 bytes.
const MODE_SENSE_LEN: u8 = 192;

/// What INQUIRY told us about the logical unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub peripheral_device_type: u8,
    pub removable: bool,
    pub command_queue: bool,
    pub ansi_version: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl From<Inquiry> for DeviceCharacteristics {
    fn from(inquiry: Inquiry) -> Self {
        DeviceCharacteristics {
            peripheral_device_type: inquiry.peripheral_device_type,
            removable: inquiry.removable,
            command_queue: inquiry.command_queue,
            ansi_version: inquiry.version,
            vendor: inquiry.vendor,
            product: inquiry.product,
            revision: inquiry.revision,
        }
    }
}

/// The medium as last observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub media_present: bool,
    pub block_size: u32,
    pub block_count: u64,
    pub write_protected: bool,
    pub removal_prevented: bool,
    pub write_cache_enabled: bool,
    /// The medium cannot be locked, so the user ejects it by hand.
    pub manual_eject: bool,
    /// Other initiators may be using the device too.
    pub device_shared: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaEvent {
    Online {
        block_count: u64,
        block_size: u32,
        write_protected: bool,
    },
    Offline,
}

impl MediaEvent {
    /// Size of the medium in bytes, saturating on nonsense capacities. Zero once offline.
    pub fn capacity_bytes(&self) -> u64 {
        match *self {
            MediaEvent::Online {
                block_count,
                block_size,
                ..
            } => block_count.saturating_mul(u64::from(block_size)),
            MediaEvent::Offline => 0,
        }
    }
}

/// Everything the probe results, the poller and the I/O paths share.
pub(crate) struct DeviceContext {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) config: Config,
    pub(crate) characteristics: DeviceCharacteristics,
    state: watch::Sender<DeviceState>,
    events: broadcast::Sender<MediaEvent>,
}

impl DeviceContext {
    fn command_set(&self) -> &dyn CommandSet {
        self.dispatcher.command_set().as_ref()
    }

    async fn run(
        &self,
        command: Result<CommandBlock, CommandError>,
        timeout: Duration,
    ) -> Result<Task, CommandError> {
        self.dispatcher
            .execute(Task::new(command?).with_timeout(timeout))
            .await
    }

    pub(crate) fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    fn update_state(&self, update: impl FnOnce(&mut DeviceState)) {
        self.state.send_modify(update);
    }

    fn notify(&self, event: MediaEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    async fn spin_up(&self) -> bool {
        let start = self.command_set().start_stop_unit(true, false);
        match self.run(start, self.config.long_control_timeout).await {
            Ok(task) => task.is_good(),
            Err(e) => {
                debug!(error = %e, "START UNIT not issued");
                false
            }
        }
    }

    /// Lock or unlock the medium. False if the device refused or cannot do it.
    async fn set_removal_prevented(&self, prevent: bool) -> bool {
        let command = self.command_set().prevent_allow_medium_removal(prevent);
        match self.run(command, self.config.long_control_timeout).await {
            Ok(task) => task.is_good(),
            Err(e) => {
                debug!(error = %e, prevent, "medium lock not changed");
                false
            }
        }
    }

    async fn read_capacity(&self) -> Option<Capacity> {
        let timeout = self.config.control_timeout;
        let task = self.run(self.command_set().read_capacity(), timeout).await.ok()?;
        if !task.is_good() {
            return None;
        }
        let capacity = Capacity::parse10(task.data())
            .inspect_err(|e| debug!(error = %e, "unusable READ CAPACITY data"))
            .ok()?;
        if !capacity.needs_long_form() {
            return Some(capacity);
        }
        let task = self.run(self.command_set().read_capacity16(), timeout).await.ok()?;
        if !task.is_good() {
            return None;
        }
        Capacity::parse16(task.data()).ok()
    }

    /// Read the WP bit. SCSI-2 and later devices are asked with MODE SENSE(10)
    /// first; everything falls back to MODE SENSE(6).
    async fn write_protect_state(&self) -> Option<bool> {
        let timeout = self.config.control_timeout;
        if self.characteristics.ansi_version >= 2 {
            let command = self
                .command_set()
                .mode_sense10(ALL_MODE_PAGES, MODE_SENSE_LEN as u16);
            match self.run(command, timeout).await {
                Ok(task) if task.is_good() => {
                    if let Ok(header) = ModeParameterHeader::parse10(task.data()) {
                        return Some(header.write_protected());
                    }
                }
                _ => debug!("MODE SENSE(10) failed, trying MODE SENSE(6)"),
            }
        }
        let command = self.command_set().mode_sense6(ALL_MODE_PAGES, MODE_SENSE_LEN);
        let task = self.run(command, timeout).await.ok()?;
        if !task.is_good() {
            return None;
        }
        ModeParameterHeader::parse6(task.data())
            .map(|header| header.write_protected())
            .ok()
    }

    /// Forget the medium and tell subscribers.
    fn media_offline(&self) {
        self.update_state(|state| {
            state.media_present = false;
            state.block_size = 0;
            state.block_count = 0;
            state.write_protected = false;
            state.removal_prevented = false;
        });
        info!("medium offline");
        self.notify(MediaEvent::Offline);
    }
}

fn expect_good(task: Task) -> Result<Task, CommandError> {
    if task.is_good() {
        return Ok(task);
    }
    Err(CommandError::Failed {
        opcode: task.command().opcode(),
        response: task.service_response(),
        status: task.status(),
    })
}

/// A started logical unit.
pub struct ScsiDevice {
    context: Arc<DeviceContext>,
    poller: MediaPoller,
}

impl ScsiDevice {
    /// Interrogate the logical unit behind `transport` and, if it answers, start
    /// watching it for media.
    #[tracing::instrument(skip_all, fields(command_set = command_set.name()))]
    pub async fn start(
        transport: Arc<dyn Transport>,
        command_set: Arc<dyn CommandSet>,
        config: Config,
    ) -> Result<ScsiDevice, ProbeError> {
        let dispatcher = Dispatcher::new(transport, command_set, config.max_in_flight);
        let report = match probe::probe(&dispatcher, &config).await {
            Ok(report) => report,
            Err(e) => {
                dispatcher.terminate();
                return Err(e);
            }
        };
        let characteristics = report.characteristics;
        info!(
            vendor = %characteristics.vendor,
            product = %characteristics.product,
            revision = %characteristics.revision,
            removable = characteristics.removable,
            ansi_version = characteristics.ansi_version,
            "device identified"
        );

        let (state, _) = watch::channel(DeviceState {
            write_cache_enabled: report.write_cache_enabled.unwrap_or(false),
            ..DeviceState::default()
        });
        let (events, _) = broadcast::channel(16);
        let context = Arc::new(DeviceContext {
            dispatcher,
            config,
            characteristics,
            state,
            events,
        });
        let poller = MediaPoller::new(context.clone());
        if context.config.polling_enabled {
            poller.enable();
        }
        Ok(ScsiDevice { context, poller })
    }

    pub fn characteristics(&self) -> &DeviceCharacteristics {
        &self.context.characteristics
    }

    /// Snapshot of the medium state.
    pub fn device_state(&self) -> DeviceState {
        self.context.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.context.state.subscribe()
    }

    /// Media online/offline notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.context.events.subscribe()
    }

    pub fn polling_state(&self) -> PollingState {
        self.poller.state()
    }

    pub fn enable_polling(&self) {
        self.poller.enable();
    }

    pub fn disable_polling(&self) {
        self.poller.disable();
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.context.dispatcher
    }

    pub fn submit(&self, task: Task) {
        self.context.dispatcher.submit(task);
    }

    pub async fn execute(&self, task: Task) -> Result<Task, CommandError> {
        self.context.dispatcher.execute(task).await
    }

    pub fn reject_all(&self) {
        self.context.dispatcher.reject_all();
    }

    /// Check that `count` blocks from `lba` lie on the current medium.
    fn check_range(&self, lba: u64, count: u64) -> Result<DeviceState, IoError> {
        let state = self.device_state();
        if !state.media_present {
            return Err(IoError::NoMedia);
        }
        match lba.checked_add(count) {
            Some(end) if end <= state.block_count => Ok(state),
            _ => Err(IoError::OutOfRange {
                lba,
                end: lba.saturating_add(count),
                block_count: state.block_count,
            }),
        }
    }

    pub async fn read_blocks(&self, lba: u64, count: u32) -> Result<Vec<u8>, IoError> {
        let state = self.check_range(lba, count as u64)?;
        let command = self
            .context
            .command_set()
            .read10(lba, count, state.block_size);
        let task = self
            .context
            .run(command, self.context.config.read_write_timeout)
            .await?;
        Ok(expect_good(task)?.into_data())
    }

    pub async fn write_blocks(&self, lba: u64, data: Vec<u8>) -> Result<(), IoError> {
        let state = self.device_state();
        if state.media_present && state.write_protected {
            return Err(IoError::WriteProtected);
        }
        let block_size = state.block_size.max(1);
        if data.len() % block_size as usize != 0 {
            return Err(IoError::Unaligned {
                len: data.len(),
                block_size,
            });
        }
        let count = (data.len() / block_size as usize) as u64;
        let state = self.check_range(lba, count)?;
        let blocks = u32::try_from(count).unwrap_or(u32::MAX);
        let command = self
            .context
            .command_set()
            .write10(lba, blocks, state.block_size)?;
        let task = Task::new(command)
            .with_data_out(data)
            .with_timeout(self.context.config.read_write_timeout);
        expect_good(self.execute(task).await?)?;
        Ok(())
    }

    /// Unlock and eject the medium, then go back to waiting for a new one if
    /// polling was on.
    pub async fn eject_media(&self) -> Result<(), IoError> {
        let state = self.device_state();
        if !state.media_present {
            return Err(IoError::NoMedia);
        }
        let polling = self.poller.is_enabled();
        self.poller.disable();
        let result = self.unload(state).await;
        if result.is_ok() {
            self.context.media_offline();
        }
        if polling {
            self.poller.enable();
        }
        result
    }

    async fn unload(&self, state: DeviceState) -> Result<(), IoError> {
        let context = &self.context;
        if state.removal_prevented && !context.set_removal_prevented(false).await {
            warn!("device refused to unlock its medium");
        }
        if state.manual_eject {
            debug!("medium must be removed by hand");
            return Ok(());
        }
        let command = context.command_set().start_stop_unit(false, true);
        let task = context
            .run(command, context.config.long_control_timeout)
            .await?;
        expect_good(task)?;
        Ok(())
    }

    /// Stop polling, flush the write cache, and fail anything still queued.
    pub async fn stop(&self) {
        self.poller.disable();
        let context = &self.context;
        let state = context.state();
        if state.write_cache_enabled {
            let command = context.command_set().synchronize_cache();
            match context.run(command, context.config.long_control_timeout).await {
                Ok(task) if task.is_good() => debug!("write cache flushed"),
                Ok(task) => warn!(status = ?task.status(), "SYNCHRONIZE CACHE failed"),
                Err(e) => warn!(error = %e, "SYNCHRONIZE CACHE not issued"),
            }
        }
        if state.removal_prevented {
            context.set_removal_prevented(false).await;
        }
        context.dispatcher.terminate();
        info!("device stopped");
    }
}
