//! First contact with a logical unit: wait for it to become ready, identify it,
//! and for fixed disks, pin down the write cache setting.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::DeviceCharacteristics;
use crate::config::Config;
use crate::error::ProbeError;
use crate::scsi::command::CACHING_MODE_PAGE;
use crate::scsi::response::{CachingPage, Inquiry, ModeParameterHeader, mode_select_parameters};
use crate::scsi::sense::{Outcome, SENSE_DATA_LEN, SenseData, classify};
use crate::scsi::{CommandBlock, CommandSet};
use crate::task::{Dispatcher, ServiceResponse, Task, TaskStatus};

/// Allocation length for the caching page. Header, a block descriptor and the
/// 20 byte SBC-2 page fit with room to spare.
const CACHING_SENSE_LEN: u8 = 64;

pub(crate) struct ProbeReport {
    pub characteristics: DeviceCharacteristics,
    /// `None` when the device was not asked or would not say.
    pub write_cache_enabled: Option<bool>,
}

#[tracing::instrument(skip_all)]
pub(crate) async fn probe(dispatcher: &Dispatcher, config: &Config) -> Result<ProbeReport, ProbeError> {
    let prober = Prober { dispatcher, config };
    prober.wait_until_ready().await?;
    let characteristics = DeviceCharacteristics::from(prober.inquiry().await?);
    let write_cache_enabled = if !characteristics.removable && config.check_write_cache {
        prober.write_cache().await?
    } else {
        None
    };
    Ok(ProbeReport {
        characteristics,
        write_cache_enabled,
    })
}

struct Prober<'a> {
    dispatcher: &'a Dispatcher,
    config: &'a Config,
}

impl Prober<'_> {
    fn command_set(&self) -> &dyn CommandSet {
        self.dispatcher.command_set().as_ref()
    }

    /// Run `task`, unless the device went away in the meantime.
    async fn run_task(&self, task: Task) -> Result<Task, ProbeError> {
        if !self.dispatcher.is_accepting() {
            return Err(ProbeError::Terminated);
        }
        Ok(self.dispatcher.execute(task).await?)
    }

    async fn run(&self, command: CommandBlock, timeout: Duration) -> Result<Task, ProbeError> {
        self.run_task(Task::new(command).with_timeout(timeout)).await
    }

    /// Sense data explaining a CHECK CONDITION. Autosense normally collected it
    /// already; otherwise ask for it.
    async fn sense_for(&self, task: &Task) -> Result<Option<SenseData>, ProbeError> {
        if let Some(sense) = task.sense_data() {
            return Ok(Some(sense));
        }
        let request = Task::new(self.command_set().request_sense(SENSE_DATA_LEN)?)
            .with_autosense(false)
            .with_timeout(self.config.control_timeout);
        let request = self.run_task(request).await?;
        Ok(if request.is_good() {
            SenseData::parse(request.data())
        } else {
            None
        })
    }

    /// Poll TEST UNIT READY until the unit is ready or reports an empty drive.
    /// Running out of attempts is not fatal; INQUIRY may still work.
    async fn wait_until_ready(&self) -> Result<(), ProbeError> {
        let attempts = self.config.probe_attempts.max(1);
        for attempt in 1..=attempts {
            let task = self
                .run(self.command_set().test_unit_ready()?, self.config.control_timeout)
                .await?;
            if task.is_good() {
                debug!(attempt, "unit ready");
                return Ok(());
            }
            if task.service_response() == ServiceResponse::TaskComplete
                && task.status() == TaskStatus::CheckCondition
            {
                let sense = self.sense_for(&task).await?;
                match classify(task.status(), sense.as_ref()) {
                    Outcome::InvalidLun => return Err(ProbeError::LogicalUnitNotPresent),
                    Outcome::NoMedia => {
                        debug!("no medium");
                        return Ok(());
                    }
                    Outcome::NotReadySpinUp => {
                        info!("spinning up");
                        let start = self.command_set().start_stop_unit(true, false)?;
                        let started = self.run(start, self.config.long_control_timeout).await?;
                        if !started.is_good() {
                            debug!(status = ?started.status(), "START UNIT failed");
                        }
                    }
                    outcome => debug!(attempt, ?outcome, "unit not ready"),
                }
            } else {
                debug!(attempt, response = ?task.service_response(), "TEST UNIT READY not delivered");
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        debug!(attempts, "unit never reported ready");
        Ok(())
    }

    async fn inquiry(&self) -> Result<Inquiry, ProbeError> {
        let attempts = self.config.probe_attempts.max(1);
        let length = self.config.inquiry_length();
        for attempt in 1..=attempts {
            let task = self
                .run(self.command_set().inquiry(length)?, self.config.control_timeout)
                .await?;
            if task.is_good() {
                match Inquiry::parse(task.data()) {
                    Ok(inquiry) if inquiry.logical_unit_absent() => {
                        return Err(ProbeError::LogicalUnitNotPresent);
                    }
                    Ok(inquiry) => return Ok(inquiry),
                    Err(e) => debug!(attempt, error = %e, "unusable INQUIRY data"),
                }
            } else if classify(task.status(), task.sense_data().as_ref()) == Outcome::InvalidLun {
                return Err(ProbeError::LogicalUnitNotPresent);
            } else {
                debug!(attempt, status = ?task.status(), "INQUIRY failed");
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(ProbeError::InquiryFailed { attempts })
    }

    /// Read the caching page and write it back with the save bit set, so the
    /// current WCE setting survives a power cycle.
    async fn write_cache(&self) -> Result<Option<bool>, ProbeError> {
        let sense = self
            .command_set()
            .mode_sense6(CACHING_MODE_PAGE, CACHING_SENSE_LEN)?;
        let task = self.run(sense, self.config.control_timeout).await?;
        if !task.is_good() {
            debug!(status = ?task.status(), "caching page not available");
            return Ok(None);
        }
        let sensed = task.data();
        let parsed = ModeParameterHeader::parse6(sensed).and_then(|header| {
            let page = CachingPage::parse(sensed, &header)?;
            Ok((header, page))
        });
        let (header, page) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "unusable caching page");
                return Ok(None);
            }
        };
        debug!(wce = page.write_cache_enabled, rcd = page.read_cache_disabled, "caching page");

        let parameters = match mode_select_parameters(sensed, &header) {
            Ok(parameters) => parameters,
            Err(e) => {
                debug!(error = %e, "cannot save caching page");
                return Ok(Some(page.write_cache_enabled));
            }
        };
        let select = Task::new(self.command_set().mode_select6(true, parameters.len())?)
            .with_data_out(parameters)
            .with_timeout(self.config.long_control_timeout);
        let select = self.run_task(select).await?;
        if !select.is_good() {
            warn!(status = ?select.status(), "device would not save its caching page");
        }
        Ok(Some(page.write_cache_enabled))
    }
}
