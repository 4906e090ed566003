//! [`Transport`] over the USB mass storage bulk-only protocol.
//!
//! One command at a time: CBW out, optional data phase, CSW in. While a command
//! is on the wire the endpoints are checked out of the transport, and any task
//! offered in the meantime is turned away.

use std::sync::Arc;

use color_eyre::Result;
use color_eyre::eyre::{ensure, eyre};
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::Bulk;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::cbw::{CSW_SIZE, CommandBlockWrapper, CommandStatus, CommandStatusWrapper, TagGenerator};
use crate::scsi::DataDirection;
use crate::task::{Completer, ServiceResponse, Task, TaskStatus};
use crate::transport::{Acceptance, Transport};

struct Pipes {
    writer: EndpointWrite<Bulk>,
    reader: EndpointRead<Bulk>,
    tags: TagGenerator,
}

pub struct BulkOnlyTransport {
    /// `None` while a command is in progress.
    pipes: Arc<Mutex<Option<Pipes>>>,
    lun: u8,
}

impl BulkOnlyTransport {
    pub fn new(writer: EndpointWrite<Bulk>, reader: EndpointRead<Bulk>, lun: u8) -> Self {
        BulkOnlyTransport {
            pipes: Arc::new(Mutex::new(Some(Pipes {
                writer,
                reader,
                tags: TagGenerator::new(),
            }))),
            lun,
        }
    }
}

impl Transport for BulkOnlyTransport {
    fn accept(&self, mut task: Task, completer: Completer) -> Acceptance {
        let Some(mut pipes) = self.pipes.lock().take() else {
            return Acceptance::Rejected(task);
        };
        let slot = self.pipes.clone();
        let lun = self.lun;
        tokio::spawn(async move {
            let timeout = task.timeout();
            let outcome = tokio::time::timeout(timeout, pipes.exchange(&mut task, lun)).await;
            let (response, status) = match outcome {
                Ok(Ok(CommandStatus::Passed)) => (ServiceResponse::TaskComplete, TaskStatus::Good),
                Ok(Ok(CommandStatus::Failed)) => {
                    (ServiceResponse::TaskComplete, TaskStatus::CheckCondition)
                }
                Ok(Ok(CommandStatus::PhaseError)) => {
                    warn!(task = task.id(), "phase error");
                    failure()
                }
                Ok(Err(e)) => {
                    warn!(task = task.id(), error = %e, "bulk-only exchange failed");
                    failure()
                }
                Err(_) => {
                    warn!(task = task.id(), ?timeout, "command timed out");
                    failure()
                }
            };
            *slot.lock() = Some(pipes);
            completer.complete(task, response, status);
        });
        Acceptance::Pending
    }
}

fn failure() -> (ServiceResponse, TaskStatus) {
    (
        ServiceResponse::ServiceDeliveryOrTargetFailure,
        TaskStatus::NoStatus,
    )
}

impl Pipes {
    /// Run the active command of `task` through the three bulk-only phases.
    async fn exchange(&mut self, task: &mut Task, lun: u8) -> Result<CommandStatus> {
        let command = task.active_command().clone();
        let tag = self.tags.tag();
        trace!(tag, ?command, "sending CBW");
        let cbw = CommandBlockWrapper::new(&command, tag, lun);
        self.writer.write_all(cbw.as_slice()).await?;
        self.writer.flush().await?;

        let expected = command.data_transfer_len as usize;
        let moved = match command.direction {
            DataDirection::DataIn if expected > 0 => {
                let buffer = task.buffer_mut();
                let len = expected.min(buffer.len());
                self.read_data(&mut buffer[..len]).await?
            }
            DataDirection::DataOut if expected > 0 => {
                let data = task.buffer();
                ensure!(
                    data.len() >= expected,
                    "{} bytes to send but the command expects {expected}",
                    data.len()
                );
                self.writer.write_all(&data[..expected]).await?;
                self.writer.flush().await?;
                expected
            }
            _ => 0,
        };

        let mut raw = [0u8; CSW_SIZE];
        self.reader.read_exact(&mut raw).await?;
        let csw = CommandStatusWrapper::parse(&raw)?;
        ensure!(
            csw.tag == tag,
            "CSW tag {} does not match CBW tag {tag}",
            csw.tag
        );
        let residue = csw.data_residue as usize;
        let transferred = match command.direction {
            DataDirection::DataIn => moved,
            _ => expected.saturating_sub(residue),
        };
        task.set_transferred(transferred);
        debug!(tag, status = ?csw.status, residue, transferred, "CSW");
        Ok(csw.status)
    }

    /// Read the data-in phase. The device may end it early with a short packet.
    async fn read_data(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut packets = self.reader.until_short_packet();
        let mut filled = 0;
        while filled < buffer.len() {
            let n = packets.read(&mut buffer[filled..]).await?;
            if n == 0 {
                packets
                    .consume_end()
                    .map_err(|_| eyre!("data phase ended without a short packet"))?;
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
