//! Transports for tests: a scripted one, and a fake removable disk to script it with.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::scsi::sense::{SenseData, SenseKey};
use crate::task::{Completer, ExecutionMode, ServiceResponse, Task, TaskId, TaskStatus};
use crate::transport::{Acceptance, Transport};

/// How the scripted transport answers one command.
pub(crate) enum Reply {
    Good,
    /// GOOD, with data-in bytes.
    Data(Vec<u8>),
    CheckCondition,
    /// CHECK CONDITION, with sense data already collected by the transport.
    CheckConditionWithSense(Vec<u8>),
    /// Service delivery or target failure.
    Failure,
}

impl Reply {
    pub(crate) fn data(bytes: Vec<u8>) -> Self {
        Reply::Data(bytes)
    }

    fn apply(self, task: &mut Task) -> (ServiceResponse, TaskStatus) {
        match self {
            Reply::Good => (ServiceResponse::TaskComplete, TaskStatus::Good),
            Reply::Data(bytes) => {
                let buffer = task.buffer_mut();
                let len = bytes.len().min(buffer.len());
                buffer[..len].copy_from_slice(&bytes[..len]);
                task.set_transferred(len);
                (ServiceResponse::TaskComplete, TaskStatus::Good)
            }
            Reply::CheckCondition => (ServiceResponse::TaskComplete, TaskStatus::CheckCondition),
            Reply::CheckConditionWithSense(sense) => {
                task.set_sense_data(&sense);
                (ServiceResponse::TaskComplete, TaskStatus::CheckCondition)
            }
            Reply::Failure => (
                ServiceResponse::ServiceDeliveryOrTargetFailure,
                TaskStatus::NoStatus,
            ),
        }
    }
}

type Script = Box<dyn Fn(&Task) -> Reply + Send + Sync>;

/// Answers from a script, either on the dispatching thread or from a spawned task.
pub(crate) struct ScriptedTransport {
    asynchronous: bool,
    script: Script,
    rejecting: AtomicBool,
    reject_next: AtomicUsize,
    rejections: AtomicUsize,
    dispatched: Mutex<Vec<(TaskId, ExecutionMode)>>,
    opcodes: Mutex<Vec<u8>>,
    pending: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        asynchronous: bool,
        script: impl Fn(&Task) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(ScriptedTransport {
            asynchronous,
            script: Box::new(script),
            rejecting: AtomicBool::new(false),
            reject_next: AtomicUsize::new(0),
            rejections: AtomicUsize::new(0),
            dispatched: Mutex::new(Vec::new()),
            opcodes: Mutex::new(Vec::new()),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Turn every offer away until switched off again.
    pub(crate) fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Turn away the next `count` offers.
    pub(crate) fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    pub(crate) fn rejections(&self) -> usize {
        self.rejections.load(Ordering::SeqCst)
    }

    /// Accepted tasks, in the order they reached the transport.
    pub(crate) fn dispatched(&self) -> Vec<(TaskId, ExecutionMode)> {
        self.dispatched.lock().clone()
    }

    /// Operation codes of accepted commands, autosense included.
    pub(crate) fn opcodes(&self) -> Vec<u8> {
        self.opcodes.lock().clone()
    }

    /// Wait until every asynchronous completion has been delivered.
    pub(crate) async fn settle(&self) {
        loop {
            tokio::task::yield_now().await;
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }
}

impl Transport for ScriptedTransport {
    fn accept(&self, mut task: Task, completer: Completer) -> Acceptance {
        let reject_once = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.rejecting.load(Ordering::SeqCst) || reject_once {
            self.rejections.fetch_add(1, Ordering::SeqCst);
            return Acceptance::Rejected(task);
        }
        self.dispatched.lock().push((task.id(), task.mode()));
        self.opcodes.lock().push(task.active_command().opcode());
        let reply = (self.script)(&task);
        if !self.asynchronous {
            let (response, status) = reply.apply(&mut task);
            return Acceptance::Completed {
                task,
                response,
                status,
            };
        }
        let pending = self.pending.clone();
        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let (response, status) = reply.apply(&mut task);
            completer.complete(task, response, status);
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Acceptance::Pending
    }
}

/// A direct access device with a removable medium, answering the commands the
/// probe, the poller and the block I/O paths send.
#[derive(Debug)]
pub(crate) struct FakeDisk {
    pub media_present: bool,
    pub removable: bool,
    pub lockable: bool,
    pub locked: bool,
    pub write_protected: bool,
    pub last_lba: u64,
    pub block_size: u32,
    pub write_cache: bool,
    pub ansi_version: u8,
    pub lun_missing: bool,
    /// TEST UNIT READY answers "becoming ready" this many more times.
    pub becoming_ready: u32,
    /// TEST UNIT READY asks for START UNIT until one arrives.
    pub needs_spin_up: bool,
    pub unit_attention: bool,
    /// INQUIRY fails this many more times.
    pub inquiry_failures: u32,
    /// READ CAPACITY fails this many more times, with a medium present.
    pub capacity_failures: u32,
    pub sense: Option<SenseData>,
    pub mode_selects: Vec<Vec<u8>>,
    pub writes: Vec<Vec<u8>>,
    pub sync_caches: u32,
    pub ejects: u32,
}

impl Default for FakeDisk {
    fn default() -> Self {
        FakeDisk {
            media_present: true,
            removable: true,
            lockable: true,
            locked: false,
            write_protected: false,
            last_lba: 0x0003_FFFF,
            block_size: 512,
            write_cache: false,
            ansi_version: 2,
            lun_missing: false,
            becoming_ready: 0,
            needs_spin_up: false,
            unit_attention: false,
            inquiry_failures: 0,
            capacity_failures: 0,
            sense: None,
            mode_selects: Vec::new(),
            writes: Vec::new(),
            sync_caches: 0,
            ejects: 0,
        }
    }
}

impl FakeDisk {
    fn check(&mut self, key: SenseKey, asc: u8, ascq: u8) -> Reply {
        self.sense = Some(SenseData::new(key, asc, ascq));
        Reply::CheckCondition
    }

    fn mode_data(&self, page_code: u8, header_len: usize) -> Vec<u8> {
        let mut data = vec![0u8; header_len];
        let wp = if self.write_protected { 0x80 } else { 0 };
        if header_len == 4 {
            data[2] = wp;
        } else {
            data[3] = wp;
        }
        if page_code == 0x08 || page_code == 0x3F {
            let mut page = vec![0u8; 20];
            page[0] = 0x80 | 0x08;
            page[1] = 0x12;
            page[2] = if self.write_cache { 0b100 } else { 0 };
            data.extend_from_slice(&page);
        }
        let len = data.len() - if header_len == 4 { 1 } else { 2 };
        if header_len == 4 {
            data[0] = len as u8;
        } else {
            data[..2].copy_from_slice(&(len as u16).to_be_bytes());
        }
        data
    }

    pub(crate) fn respond(&mut self, task: &Task) -> Reply {
        let cdb = task.active_command().as_bytes().to_vec();
        match cdb[0] {
            0x00 => {
                if self.lun_missing {
                    self.check(SenseKey::IllegalRequest, 0x25, 0x00)
                } else if self.becoming_ready > 0 {
                    self.becoming_ready -= 1;
                    self.check(SenseKey::NotReady, 0x04, 0x01)
                } else if self.needs_spin_up {
                    self.check(SenseKey::NotReady, 0x04, 0x02)
                } else if self.unit_attention {
                    self.unit_attention = false;
                    self.check(SenseKey::UnitAttention, 0x28, 0x00)
                } else if !self.media_present {
                    self.check(SenseKey::NotReady, 0x3A, 0x00)
                } else {
                    Reply::Good
                }
            }
            0x03 => {
                let sense = self
                    .sense
                    .take()
                    .unwrap_or(SenseData::new(SenseKey::NoSense, 0, 0));
                Reply::Data(sense.to_fixed().to_vec())
            }
            0x12 => {
                if self.inquiry_failures > 0 {
                    self.inquiry_failures -= 1;
                    return Reply::Failure;
                }
                let mut data = vec![0u8; 36];
                data[0] = if self.lun_missing { 0x7F } else { 0 };
                data[1] = if self.removable { 0x80 } else { 0 };
                data[2] = self.ansi_version;
                data[4] = 31;
                data[8..16].copy_from_slice(b"SEAGATE ");
                data[16..32].copy_from_slice(b"FLASH DRIVE     ");
                data[32..36].copy_from_slice(b"1.00");
                Reply::Data(data)
            }
            0x1E => {
                if !self.lockable {
                    return self.check(SenseKey::IllegalRequest, 0x24, 0x00);
                }
                self.locked = cdb[4] & 1 != 0;
                Reply::Good
            }
            0x25 | 0x9E if !self.media_present => self.check(SenseKey::NotReady, 0x3A, 0x00),
            0x25 | 0x9E if self.capacity_failures > 0 => {
                self.capacity_failures -= 1;
                self.check(SenseKey::MediumError, 0x11, 0x00)
            }
            0x25 => {
                let mut data = u32::try_from(self.last_lba)
                    .unwrap_or(u32::MAX)
                    .to_be_bytes()
                    .to_vec();
                data.extend_from_slice(&self.block_size.to_be_bytes());
                Reply::Data(data)
            }
            0x9E => {
                let mut data = self.last_lba.to_be_bytes().to_vec();
                data.extend_from_slice(&self.block_size.to_be_bytes());
                data.resize(32, 0);
                Reply::Data(data)
            }
            0x1A => Reply::Data(self.mode_data(cdb[2] & 0x3F, 4)),
            0x5A => Reply::Data(self.mode_data(cdb[2] & 0x3F, 8)),
            0x15 => {
                self.mode_selects.push(task.buffer().to_vec());
                Reply::Good
            }
            0x1B => {
                let start = cdb[4] & 0b01 != 0;
                let load_eject = cdb[4] & 0b10 != 0;
                if start {
                    self.needs_spin_up = false;
                } else if load_eject {
                    if self.locked {
                        return self.check(SenseKey::IllegalRequest, 0x53, 0x02);
                    }
                    self.media_present = false;
                    self.ejects += 1;
                }
                Reply::Good
            }
            0x28 => {
                let len = task.active_command().data_transfer_len as usize;
                Reply::Data((0..len).map(|i| (i % 251) as u8).collect())
            }
            0x2A => {
                self.writes.push(task.buffer().to_vec());
                Reply::Good
            }
            0x35 => {
                self.sync_caches += 1;
                Reply::Good
            }
            _ => self.check(SenseKey::IllegalRequest, 0x20, 0x00),
        }
    }
}

/// A transport backed by `disk`.
pub(crate) fn disk_transport(
    disk: &Arc<Mutex<FakeDisk>>,
    asynchronous: bool,
) -> Arc<ScriptedTransport> {
    let disk = disk.clone();
    ScriptedTransport::new(asynchronous, move |task: &Task| disk.lock().respond(task))
}
