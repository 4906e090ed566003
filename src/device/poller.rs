//! Periodic media detection.
//!
//! While no medium is present the poller sends TEST UNIT READY every interval.
//! When one shows up it is locked if possible, measured and announced. A locked
//! medium cannot go away behind our back, so polling then stops. One that cannot
//! be locked is watched until TEST UNIT READY says it is gone.
//!
//! A scheduled tick holds a [`TickReference`] on the poller. Whoever takes the
//! tick out of its slot, the tick itself or [`MediaPoller::disable`], owns that
//! reference, so a tick runs at most once and cancellation never races it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{DeviceContext, MediaEvent};
use crate::scsi::sense::{Outcome, classify};
use crate::task::ServiceResponse;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollingState {
    Suspended,
    PollForNewMedia,
    PollForMediaRemoval,
}

struct Control {
    state: PollingState,
    enabled: bool,
    /// A tick is evaluating right now.
    running: bool,
    scheduled: Option<ScheduledTick>,
    generation: u64,
}

struct ScheduledTick {
    generation: u64,
    handle: JoinHandle<()>,
    reference: TickReference,
}

/// The hold a pending tick keeps on the poller.
struct TickReference {
    inner: Arc<PollerInner>,
}

impl TickReference {
    fn acquire(inner: &Arc<PollerInner>) -> Self {
        inner.references.fetch_add(1, Ordering::SeqCst);
        TickReference {
            inner: Arc::clone(inner),
        }
    }
}

impl Drop for TickReference {
    fn drop(&mut self) {
        self.inner.references.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PollerInner {
    context: Arc<DeviceContext>,
    control: Mutex<Control>,
    references: AtomicUsize,
}

pub struct MediaPoller {
    inner: Arc<PollerInner>,
}

impl MediaPoller {
    pub(crate) fn new(context: Arc<DeviceContext>) -> Self {
        MediaPoller {
            inner: Arc::new(PollerInner {
                context,
                control: Mutex::new(Control {
                    state: PollingState::Suspended,
                    enabled: false,
                    running: false,
                    scheduled: None,
                    generation: 0,
                }),
                references: AtomicUsize::new(0),
            }),
        }
    }

    pub fn state(&self) -> PollingState {
        self.inner.control.lock().state
    }

    /// Scheduled ticks still holding the poller. Zero once disabled.
    pub fn held_references(&self) -> usize {
        self.inner.references.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.control.lock().enabled
    }

    /// Start polling, from whatever the current medium state calls for.
    pub fn enable(&self) {
        let mut control = self.inner.control.lock();
        control.enabled = true;
        if control.state == PollingState::Suspended {
            control.state = self.inner.resume_state();
        }
        if control.state != PollingState::Suspended
            && !control.running
            && control.scheduled.is_none()
        {
            trace!(state = ?control.state, "polling enabled");
            schedule(&self.inner, &mut control, Duration::ZERO);
        }
    }

    /// Stop polling. A tick that is already evaluating finishes, but schedules
    /// nothing further.
    pub fn disable(&self) {
        let cancelled = {
            let mut control = self.inner.control.lock();
            control.enabled = false;
            control.state = PollingState::Suspended;
            control.scheduled.take()
        };
        if let Some(tick) = cancelled {
            trace!(generation = tick.generation, "pending tick cancelled");
            tick.handle.abort();
        }
    }
}

impl Drop for MediaPoller {
    fn drop(&mut self) {
        self.disable();
    }
}

/// Arm a tick `delay` from now. The caller holds the control lock.
fn schedule(inner: &Arc<PollerInner>, control: &mut Control, delay: Duration) {
    control.generation += 1;
    let generation = control.generation;
    let weak: Weak<PollerInner> = Arc::downgrade(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = weak.upgrade() {
            PollerInner::fire(inner, generation).await;
        }
    });
    control.scheduled = Some(ScheduledTick {
        generation,
        handle,
        reference: TickReference::acquire(inner),
    });
}

impl PollerInner {
    fn resume_state(&self) -> PollingState {
        let state = self.context.state();
        if !state.media_present {
            PollingState::PollForNewMedia
        } else if state.removal_prevented || !self.context.characteristics.removable {
            PollingState::Suspended
        } else {
            PollingState::PollForMediaRemoval
        }
    }

    async fn fire(inner: Arc<PollerInner>, generation: u64) {
        let (state, reference) = {
            let mut control = inner.control.lock();
            let Some(tick) = control
                .scheduled
                .take_if(|tick| tick.generation == generation)
            else {
                // Lost to disable()
                return;
            };
            control.running = true;
            (control.state, tick.reference)
        };

        let (next, delay) = inner.evaluate(state).await;

        {
            let mut control = inner.control.lock();
            control.running = false;
            if control.enabled {
                control.state = next;
                if next != PollingState::Suspended && control.scheduled.is_none() {
                    schedule(&inner, &mut control, delay);
                }
            } else {
                control.state = PollingState::Suspended;
            }
        }
        drop(reference);
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn evaluate(&self, state: PollingState) -> (PollingState, Duration) {
        let interval = self.context.config.poll_interval;
        match state {
            PollingState::Suspended => (PollingState::Suspended, interval),
            PollingState::PollForNewMedia => (self.poll_for_new_media().await, interval),
            PollingState::PollForMediaRemoval => self.poll_for_removal().await,
        }
    }

    async fn poll_for_new_media(&self) -> PollingState {
        let context = &self.context;
        let tur = context.command_set().test_unit_ready();
        let task = match context.run(tur, context.config.control_timeout).await {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "TEST UNIT READY not issued");
                return PollingState::PollForNewMedia;
            }
        };
        if !task.is_good() {
            if classify(task.status(), task.sense_data().as_ref()) == Outcome::NotReadySpinUp {
                debug!("medium needs START UNIT");
                context.spin_up().await;
            }
            trace!("no medium");
            return PollingState::PollForNewMedia;
        }

        let removable = context.characteristics.removable;
        let locked = removable && context.set_removal_prevented(true).await;
        let Some(capacity) = context.read_capacity().await else {
            debug!("medium present but its capacity is unknown");
            if locked {
                context.set_removal_prevented(false).await;
            }
            return PollingState::PollForNewMedia;
        };
        let write_protected = context.write_protect_state().await.unwrap_or(false);
        let manual_eject = removable && !locked;

        context.update_state(|state| {
            state.media_present = true;
            state.block_count = capacity.block_count;
            state.block_size = capacity.block_size;
            state.write_protected = write_protected;
            state.removal_prevented = locked;
            if manual_eject {
                state.manual_eject = true;
                state.device_shared = true;
            }
        });
        info!(
            block_count = capacity.block_count,
            block_size = capacity.block_size,
            write_protected,
            locked,
            "medium online"
        );
        context.notify(MediaEvent::Online {
            block_count: capacity.block_count,
            block_size: capacity.block_size,
            write_protected,
        });
        if manual_eject {
            PollingState::PollForMediaRemoval
        } else {
            PollingState::Suspended
        }
    }

    async fn poll_for_removal(&self) -> (PollingState, Duration) {
        let context = &self.context;
        let interval = context.config.poll_interval;
        let tur = context.command_set().test_unit_ready();
        let task = match context.run(tur, context.config.control_timeout).await {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "TEST UNIT READY not issued");
                return (PollingState::PollForMediaRemoval, interval);
            }
        };
        if task.service_response() != ServiceResponse::TaskComplete {
            return (PollingState::PollForMediaRemoval, interval);
        }
        match classify(task.status(), task.sense_data().as_ref()) {
            Outcome::NoMedia | Outcome::MediaChanged => {
                context.media_offline();
                // Look for the next medium right away
                (PollingState::PollForNewMedia, Duration::ZERO)
            }
            _ => (PollingState::PollForMediaRemoval, interval),
        }
    }
}
