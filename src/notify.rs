//! Asynchronous dispatch of device property-change notifications.
//!
//! Posting ORs the changed properties into a pending mask and wakes a
//! dedicated worker through a one-slot channel; the worker swaps the mask out
//! and calls the sink. Edges posted while the sink is busy coalesce into the
//! next delivery instead of being dropped, and neither the caller of
//! start/stop nor the IO cycle ever runs sink code.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError, bounded};
use tracing::{debug, warn};

/// Device properties whose values depend on aggregate IO state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceProperty {
    /// Whether any client is running IO on the device.
    DeviceIsRunning = 1,
    /// Whether any client other than the app client is running IO.
    DeviceIsRunningSomewhereOtherThanApp = 2,
}

/// One coalesced notification carrying up to two changed properties.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertiesChanged {
    properties: [Option<DeviceProperty>; 2],
}

impl PropertiesChanged {
    /// Build from the two edge flags; `None` if neither fired.
    pub fn from_edges(device_running: bool, running_elsewhere: bool) -> Option<Self> {
        let properties = match (device_running, running_elsewhere) {
            (false, false) => return None,
            (true, false) => [Some(DeviceProperty::DeviceIsRunning), None],
            (false, true) => [Some(DeviceProperty::DeviceIsRunningSomewhereOtherThanApp), None],
            (true, true) => [
                Some(DeviceProperty::DeviceIsRunning),
                Some(DeviceProperty::DeviceIsRunningSomewhereOtherThanApp),
            ],
        };
        Some(Self { properties })
    }

    /// Rebuild from a pending-property mask; `None` if no bit is set.
    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::from_edges(
            bits & DeviceProperty::DeviceIsRunning as u32 != 0,
            bits & DeviceProperty::DeviceIsRunningSomewhereOtherThanApp as u32 != 0,
        )
    }

    /// Mask with one bit per changed property.
    pub fn bits(&self) -> u32 {
        self.properties().fold(0, |bits, property| bits | property as u32)
    }

    /// Changed properties in order.
    pub fn properties(&self) -> impl Iterator<Item = DeviceProperty> + '_ {
        self.properties.iter().flatten().copied()
    }

    /// Number of changed properties.
    pub fn len(&self) -> usize {
        self.properties().count()
    }

    /// Always false for a constructed notification.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `property` is among the changes.
    pub fn contains(&self, property: DeviceProperty) -> bool {
        self.properties().any(|p| p == property)
    }
}

/// Receiver of property-change notifications. Called on the notifier thread.
pub trait NotificationSink: Send + 'static {
    /// Handle one coalesced notification.
    fn properties_changed(&mut self, change: PropertiesChanged);
}

impl<F> NotificationSink for F
where
    F: FnMut(PropertiesChanged) + Send + 'static,
{
    fn properties_changed(&mut self, change: PropertiesChanged) {
        self(change)
    }
}

/// Sink that drops every notification.
#[derive(Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn properties_changed(&mut self, _change: PropertiesChanged) {}
}

/// Pending-property mask plus the worker thread that delivers it.
pub struct Notifier {
    pending: Arc<AtomicU32>,
    wake: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Notifier {
    /// Spawn the worker thread delivering into `sink`.
    pub fn spawn(mut sink: impl NotificationSink) -> std::io::Result<Self> {
        let pending = Arc::new(AtomicU32::new(0));
        let (wake, woken) = bounded::<()>(1);
        let worker_pending = Arc::clone(&pending);
        let worker = thread::Builder::new()
            .name("client-engine-notify".to_string())
            .spawn(move || {
                for () in woken.iter() {
                    deliver(&worker_pending, &mut sink);
                }
                deliver(&worker_pending, &mut sink);
            })?;
        Ok(Self {
            pending,
            wake: Some(wake),
            worker: Some(worker),
        })
    }

    /// Record a change and wake the worker without blocking.
    ///
    /// Returns false only if the worker is gone.
    pub fn post(&self, change: PropertiesChanged) -> bool {
        self.pending.fetch_or(change.bits(), Ordering::AcqRel);
        let Some(wake) = &self.wake else {
            return false;
        };
        match wake.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!(?change, "coalescing property change into pending delivery");
                true
            }
            Err(TrySendError::Disconnected(())) => {
                warn!(?change, "notification worker gone");
                false
            }
        }
    }
}

fn deliver<S: NotificationSink>(pending: &AtomicU32, sink: &mut S) {
    if let Some(change) = PropertiesChanged::from_bits(pending.swap(0, Ordering::AcqRel)) {
        debug!(?change, "dispatching property change");
        sink.properties_changed(change);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // Closing the channel ends the worker's loop after a final delivery.
        self.wake.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
