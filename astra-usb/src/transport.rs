//! Discovers and tracks devices matching a single VID/PID pair, using
//! libusb hotplug notifications when the platform supports them and
//! falling back to polling otherwise.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rusb::{Context, Hotplug, UsbContext};
use tracing::{debug, info, warn};

use crate::device::UsbDevice;
use crate::error::UsbError;

/// How often the polling fallback rescans the bus when hotplug
/// notifications aren't available.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

type DeviceAddedCallback = Arc<dyn Fn(UsbDevice<Context>) + Send + Sync>;

/// Tracks arrivals of devices matching one VID/PID pair and hands each
/// newly seen device to the caller's callback.
pub struct UsbTransport {
    context: Context,
    running: Arc<AtomicBool>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    hotplug_registration: Mutex<Option<rusb::Registration<Context>>>,
    shutdown_lock: Mutex<()>,
}

impl UsbTransport {
    /// Create a libusb context. Does not start monitoring; call `init()`.
    /// When `debug` is set, raises libusb's own log level so wire-level
    /// detail shows up alongside this crate's `tracing` output.
    pub fn new(debug: bool) -> Result<Self, UsbError> {
        let context = Context::new()?;
        if debug {
            context.set_log_level(rusb::LogLevel::Debug);
        }
        Ok(Self {
            context,
            running: Arc::new(AtomicBool::new(false)),
            monitor_thread: Mutex::new(None),
            hotplug_registration: Mutex::new(None),
            shutdown_lock: Mutex::new(()),
        })
    }

    /// Begin watching for `vendor_id`/`product_id` devices. `on_device_added`
    /// is invoked once per arrival, including devices already plugged in at
    /// call time, from a dedicated monitor thread.
    pub fn init(&self, vendor_id: u16, product_id: u16, on_device_added: DeviceAddedCallback) -> Result<(), UsbError> {
        self.running.store(true, Ordering::SeqCst);

        if rusb::has_hotplug() {
            debug!("libusb hotplug support detected, registering callback for {vendor_id:04x}:{product_id:04x}");
            let handler = HotplugHandler {
                on_device_added: Arc::clone(&on_device_added),
            };
            let registration = rusb::HotplugBuilder::new()
                .vendor_id(vendor_id)
                .product_id(product_id)
                .enumerate(true)
                .register(self.context.clone(), Box::new(handler))?;
            *self.hotplug_registration.lock() = Some(registration);

            let running = Arc::clone(&self.running);
            let context = self.context.clone();
            let thread = std::thread::Builder::new()
                .name("astra-usb-hotplug".into())
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        if let Err(e) = context.handle_events(Some(Duration::from_millis(200))) {
                            warn!("libusb event handling error: {e}");
                        }
                    }
                })
                .expect("failed to spawn libusb hotplug thread");
            *self.monitor_thread.lock() = Some(thread);
        } else {
            info!("platform has no libusb hotplug support, falling back to polling every {POLL_INTERVAL:?}");
            let running = Arc::clone(&self.running);
            let context = self.context.clone();
            let thread = std::thread::Builder::new()
                .name("astra-usb-poll".into())
                .spawn(move || poll_loop(context, vendor_id, product_id, running, on_device_added))
                .expect("failed to spawn USB polling thread");
            *self.monitor_thread.lock() = Some(thread);
        }

        Ok(())
    }

    /// Idempotent: deregister the hotplug callback (if any), stop the
    /// monitor/polling thread, and join it.
    pub fn shutdown(&self) {
        let _guard = self.shutdown_lock.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(registration) = self.hotplug_registration.lock().take() {
            self.context.unregister_callback(registration);
        }

        if let Some(thread) = self.monitor_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs `on_device_added` for a newly discovered device, catching panics
/// so a misbehaving caller callback can't take down the hotplug or
/// polling thread.
fn invoke_device_added(on_device_added: &DeviceAddedCallback, device: UsbDevice<Context>) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| on_device_added(device)));
    if let Err(e) = result {
        warn!("device-added callback panicked: {e:?}");
    }
}

/// Classify a failed `device.open()` call and log at a severity matching
/// whether the device simply vanished between enumeration and open (routine
/// under hotplug churn) or something else went wrong.
fn log_open_failure(context: &str, device: &rusb::Device<Context>, e: rusb::Error) -> UsbError {
    let usb_err = match e {
        rusb::Error::NoDevice => {
            let vendor_id = device.device_descriptor().map(|d| d.vendor_id()).unwrap_or(0);
            let product_id = device.device_descriptor().map(|d| d.product_id()).unwrap_or(0);
            UsbError::DeviceNotFound(format!("{vendor_id:04x}:{product_id:04x}"))
        }
        other => UsbError::Libusb(other),
    };
    if usb_err.is_disconnect() {
        debug!("{context}: device gone before open: {usb_err}");
    } else {
        warn!("{context}: failed to open device: {usb_err}");
    }
    usb_err
}

struct HotplugHandler {
    on_device_added: DeviceAddedCallback,
}

impl Hotplug<Context> for HotplugHandler {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        match device.open() {
            Ok(handle) => {
                debug!(
                    "device arrived: {:04x}:{:04x}",
                    device.device_descriptor().map(|d| d.vendor_id()).unwrap_or(0),
                    device.device_descriptor().map(|d| d.product_id()).unwrap_or(0)
                );
                invoke_device_added(&self.on_device_added, UsbDevice::new(handle));
            }
            Err(e) => {
                log_open_failure("hotplug arrival", &device, e);
            }
        }
    }

    fn device_left(&mut self, _device: rusb::Device<Context>) {
        // Per-device disconnect handling happens in UsbDevice's own
        // event-loop thread, which observes NO_DEVICE on its next transfer.
    }
}

fn poll_loop(
    context: Context,
    vendor_id: u16,
    product_id: u16,
    running: Arc<AtomicBool>,
    on_device_added: DeviceAddedCallback,
) {
    let mut known = std::collections::HashSet::new();

    while running.load(Ordering::SeqCst) {
        match context.devices() {
            Ok(list) => {
                let mut seen = std::collections::HashSet::new();
                for device in list.iter() {
                    let desc = match device.device_descriptor() {
                        Ok(d) => d,
                        Err(_) => continue,
                    };
                    if desc.vendor_id() != vendor_id || desc.product_id() != product_id {
                        continue;
                    }
                    let key = (device.bus_number(), device.address());
                    seen.insert(key);
                    if !known.contains(&key) {
                        match device.open() {
                            Ok(handle) => invoke_device_added(&on_device_added, UsbDevice::new(handle)),
                            Err(e) => {
                                log_open_failure("poll", &device, e);
                            }
                        }
                    }
                }
                known = seen;
            }
            Err(e) => warn!("device list enumeration failed: {e}"),
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}
