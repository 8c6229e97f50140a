//! A single opened USB device: endpoint discovery, bulk I/O, and an
//! interrupt event-loop thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rusb::{Direction, TransferType, UsbContext};
use tracing::{debug, trace, warn};

use crate::error::UsbError;
use crate::types::{DeviceEvent, Endpoints, UsbPath};

/// No-timeout sentinel for libusb's synchronous transfer calls: libusb
/// treats a zero millisecond timeout as "block forever". Callers rely on
/// `close()` + cancellation to unblock instead of a deadline.
const NO_TIMEOUT: Duration = Duration::from_millis(0);

/// How long the event-loop thread blocks on each interrupt-IN poll before
/// re-checking the running flag and draining the outgoing-write queue.
const EVENT_LOOP_POLL: Duration = Duration::from_millis(200);

type EventSink = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Lifecycle state: `Constructed -> Opened -> Running -> Closed`. `Closed`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Constructed,
    Opened,
    Running,
    Closed,
}

/// A wrapper around one opened USB device, following the bulk/interrupt
/// conversation the on-wire image-pull protocol requires.
pub struct UsbDevice<T: UsbContext> {
    handle: Arc<Mutex<Option<rusb::DeviceHandle<T>>>>,
    endpoints: Mutex<Endpoints>,
    usb_path: Mutex<Option<UsbPath>>,
    state: Mutex<State>,
    running: Arc<AtomicBool>,
    interrupts_enabled: Arc<AtomicBool>,
    write_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    close_lock: Mutex<()>,
}

impl<T: UsbContext + 'static> UsbDevice<T> {
    /// Wrap a freshly discovered, not-yet-opened device handle.
    pub fn new(handle: rusb::DeviceHandle<T>) -> Self {
        Self {
            handle: Arc::new(Mutex::new(Some(handle))),
            endpoints: Mutex::new(Endpoints::default()),
            usb_path: Mutex::new(None),
            state: Mutex::new(State::Constructed),
            running: Arc::new(AtomicBool::new(false)),
            interrupts_enabled: Arc::new(AtomicBool::new(false)),
            write_tx: Mutex::new(None),
            event_thread: Mutex::new(None),
            close_lock: Mutex::new(()),
        }
    }

    /// Device's stable bus/port identity, available once `open()` succeeds.
    pub fn usb_path(&self) -> Option<UsbPath> {
        self.usb_path.lock().clone()
    }

    /// Bus/port identity read directly from the device descriptor, usable
    /// before `open()` (e.g. to name a just-arrived device).
    pub fn probe_usb_path(&self) -> Option<UsbPath> {
        let guard = self.handle.lock();
        let handle = guard.as_ref()?;
        let device = handle.device();
        let ports = device.port_numbers().ok()?;
        Some(UsbPath::from_bus_and_ports(device.bus_number(), &ports))
    }

    /// Open the handle, claim interface 0, discover endpoints, and start
    /// the per-device event-loop thread.
    pub fn open(&self, event_sink: EventSink) -> Result<(), UsbError> {
        let mut state = self.state.lock();
        if *state != State::Constructed {
            return Err(UsbError::AlreadyClosed);
        }

        let mut guard = self.handle.lock();
        let handle = guard.as_mut().ok_or(UsbError::AlreadyClosed)?;

        let device = handle.device();
        let config = device.active_config_descriptor()?;

        match handle.detach_kernel_driver(0) {
            Ok(()) => debug!("detached kernel driver from interface 0"),
            Err(rusb::Error::NotFound) | Err(rusb::Error::NotSupported) => {}
            Err(e) => warn!("detach_kernel_driver failed (continuing): {e}"),
        }

        handle.claim_interface(0)?;

        let mut endpoints = Endpoints::default();
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                for ep in alt.endpoint_descriptors() {
                    let addr = ep.address();
                    let max_packet_size = ep.max_packet_size();
                    match (ep.direction(), ep.transfer_type()) {
                        (Direction::In, TransferType::Interrupt) => {
                            endpoints.interrupt_in.address = addr;
                            endpoints.interrupt_in.max_packet_size = max_packet_size;
                        }
                        (Direction::Out, TransferType::Interrupt) => {
                            endpoints.interrupt_out.address = addr;
                            endpoints.interrupt_out.max_packet_size = max_packet_size;
                        }
                        (Direction::In, TransferType::Bulk) => {
                            endpoints.bulk_in.address = addr;
                            endpoints.bulk_in.max_packet_size = max_packet_size;
                        }
                        (Direction::Out, TransferType::Bulk) => {
                            endpoints.bulk_out.address = addr;
                            endpoints.bulk_out.max_packet_size = max_packet_size;
                        }
                        _ => {}
                    }
                    if let Err(e) = handle.clear_halt(addr) {
                        trace!("clear_halt({addr:#x}) failed (ignored): {e}");
                    }
                }
            }
        }

        if !endpoints.interrupt_in.is_present() {
            return Err(UsbError::MissingEndpoint("interrupt-in"));
        }
        if !endpoints.bulk_out.is_present() {
            return Err(UsbError::MissingEndpoint("bulk-out"));
        }

        let bus = device.bus_number();
        let ports = device.port_numbers()?;
        let usb_path = UsbPath::from_bus_and_ports(bus, &ports);
        debug!("opened USB device at {usb_path}");

        *self.endpoints.lock() = endpoints;
        *self.usb_path.lock() = Some(usb_path);
        drop(guard);

        self.running.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        *self.write_tx.lock() = Some(tx);

        let running = Arc::clone(&self.running);
        let interrupts_enabled = Arc::clone(&self.interrupts_enabled);
        let endpoints_copy = *self.endpoints.lock();
        let handle_for_thread = Arc::clone(&self.handle);

        let handle_thread = std::thread::Builder::new()
            .name("astra-usb-event-loop".into())
            .spawn(move || {
                event_loop(
                    &handle_for_thread,
                    endpoints_copy,
                    running,
                    interrupts_enabled,
                    rx,
                    event_sink,
                );
            })
            .expect("failed to spawn USB event-loop thread");

        *self.event_thread.lock() = Some(handle_thread);
        *state = State::Opened;
        Ok(())
    }

    /// Permitted after `open()`; marks the device ready to dispatch
    /// interrupt events and accept queued interrupt-OUT writes.
    pub fn enable_interrupts(&self) -> Result<(), UsbError> {
        let mut state = self.state.lock();
        if *state == State::Closed {
            return Err(UsbError::AlreadyClosed);
        }
        self.interrupts_enabled.store(true, Ordering::SeqCst);
        *state = State::Running;
        Ok(())
    }

    /// Synchronous bulk read. A zero duration blocks until data arrives or
    /// the caller unblocks it via `close()`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, UsbError> {
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(UsbError::AlreadyClosed)?;
        let addr = self.endpoints.lock().bulk_in.address;
        handle.read_bulk(addr, buf, NO_TIMEOUT).map_err(UsbError::from_transfer)
    }

    /// Synchronous bulk write. Used exclusively for the image-send burst;
    /// callers must not interleave other bulk writes on the same device.
    pub fn write(&self, buf: &[u8]) -> Result<usize, UsbError> {
        let guard = self.handle.lock();
        let handle = guard.as_ref().ok_or(UsbError::AlreadyClosed)?;
        let addr = self.endpoints.lock().bulk_out.address;
        handle.write_bulk(addr, buf, NO_TIMEOUT).map_err(UsbError::from_transfer)
    }

    /// Queue an interrupt-OUT transfer of exactly `buf.len()` bytes.
    /// Non-blocking: the event-loop thread performs the actual transfer.
    pub fn write_interrupt(&self, buf: &[u8]) -> Result<(), UsbError> {
        let guard = self.write_tx.lock();
        let tx = guard.as_ref().ok_or(UsbError::AlreadyClosed)?;
        tx.send(buf.to_vec())
            .map_err(|_| UsbError::Internal("event loop gone".into()))
    }

    /// Idempotent shutdown: stop the event loop, join its thread, release
    /// the interface, and drop the handle.
    pub fn close(&self) {
        let _close_guard = self.close_lock.lock();
        let mut state = self.state.lock();
        if *state == State::Closed {
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        *self.write_tx.lock() = None;

        if let Some(thread) = self.event_thread.lock().take() {
            let _ = thread.join();
        }

        let mut guard = self.handle.lock();
        if let Some(handle) = guard.as_mut() {
            let _ = handle.release_interface(0);
        }
        *guard = None;

        *state = State::Closed;
    }
}

impl<T: UsbContext> Drop for UsbDevice<T> {
    fn drop(&mut self) {
        // `close()` takes `&self` so callers can invoke it from any thread;
        // nothing left to do here beyond dropping the (already-closed or
        // still-open) handle, which rusb releases on drop either way.
    }
}

fn event_loop<T: UsbContext>(
    handle_mutex: &Mutex<Option<rusb::DeviceHandle<T>>>,
    endpoints: Endpoints,
    running: Arc<AtomicBool>,
    interrupts_enabled: Arc<AtomicBool>,
    write_rx: mpsc::Receiver<Vec<u8>>,
    event_sink: EventSink,
) {
    let mut buf = vec![0u8; endpoints.interrupt_in.max_packet_size.max(64) as usize];

    while running.load(Ordering::SeqCst) {
        if interrupts_enabled.load(Ordering::SeqCst) {
            while let Ok(out) = write_rx.try_recv() {
                let guard = handle_mutex.lock();
                if let Some(handle) = guard.as_ref() {
                    if let Err(e) = handle.write_interrupt(endpoints.interrupt_out.address, &out, NO_TIMEOUT) {
                        warn!("interrupt-out write failed: {e}");
                    }
                }
            }
        }

        let read_result = {
            let guard = handle_mutex.lock();
            match guard.as_ref() {
                Some(handle) => handle.read_interrupt(endpoints.interrupt_in.address, &mut buf, EVENT_LOOP_POLL),
                None => break,
            }
        };

        match read_result {
            Ok(n) => {
                if interrupts_enabled.load(Ordering::SeqCst) {
                    event_sink(DeviceEvent::Interrupt(buf[..n].to_vec()));
                }
            }
            Err(rusb::Error::Timeout) => continue,
            Err(e) => {
                let usb_err = UsbError::from_transfer(e);
                if usb_err.is_disconnect() {
                    event_sink(DeviceEvent::NoDevice);
                    break;
                }
                trace!("interrupt-in read error: {usb_err}");
            }
        }
    }

    if !running.load(Ordering::SeqCst) {
        event_sink(DeviceEvent::TransferCanceled);
    }
}
