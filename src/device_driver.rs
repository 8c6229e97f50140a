//! The per-device state machine: services the on-wire image-pull
//! protocol and drives boot → update → completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rusb::Context;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::boot_firmware::BootFirmware;
use crate::console::{Console, ConsoleError};
use crate::flash_image::FlashImage;
use crate::image::{Image, ImageError};
use crate::manifest::BootConsole;
use crate::manager::UenvResetStyle;
use crate::response::{DeviceResponse, DeviceStatus};
use astra_usb::{DeviceEvent, UsbDevice, UsbError};

/// The literal marker flagging an interrupt message as an image request.
const IMAGE_REQUEST_MARKER: &[u8] = b"i*m*g*r*q*";

/// `1 MiB + 4`, per spec's block buffer size for the image-send loop.
const SEND_BLOCK_SIZE: usize = (1024 * 1024) + 4;

#[derive(Error, Debug)]
pub enum DeviceDriverError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Usb(#[from] UsbError),

    #[error(transparent)]
    Console(#[from] ConsoleError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("requested image {0:?} not found")]
    NotFound(String),

    #[error("short write sending {name:?}: expected {expected} bytes, wrote {actual}")]
    ShortWrite { name: String, expected: u64, actual: u64 },

    #[error("operation attempted on an already-closed driver")]
    AlreadyClosed,
}

#[derive(Debug, Clone)]
enum ImageSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl ImageSource {
    fn into_image(&self, name: &str) -> Image {
        match self {
            ImageSource::Path(p) => Image::from_path(p.clone()),
            ImageSource::Bytes(b) => Image::from_bytes(name.to_string(), b.to_vec()),
        }
    }
}

/// The shared image catalog: flash images, firmware images, and synthetic
/// images, resolved in that priority order.
#[derive(Default)]
struct ImageCatalog {
    flash: Vec<(String, ImageSource)>,
    firmware: Vec<(String, ImageSource)>,
    synthetic: Vec<(String, ImageSource)>,
}

impl ImageCatalog {
    fn resolve(&self, name: &str) -> Option<ImageSource> {
        self.flash
            .iter()
            .chain(self.firmware.iter())
            .chain(self.synthetic.iter())
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecyclePhase {
    Boot,
    Update,
    Done,
}

struct PendingRequest {
    name: String,
    image_type: u8,
}

/// A parsed interrupt-IN payload: either console text or an image pull.
enum InterruptMessage {
    Console(Vec<u8>),
    ImageRequest { image_type: u8, name: String },
}

fn parse_interrupt_message(data: &[u8]) -> InterruptMessage {
    let marker_pos = data
        .windows(IMAGE_REQUEST_MARKER.len())
        .position(|w| w == IMAGE_REQUEST_MARKER);

    let Some(pos) = marker_pos else {
        return InterruptMessage::Console(data.to_vec());
    };

    let rest = &data[pos + IMAGE_REQUEST_MARKER.len()..];
    if rest.is_empty() {
        return InterruptMessage::Console(data.to_vec());
    }

    let image_type = rest[0];
    let name_bytes = &rest[1..];
    let nul_trimmed = match name_bytes.iter().position(|&b| b == 0) {
        Some(nul_pos) => &name_bytes[..nul_pos],
        None => name_bytes,
    };
    let full_name = String::from_utf8_lossy(nul_trimmed).into_owned();

    let name = match full_name.split_once('/') {
        Some((_prefix, suffix)) => suffix.to_string(),
        None => full_name,
    };

    InterruptMessage::ImageRequest { image_type, name }
}

/// Services the boot/update protocol for one opened USB device.
pub struct DeviceDriver {
    usb_device: Arc<UsbDevice<Context>>,
    device_name: Mutex<String>,
    temp_dir: PathBuf,
    images: Mutex<ImageCatalog>,
    console: Mutex<Option<Arc<Console>>>,
    status_callback: Mutex<Option<Arc<dyn Fn(DeviceResponse) + Send + Sync>>>,
    running: Arc<AtomicBool>,
    pending: Arc<Mutex<Option<PendingRequest>>>,
    pending_condvar: Arc<Condvar>,
    ready: Arc<(Mutex<bool>, Condvar)>,
    device_gone: Arc<(Mutex<bool>, Condvar)>,
    worker_thread: Mutex<Option<JoinHandle<()>>>,
    phase: Mutex<LifecyclePhase>,
    final_boot_image_name: Mutex<String>,
    final_update_image_name: Mutex<Option<String>>,
    close_lock: Mutex<()>,
}

impl DeviceDriver {
    /// Wrap a freshly opened USB device. Returned wrapped in `Arc` because
    /// the event sink registered in `boot()` needs a handle back to self.
    pub fn new(usb_device: Arc<UsbDevice<Context>>, temp_dir: PathBuf) -> Arc<Self> {
        Arc::new(DeviceDriver {
            usb_device,
            device_name: Mutex::new(String::new()),
            temp_dir,
            images: Mutex::new(ImageCatalog::default()),
            console: Mutex::new(None),
            status_callback: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(None)),
            pending_condvar: Arc::new(Condvar::new()),
            ready: Arc::new((Mutex::new(false), Condvar::new())),
            device_gone: Arc::new((Mutex::new(false), Condvar::new())),
            worker_thread: Mutex::new(None),
            phase: Mutex::new(LifecyclePhase::Boot),
            final_boot_image_name: Mutex::new(String::new()),
            final_update_image_name: Mutex::new(None),
            close_lock: Mutex::new(()),
        })
    }

    pub fn set_status_callback(&self, callback: Arc<dyn Fn(DeviceResponse) + Send + Sync>) {
        *self.status_callback.lock() = Some(callback);
    }

    /// Emit `Added` right after discovery, before `boot()` opens the
    /// device. Uses the pre-open bus/port probe for the device name since
    /// the device isn't claimed yet.
    pub fn emit_added(&self) {
        let usb_path = self.usb_device.probe_usb_path();
        let name = match usb_path {
            Some(path) => format!("device:{path}"),
            None => String::new(),
        };
        *self.device_name.lock() = name;
        self.emit(DeviceStatus::Added, 0.0, "", "");
    }

    fn emit(&self, status: DeviceStatus, progress: f64, image: &str, message: &str) {
        if let Some(callback) = self.status_callback.lock().as_ref() {
            callback(DeviceResponse {
                device: self.device_name.lock().clone(),
                status,
                progress,
                image: image.to_string(),
                message: message.to_string(),
            });
        }
    }

    /// Open the USB device, bind a console, register the firmware's
    /// images, and start servicing image-pull requests.
    pub fn boot(self: &Arc<Self>, firmware: &BootFirmware) -> Result<(), DeviceDriverError> {
        let driver = Arc::clone(self);
        self.usb_device.open(Arc::new(move |event: DeviceEvent| driver.handle_event(event)))?;

        let usb_path = self.usb_device.usb_path().expect("usb_path set by open()");
        let device_name = format!("device:{usb_path}");
        *self.device_name.lock() = device_name.clone();

        let console = Arc::new(Console::new(&self.temp_dir, &device_name)?);
        *self.console.lock() = Some(console);

        std::fs::write(self.temp_dir.join("06_IMAGE"), usb_path.to_string().as_bytes())?;
        std::fs::write(self.temp_dir.join("07_IMAGE"), 0u32.to_le_bytes())?;

        {
            let mut images = self.images.lock();
            images.synthetic.push(("06_IMAGE".to_string(), ImageSource::Bytes(Arc::from(usb_path.to_string().into_bytes()))));
            images.synthetic.push(("07_IMAGE".to_string(), ImageSource::Path(self.temp_dir.join("07_IMAGE"))));
            for image in firmware.images() {
                images.firmware.push((image.name().to_string(), ImageSource::Path(image.path().expect("firmware images are file-backed").to_path_buf())));
            }
        }
        *self.final_boot_image_name.lock() = firmware.final_boot_image_name().to_string();

        self.emit(DeviceStatus::Opened, 0.0, "", "");

        self.running.store(true, Ordering::SeqCst);
        *self.phase.lock() = LifecyclePhase::Boot;
        self.emit(DeviceStatus::BootStart, 0.0, "", "");

        let thread = spawn_worker(Arc::clone(self));
        *self.worker_thread.lock() = Some(thread);

        {
            let (lock, cvar) = &*self.ready;
            let mut ready = lock.lock();
            while !*ready {
                cvar.wait(&mut ready);
            }
        }

        self.usb_device.enable_interrupts()?;
        Ok(())
    }

    /// Append the flash image's files and, for uEnv-capable firmware,
    /// write `uEnv.txt` so the target can pull it next.
    pub fn update(&self, flash_image: &FlashImage, uenv_support: bool, bootloader_console: BootConsole, uenv_reset_style: UenvResetStyle) -> Result<(), DeviceDriverError> {
        {
            let mut images = self.images.lock();
            for image in flash_image.images() {
                images
                    .flash
                    .push((image.name().to_string(), ImageSource::Path(image.path().expect("flash images are file-backed").to_path_buf())));
            }
        }
        *self.final_update_image_name.lock() = Some(flash_image.final_image_name().to_string());
        *self.phase.lock() = LifecyclePhase::Update;
        self.emit(DeviceStatus::UpdateStart, 0.0, "", "");

        if uenv_support {
            let content = match uenv_reset_style {
                UenvResetStyle::Reset => "bootcmd=reset".to_string(),
                UenvResetStyle::FlashCommandThenReset => format!("bootcmd={}; reset", flash_image.flash_command),
            };
            let uenv_path = self.temp_dir.join("uEnv.txt");
            std::fs::write(&uenv_path, &content)?;
            self.images.lock().synthetic.push(("uEnv.txt".to_string(), ImageSource::Path(uenv_path)));
        } else if bootloader_console == BootConsole::Usb {
            let console = self.console.lock().clone().expect("console bound during boot()");
            if console.wait_for_prompt() {
                let command = format!("{}\n", flash_image.flash_command);
                self.usb_device.write_interrupt(command.as_bytes())?;
            }
        }
        // UART console: nothing to do, the external UART driver sends the
        // flash command itself.

        Ok(())
    }

    /// Boot-only mode's analogue of `update()`: wait for the prompt and
    /// send an explicit boot command instead of flashing anything. A
    /// no-op on UART consoles, where the external UART driver is
    /// responsible for issuing commands.
    pub fn run_boot_command(&self, command: &str, bootloader_console: BootConsole) -> Result<(), DeviceDriverError> {
        if bootloader_console != BootConsole::Usb {
            return Ok(());
        }
        let console = self.console.lock().clone().expect("console bound during boot()");
        if console.wait_for_prompt() {
            let line = format!("{command}\n");
            self.usb_device.write_interrupt(line.as_bytes())?;
        }
        Ok(())
    }

    /// Block until the device signals completion of the update phase.
    pub fn wait_for_completion(&self, uenv_support: bool, bootloader_console: BootConsole) {
        if uenv_support {
            let (lock, cvar) = &*self.device_gone;
            let mut gone = lock.lock();
            while !*gone && self.running.load(Ordering::SeqCst) {
                cvar.wait(&mut gone);
            }
        } else if bootloader_console == BootConsole::Usb {
            if let Some(console) = self.console.lock().clone() {
                if console.wait_for_prompt() {
                    let _ = self.usb_device.write_interrupt(b"reset\n");
                }
            }
        }
    }

    /// Whether the driver reached `UpdateComplete` before `close()`.
    pub fn update_completed(&self) -> bool {
        *self.phase.lock() == LifecyclePhase::Done
    }

    fn handle_event(&self, event: DeviceEvent) {
        match event {
            DeviceEvent::Interrupt(data) => match parse_interrupt_message(&data) {
                InterruptMessage::Console(bytes) => {
                    if let Some(console) = self.console.lock().as_ref() {
                        console.append(&String::from_utf8_lossy(&bytes));
                    }
                }
                InterruptMessage::ImageRequest { image_type, name } => {
                    trace!("image request: type={image_type:#x} name={name:?}");
                    *self.pending.lock() = Some(PendingRequest { name, image_type });
                    self.pending_condvar.notify_all();
                }
            },
            DeviceEvent::NoDevice => {
                debug!("device disappeared");
                self.running.store(false, Ordering::SeqCst);
                self.pending_condvar.notify_all();
                let (lock, cvar) = &*self.device_gone;
                *lock.lock() = true;
                cvar.notify_all();
            }
            DeviceEvent::TransferCanceled => {
                self.pending_condvar.notify_all();
            }
        }
    }

    fn send_image(&self, name: &str, image_type: u8, mut image: Image) -> Result<(), DeviceDriverError> {
        image.load()?;
        let total = image.size() + 8;

        self.emit(DeviceStatus::ImageSendStart, 0.0, name, "");

        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&(image.size() as u32).to_le_bytes());
        self.usb_device.write(&header)?;
        let mut transferred = header.len() as u64;
        self.emit(DeviceStatus::ImageSendProgress, progress_pct(transferred, total), name, "");

        let mut buf = vec![0u8; SEND_BLOCK_SIZE];
        loop {
            let n = image.read_block(&mut buf)?;
            if n == 0 {
                break;
            }
            self.usb_device.write(&buf[..n])?;
            transferred += n as u64;
            self.emit(DeviceStatus::ImageSendProgress, progress_pct(transferred, total), name, "");
        }

        if transferred != total {
            self.emit(DeviceStatus::ImageSendFail, progress_pct(transferred, total), name, "short write");
            return Err(DeviceDriverError::ShortWrite {
                name: name.to_string(),
                expected: total,
                actual: transferred,
            });
        }

        if image_type > 0x79 {
            std::fs::write(self.temp_dir.join("07_IMAGE"), (image.size() as u32).to_le_bytes())?;
        }

        self.emit(DeviceStatus::ImageSendComplete, 100.0, name, "");
        Ok(())
    }

    /// One iteration of the image-request worker loop: resolve the
    /// pending name, send it, and advance the boot/update state machine.
    fn service_one_request(&self, request: PendingRequest) -> Result<(), DeviceDriverError> {
        let source = self.images.lock().resolve(&request.name);
        let Some(source) = source else {
            self.emit(DeviceStatus::ImageSendFail, 0.0, &request.name, "not found");
            return Err(DeviceDriverError::NotFound(request.name));
        };

        let image = source.into_image(&request.name);
        self.send_image(&request.name, request.image_type, image)?;

        let phase = *self.phase.lock();
        match phase {
            LifecyclePhase::Boot => {
                self.emit(DeviceStatus::BootProgress, 0.0, &request.name, "");
                let final_name = self.final_boot_image_name.lock().clone();
                if !final_name.is_empty() && request.name.contains(&final_name) {
                    self.emit(DeviceStatus::BootComplete, 100.0, &request.name, "");
                }
            }
            LifecyclePhase::Update => {
                self.emit(DeviceStatus::UpdateProgress, 0.0, &request.name, "");
                let final_name = self.final_update_image_name.lock().clone();
                if let Some(final_name) = final_name {
                    if request.name.contains(&final_name) {
                        self.emit(DeviceStatus::UpdateComplete, 100.0, &request.name, "");
                        *self.phase.lock() = LifecyclePhase::Done;
                    }
                }
            }
            LifecyclePhase::Done => {}
        }

        Ok(())
    }

    /// Idempotent shutdown: stop the worker, the console, and the USB
    /// device.
    pub fn close(&self) {
        let _guard = self.close_lock.lock();
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.pending_condvar.notify_all();
        {
            let (lock, cvar) = &*self.ready;
            *lock.lock() = true;
            cvar.notify_all();
        }
        {
            let (lock, cvar) = &*self.device_gone;
            *lock.lock() = true;
            cvar.notify_all();
        }

        if let Some(thread) = self.worker_thread.lock().take() {
            let _ = thread.join();
        }

        if let Some(console) = self.console.lock().take() {
            console.shutdown();
        }

        self.usb_device.close();
        self.emit(DeviceStatus::Closed, 0.0, "", "");
    }
}

fn progress_pct(transferred: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (transferred as f64 / total as f64) * 100.0
    }
}

fn spawn_worker(driver: Arc<DeviceDriver>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("astra-image-request-worker".into())
        .spawn(move || {
            {
                let (lock, cvar) = &*driver.ready;
                let mut ready = lock.lock();
                *ready = true;
                cvar.notify_all();
            }

            loop {
                if !driver.running.load(Ordering::SeqCst) {
                    break;
                }

                let request = {
                    let mut pending = driver.pending.lock();
                    loop {
                        if !driver.running.load(Ordering::SeqCst) {
                            return;
                        }
                        if let Some(request) = pending.take() {
                            break request;
                        }
                        driver.pending_condvar.wait(&mut pending);
                    }
                };

                if let Err(e) = driver.service_one_request(request) {
                    warn!("image-request worker stopping: {e}");
                    driver.running.store(false, Ordering::SeqCst);
                    let phase = *driver.phase.lock();
                    match phase {
                        LifecyclePhase::Boot => driver.emit(DeviceStatus::BootFail, 0.0, "", &e.to_string()),
                        LifecyclePhase::Update => driver.emit(DeviceStatus::UpdateFail, 0.0, "", &e.to_string()),
                        LifecyclePhase::Done => {}
                    }
                    break;
                }
            }
        })
        .expect("failed to spawn image-request worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_text_without_marker_is_not_a_request() {
        match parse_interrupt_message(b"U-Boot 2021.01\n") {
            InterruptMessage::Console(_) => {}
            InterruptMessage::ImageRequest { .. } => panic!("expected console text"),
        }
    }

    #[test]
    fn marker_with_type_and_name_is_an_image_request() {
        let mut data = IMAGE_REQUEST_MARKER.to_vec();
        data.push(0x01);
        data.extend_from_slice(b"minildr.img\0\0\0");
        match parse_interrupt_message(&data) {
            InterruptMessage::ImageRequest { image_type, name } => {
                assert_eq!(image_type, 0x01);
                assert_eq!(name, "minildr.img");
            }
            InterruptMessage::Console(_) => panic!("expected image request"),
        }
    }

    #[test]
    fn name_prefix_before_slash_is_discarded() {
        let mut data = IMAGE_REQUEST_MARKER.to_vec();
        data.push(0x02);
        data.extend_from_slice(b"boot/uEnv.txt\0");
        match parse_interrupt_message(&data) {
            InterruptMessage::ImageRequest { name, .. } => assert_eq!(name, "uEnv.txt"),
            InterruptMessage::Console(_) => panic!("expected image request"),
        }
    }

    #[test]
    fn marker_with_only_type_byte_resolves_to_empty_name() {
        let mut data = IMAGE_REQUEST_MARKER.to_vec();
        data.push(0x00);
        data.push(0x00);
        match parse_interrupt_message(&data) {
            InterruptMessage::ImageRequest { name, .. } => assert_eq!(name, ""),
            InterruptMessage::Console(_) => panic!("expected image request"),
        }
    }

    #[test]
    fn progress_percentage_reaches_exactly_100() {
        assert_eq!(progress_pct(24, 24), 100.0);
        assert_eq!(progress_pct(0, 0), 100.0);
        assert_eq!(progress_pct(12, 24), 50.0);
    }
}
