//! Selects boot firmware for the observed device, owns the transport and
//! per-device workers, and merges their reports through one callback.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusb::Context;
use tracing::{error, info, Level};

use crate::boot_firmware::{BootFirmware, BootFirmwareCollection};
use crate::device_driver::DeviceDriver;
use crate::error::AstraError;
use crate::flash_image::FlashImage;
use crate::logging;
use crate::response::{DeviceResponse, DeviceStatus, ManagerResponse, ManagerStatus, Response};
use astra_usb::{UsbDevice, UsbTransport};

/// Resolves the uEnv.txt content Open Question: the source's revisions
/// disagree on whether it carries a bare reset or the flash command
/// followed by a reset. See DESIGN.md.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UenvResetStyle {
    #[default]
    Reset,
    FlashCommandThenReset,
}

/// Construction parameters for a `Manager`. Generalizes the original's two
/// constructors (flash mode, boot-only mode) into one struct with
/// `Option` fields, per the "multiple construction modes" design note.
#[derive(Clone)]
pub struct ManagerConfig {
    pub flash_image: Option<FlashImage>,
    pub boot_firmware_root: PathBuf,
    pub boot_firmware_id: Option<String>,
    pub boot_command: Option<String>,
    pub continuous: bool,
    pub min_log_level: Level,
    pub log_path: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub usb_debug: bool,
    pub uenv_reset_style: UenvResetStyle,
}

struct TrackedDevice {
    driver: Arc<DeviceDriver>,
}

/// Owns the USB transport and every per-device `DeviceDriver` spawned
/// from it; the single entry point callers construct.
pub struct Manager {
    config: ManagerConfig,
    response_callback: Arc<dyn Fn(Response) + Send + Sync>,
    transport: Mutex<Option<Arc<UsbTransport>>>,
    devices: Arc<Mutex<Vec<TrackedDevice>>>,
    firmware: Mutex<Option<BootFirmware>>,
    failure_reported: Arc<AtomicBool>,
    temp_dir: PathBuf,
    temp_dir_auto_created: bool,
    shutdown_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl Manager {
    /// Build a `Manager` without starting anything; call `init()` next.
    pub fn new(config: ManagerConfig, response_callback: Arc<dyn Fn(Response) + Send + Sync>) -> Result<Self, AstraError> {
        let (temp_dir, temp_dir_auto_created) = match &config.temp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.clone(), false)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("astra-update-").tempdir()?.into_path();
                (dir, true)
            }
        };

        Ok(Manager {
            config,
            response_callback,
            transport: Mutex::new(None),
            devices: Arc::new(Mutex::new(Vec::new())),
            firmware: Mutex::new(None),
            failure_reported: Arc::new(AtomicBool::new(false)),
            temp_dir,
            temp_dir_auto_created,
            shutdown_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        })
    }

    fn emit_manager(&self, status: ManagerStatus, message: impl Into<String>) {
        (self.response_callback)(Response::Manager(ManagerResponse {
            status,
            message: message.into(),
        }));
    }

    fn emit_device(&self, response: DeviceResponse) {
        if matches!(
            response.status,
            DeviceStatus::BootFail | DeviceStatus::UpdateFail | DeviceStatus::ImageSendFail
        ) {
            self.failure_reported.store(true, Ordering::SeqCst);
        }
        (self.response_callback)(Response::Device(response));
    }

    /// Install logging, choose boot firmware, and start the USB
    /// transport. Devices matching the chosen firmware's VID/PID begin
    /// arriving through `device_added_callback` once this returns.
    pub fn init(self: &Arc<Self>) -> Result<(), AstraError> {
        let log_path = self
            .config
            .log_path
            .clone()
            .unwrap_or_else(|| self.temp_dir.join("device_manager.log"));
        logging::init(self.config.min_log_level, Some(&log_path));

        let collection = BootFirmwareCollection::load(&self.config.boot_firmware_root)?;

        let firmware = select_boot_firmware(
            &collection,
            self.config.boot_firmware_id.as_deref(),
            self.config.flash_image.as_ref(),
        )?;

        info!("selected boot firmware: {}", firmware.describe());
        self.emit_manager(ManagerStatus::Info, firmware.describe());

        let vendor_id = firmware.vendor_id;
        let product_id = firmware.product_id;
        *self.firmware.lock() = Some(firmware);

        let transport = Arc::new(UsbTransport::new(self.config.usb_debug)?);
        let manager_for_callback = Arc::clone(self);
        transport.init(
            vendor_id,
            product_id,
            Arc::new(move |device: UsbDevice<Context>| manager_for_callback.device_added_callback(device)),
        )?;
        *self.transport.lock() = Some(transport);

        self.emit_manager(ManagerStatus::Start, format!("Waiting for Astra Device ({vendor_id:04x}:{product_id:04x})"));
        Ok(())
    }

    fn device_added_callback(self: &Arc<Self>, device: UsbDevice<Context>) {
        let temp_dir = self.temp_dir.clone();
        let driver = DeviceDriver::new(Arc::new(device), temp_dir);
        driver.set_status_callback({
            let manager = Arc::clone(self);
            Arc::new(move |response| manager.emit_device(response))
        });
        driver.emit_added();

        self.devices.lock().push(TrackedDevice { driver: Arc::clone(&driver) });

        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("astra-device-lifecycle".into())
            .spawn(move || manager.driver_lifecycle(driver))
            .expect("failed to spawn device lifecycle thread");
    }

    fn driver_lifecycle(self: Arc<Self>, driver: Arc<DeviceDriver>) {
        let firmware = self.firmware.lock().as_ref().cloned().expect("firmware chosen in init()");

        if let Err(e) = driver.boot(&firmware) {
            error!("boot failed: {e}");
            self.failure_reported.store(true, Ordering::SeqCst);
            driver.close();
            return;
        }

        if let Some(flash_image) = &self.config.flash_image {
            if let Err(e) = driver.update(flash_image, firmware.uenv_support, firmware.console, self.config.uenv_reset_style) {
                error!("update failed: {e}");
                self.failure_reported.store(true, Ordering::SeqCst);
                driver.close();
                return;
            }
        } else if let Some(command) = &self.config.boot_command {
            if let Err(e) = driver.run_boot_command(command, firmware.console) {
                error!("boot command failed: {e}");
                self.failure_reported.store(true, Ordering::SeqCst);
                driver.close();
                return;
            }
        }

        driver.wait_for_completion(firmware.uenv_support, firmware.console);

        let completed = driver.update_completed();
        if completed && !self.config.continuous {
            self.emit_manager(ManagerStatus::Shutdown, "update complete, stopping (continuous=false)");
        }

        driver.close();
    }

    /// Close every tracked device, stop the transport, and remove the
    /// temp directory unless a failure was ever reported. Returns `true`
    /// if any failure occurred.
    pub fn shutdown(&self) -> bool {
        let _guard = self.shutdown_lock.lock();
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return self.failure_reported.load(Ordering::SeqCst);
        }

        for tracked in self.devices.lock().drain(..) {
            tracked.driver.close();
        }

        if let Some(transport) = self.transport.lock().take() {
            transport.shutdown();
        }

        let failed = self.failure_reported.load(Ordering::SeqCst);
        if !failed && self.temp_dir_auto_created {
            let _ = std::fs::remove_dir_all(&self.temp_dir);
        }

        failed
    }
}

/// The firmware-selection decision `Manager::init` drives (spec.md §4.9
/// item 3): an explicit `boot_firmware_id` always wins; otherwise, if a
/// flash image is present and its manifest names a `boot_firmware` id,
/// that id is looked up exactly; only when neither is given does
/// selection fall back to matching on (chip, secure_boot, memory_layout,
/// board). Exposed standalone (not just inlined in `init`) so it can be
/// exercised without spinning up USB transport.
pub fn select_boot_firmware(
    collection: &BootFirmwareCollection,
    boot_firmware_id: Option<&str>,
    flash_image: Option<&FlashImage>,
) -> Result<BootFirmware, AstraError> {
    if let Some(id) = boot_firmware_id {
        return Ok(collection.get_by_id(id)?.clone());
    }

    let flash_image = flash_image.ok_or(AstraError::NotFound)?;

    if let Some(id) = flash_image.boot_firmware_id.as_deref() {
        return Ok(collection.get_by_id(id)?.clone());
    }

    let chip = flash_image.chip.as_deref().unwrap_or_default();
    let secure_boot = flash_image.secure_boot.ok_or(AstraError::NotFound)?;
    let memory_layout = flash_image.memory_layout.ok_or(AstraError::NotFound)?;
    Ok(collection
        .select_for(chip, secure_boot, memory_layout, flash_image.board.as_deref())?
        .clone())
}
