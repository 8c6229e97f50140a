// astra-update - host-side USB boot/flash tool for Astra SoC devices
// Transport layer lives in the astra-usb crate; this crate owns image
// selection, the on-wire boot/update protocol, and orchestration.

pub mod boot_firmware;
pub mod console;
pub mod device_driver;
pub mod error;
pub mod flash_image;
pub mod image;
pub mod logging;
pub mod manager;
pub mod manifest;
pub mod response;

pub use boot_firmware::{BootFirmware, BootFirmwareCollection};
pub use console::Console;
pub use device_driver::DeviceDriver;
pub use error::AstraError;
pub use flash_image::{FlashImage, FlashImageKind};
pub use image::Image;
pub use manager::{Manager, ManagerConfig, UenvResetStyle};
pub use response::{DeviceResponse, DeviceStatus, ManagerResponse, ManagerStatus, Response};
