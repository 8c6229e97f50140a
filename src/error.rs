//! Crate-wide error type, composed from each module's own error enum.

use thiserror::Error;

use crate::boot_firmware::BootFirmwareError;
use crate::device_driver::DeviceDriverError;
use crate::flash_image::FlashImageError;
use crate::image::ImageError;
use crate::manifest::ManifestError;

/// Top-level error returned by `Manager` and the modules it drives.
#[derive(Error, Debug)]
pub enum AstraError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    BootFirmware(#[from] BootFirmwareError),

    #[error(transparent)]
    FlashImage(#[from] FlashImageError),

    #[error(transparent)]
    DeviceDriver(#[from] DeviceDriverError),

    #[error(transparent)]
    Usb(#[from] astra_usb::UsbError),

    #[error("no boot firmware found matching the observed device")]
    NotFound,

    #[error("operation attempted on an already-closed manager")]
    AlreadyClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
