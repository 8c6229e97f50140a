//! USB transport error types

use thiserror::Error;

/// Errors that can occur while discovering, opening, or driving a USB device.
#[derive(Error, Debug)]
pub enum UsbError {
    #[error("USB device not found: {0}")]
    DeviceNotFound(String),

    #[error("device disconnected")]
    NoDevice,

    #[error("transfer was canceled")]
    TransferCanceled,

    #[error("operation attempted on an already-closed device or transport")]
    AlreadyClosed,

    #[error("required endpoint missing: {0}")]
    MissingEndpoint(&'static str),

    #[error("libusb error: {0}")]
    Libusb(#[from] rusb::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UsbError {
    /// True if this error indicates the device physically went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            UsbError::NoDevice | UsbError::DeviceNotFound(_) | UsbError::Libusb(rusb::Error::NoDevice)
        )
    }

    /// Classify a transfer-layer `rusb::Error`, distinguishing a physical
    /// disconnect from every other libusb failure.
    pub(crate) fn from_transfer(e: rusb::Error) -> Self {
        match e {
            rusb::Error::NoDevice => UsbError::NoDevice,
            other => UsbError::Libusb(other),
        }
    }
}
