//! USB transport layer for talking to a device sitting in a bootstrap or
//! mask-ROM state: device discovery (with hotplug where the platform
//! supports it), endpoint claiming, and bulk/interrupt I/O.
//!
//! Everything above the wire (image selection, the boot/update state
//! machine, manifests) lives in the `astra-update` crate; this crate only
//! knows about endpoints and transfers.

pub mod device;
pub mod error;
pub mod transport;
pub mod types;

pub use device::UsbDevice;
pub use error::UsbError;
pub use transport::UsbTransport;
pub use types::{DeviceEvent, Endpoint, Endpoints, UsbPath};
