//! The tagged-union status callback sink: `DeviceResponse` for per-device
//! progress, `ManagerResponse` for orchestrator-level lifecycle events.

/// Per-device status, a walk of the boot/update/completion state machine
/// described in `device_driver`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Added,
    Opened,
    Closed,
    BootStart,
    BootProgress,
    BootComplete,
    BootFail,
    UpdateStart,
    UpdateProgress,
    UpdateComplete,
    UpdateFail,
    ImageSendStart,
    ImageSendProgress,
    ImageSendComplete,
    ImageSendFail,
}

/// A single status event for one device.
#[derive(Debug, Clone)]
pub struct DeviceResponse {
    pub device: String,
    pub status: DeviceStatus,
    pub progress: f64,
    pub image: String,
    pub message: String,
}

/// Manager-level lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerStatus {
    Start,
    Info,
    Failure,
    Shutdown,
}

/// A single status event from the orchestrator itself, not tied to a
/// particular device.
#[derive(Debug, Clone)]
pub struct ManagerResponse {
    pub status: ManagerStatus,
    pub message: String,
}

/// Everything delivered through the one caller-supplied response sink.
#[derive(Debug, Clone)]
pub enum Response {
    Device(DeviceResponse),
    Manager(ManagerResponse),
}

/// The callback signature `Manager` and `DeviceDriver` report progress
/// through. Must be callable concurrently from any worker thread.
pub type ResponseCallback = std::sync::Arc<dyn Fn(Response) + Send + Sync>;
