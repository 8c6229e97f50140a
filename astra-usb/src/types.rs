//! Common types shared across the transport layer

/// A discovered (but not yet opened) USB endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: u16,
}

impl Endpoint {
    pub fn is_present(&self) -> bool {
        self.max_packet_size > 0
    }
}

/// The four endpoints the protocol actually uses, discovered during `open()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Endpoints {
    pub interrupt_in: Endpoint,
    pub interrupt_out: Endpoint,
    pub bulk_in: Endpoint,
    pub bulk_out: Endpoint,
}

/// Events delivered to the caller-supplied sink from the device's event-loop
/// thread. Never invoked from a caller thread.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A completed interrupt-IN transfer.
    Interrupt(Vec<u8>),
    /// The device disappeared (a transfer completed with NO_DEVICE).
    NoDevice,
    /// A transfer finished because of cancellation during `close()`.
    TransferCanceled,
}

/// Stable textual identity for a device, derived from its USB bus/port
/// chain, e.g. `3-1.2`. Used verbatim as the manager's `device-name`
/// suffix and as the synthetic `06_IMAGE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsbPath(pub String);

impl UsbPath {
    pub fn from_bus_and_ports(bus: u8, ports: &[u8]) -> Self {
        let mut s = bus.to_string();
        for (i, p) in ports.iter().enumerate() {
            s.push(if i == 0 { '-' } else { '.' });
            s.push_str(&p.to_string());
        }
        UsbPath(s)
    }
}

impl std::fmt::Display for UsbPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_path_formats_bus_dash_then_dotted_ports() {
        assert_eq!(UsbPath::from_bus_and_ports(3, &[1, 2]).0, "3-1.2");
        assert_eq!(UsbPath::from_bus_and_ports(1, &[4]).0, "1-4");
    }

    #[test]
    fn endpoint_presence_tracks_max_packet_size() {
        let absent = Endpoint::default();
        assert!(!absent.is_present());

        let present = Endpoint {
            address: 0x81,
            max_packet_size: 64,
        };
        assert!(present.is_present());
    }
}
