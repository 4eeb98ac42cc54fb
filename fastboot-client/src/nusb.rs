use std::time::Duration;

use async_trait::async_trait;
use nusb::transfer::RequestBuffer;
use nusb::DeviceInfo;
use thiserror::Error;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportError};

/// Vendors known to expose fastboot without the standard interface triple
pub const KNOWN_VENDOR_IDS: &[u16] = &[
    0x18d1, // Google
    0x04e8, // Samsung
    0x22b8, // Motorola
    0x2717, // Xiaomi
    0x0bb4, // HTC
    0x05c6, // Qualcomm
    0x1782, // Spreadtrum
];

/// List fastboot devices
///
/// A device qualifies through the fastboot interface triple or through the
/// vendor allow-list.
pub fn devices() -> std::result::Result<impl Iterator<Item = DeviceInfo>, nusb::Error> {
    Ok(nusb::list_devices()?.filter(|d| {
        NusbTransport::find_fastboot_interface(d).is_some()
            || KNOWN_VENDOR_IDS.contains(&d.vendor_id())
    }))
}

/// Find a fastboot device by its serial string
pub fn find_by_serial(serial: &str) -> std::result::Result<Option<DeviceInfo>, nusb::Error> {
    Ok(devices()?.find(|d| d.serial_number() == Some(serial)))
}

/// Errors when opening the fastboot device
#[derive(Debug, Error)]
pub enum NusbOpenError {
    #[error("Failed to open device: {0}")]
    Device(std::io::Error),
    #[error("Failed to claim interface: {0}")]
    Interface(std::io::Error),
    #[error("Failed to find interface for fastboot")]
    MissingInterface,
    #[error("Failed to find required endpoints for fastboot")]
    MissingEndpoints,
}

/// Nusb backed fastboot transport
pub struct NusbTransport {
    interface: nusb::Interface,
    ep_out: u8,
    ep_in: u8,
    closed: bool,
}

impl NusbTransport {
    /// Interface number of the fastboot function within a device, if any
    pub fn find_fastboot_interface(info: &DeviceInfo) -> Option<u8> {
        info.interfaces()
            .filter(|i| (i.class(), i.subclass(), i.protocol()) == (0xff, 0x42, 0x03))
            .map(|i| i.interface_number())
            .next()
    }

    /// First alt setting carrying a bulk endpoint in each direction
    fn bulk_endpoint_pair(interface: &nusb::Interface) -> Option<(u8, u8)> {
        for alt in interface.descriptors() {
            let mut bulk_in = None;
            let mut bulk_out = None;
            for endpoint in alt.endpoints() {
                if endpoint.transfer_type() != nusb::transfer::EndpointType::Bulk {
                    continue;
                }
                if endpoint.direction() == nusb::transfer::Direction::In {
                    bulk_in.get_or_insert(endpoint.address());
                } else {
                    bulk_out.get_or_insert(endpoint.address());
                }
            }
            if let (Some(ep_in), Some(ep_out)) = (bulk_in, bulk_out) {
                return Some((ep_in, ep_out));
            }
        }
        None
    }

    /// Create a transport from a claimed USB interface. The interface is
    /// assumed to be a fastboot interface
    pub fn from_interface(interface: nusb::Interface) -> Result<Self, NusbOpenError> {
        let (ep_in, ep_out) =
            Self::bulk_endpoint_pair(&interface).ok_or(NusbOpenError::MissingEndpoints)?;
        debug!("Claimed fastboot interface, bulk in {ep_in:#04x} / bulk out {ep_out:#04x}");
        Ok(Self {
            interface,
            ep_out,
            ep_in,
            closed: false,
        })
    }

    /// Create a transport from a USB device. The interface number must be
    /// the fastboot interface
    pub fn from_device(device: nusb::Device, interface: u8) -> Result<Self, NusbOpenError> {
        let interface = device
            .claim_interface(interface)
            .map_err(NusbOpenError::Interface)?;
        Self::from_interface(interface)
    }

    /// Create a transport from device info. The correct interface is
    /// determined automatically
    pub fn from_info(info: &DeviceInfo) -> Result<Self, NusbOpenError> {
        let interface =
            Self::find_fastboot_interface(info).ok_or(NusbOpenError::MissingInterface)?;
        let device = info.open().map_err(NusbOpenError::Device)?;
        Self::from_device(device, interface)
    }

    fn map_transfer_error(
        &self,
        error: nusb::transfer::TransferError,
        endpoint: u8,
    ) -> TransportError {
        match error {
            nusb::transfer::TransferError::Stall => {
                // One recovery attempt, then the stall is surfaced
                if let Err(e) = self.interface.clear_halt(endpoint) {
                    warn!("Failed to clear halted endpoint {endpoint:#x}: {e}");
                }
                TransportError::Stall
            }
            nusb::transfer::TransferError::Disconnected => TransportError::Disconnected,
            other => TransportError::Io(other.to_string()),
        }
    }
}

#[async_trait]
impl Transport for NusbTransport {
    async fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let transfer = self.interface.bulk_out(self.ep_out, data.to_vec());
        let completion = tokio::time::timeout(timeout, transfer)
            .await
            .map_err(|_| TransportError::Timeout)?;
        match completion.status {
            Ok(()) => Ok(completion.data.actual_length()),
            Err(e) => Err(self.map_transfer_error(e, self.ep_out)),
        }
    }

    async fn read(
        &mut self,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let transfer = self
            .interface
            .bulk_in(self.ep_in, RequestBuffer::new(max_len));
        let completion = tokio::time::timeout(timeout, transfer)
            .await
            .map_err(|_| TransportError::Timeout)?;
        match completion.status {
            Ok(()) => Ok(completion.data),
            Err(e) => Err(self.map_transfer_error(e, self.ep_in)),
        }
    }

    async fn close(&mut self) {
        // The interface itself is released when the transport is dropped
        self.closed = true;
    }
}
