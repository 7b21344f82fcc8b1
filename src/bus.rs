//! Bus Access Layer
//!
//! Resource-safe access to one claimed USB interface: device discovery by
//! vendor/product identity, kernel-driver detach/re-attach, and bulk
//! endpoint transfers wrapped in a transient-error retry policy.
//!
//! # Architecture
//!
//! - [`DeviceId`]: vendor/product identity, `lsusb`-style `vvvv:pppp`
//! - [`open`]: locate and open one attached device
//! - [`InterfaceClaim`]: scoped ownership of an interface; releases (and
//!   re-attaches the kernel driver when it detached one) on drop
//! - [`retryable`]: retry combinator for transient bus errors
//!
//! Transfers retry forever on [`rusb::Error::Timeout`] and
//! [`rusb::Error::Busy`]; an unplugged sensor should be waited for, not
//! escalated. Every other bus error is terminal for the calling cycle.

use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use rusb::constants::LIBUSB_ENDPOINT_IN;
use rusb::{Device, DeviceHandle, GlobalContext, TransferType};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Bus access error types.
#[derive(Debug, Error)]
pub enum BusError {
    /// No attached device matches the requested identity.
    #[error("no device matching {0} is attached")]
    DeviceNotFound(DeviceId),

    /// The claimed interface exposes no bulk IN endpoint.
    #[error("interface {interface} has no bulk IN endpoint")]
    MissingBulkIn { interface: u8 },

    /// The claimed interface exposes no bulk OUT endpoint.
    #[error("interface {interface} has no bulk OUT endpoint")]
    MissingBulkOut { interface: u8 },

    /// Payload too large for the endpoint; rejected before any I/O.
    #[error("payload of {len} bytes does not fit a {max} byte packet")]
    OversizedPayload { len: usize, max: usize },

    /// Terminal libusb failure (anything that is not timeout/busy).
    #[error("bus transfer failed: {0}")]
    Transfer(#[from] rusb::Error),
}

/// Failed to parse an `lsusb`-style device identity string.
#[derive(Debug, Error)]
#[error("device id must be bare hex 'vvvv:pppp', got {0:?}")]
pub struct ParseDeviceIdError(String);

// =============================================================================
// Device identity
// =============================================================================

/// Vendor/product identity of one physical USB device.
///
/// Displayed and parsed in the `lsusb` form `vvvv:pppp` (bare hex).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl DeviceId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((vendor, product)) = s.split_once(':') else {
            return Err(ParseDeviceIdError(s.to_string()));
        };
        let vendor =
            u16::from_str_radix(vendor, 16).map_err(|_| ParseDeviceIdError(s.to_string()))?;
        let product =
            u16::from_str_radix(product, 16).map_err(|_| ParseDeviceIdError(s.to_string()))?;
        Ok(Self { vendor, product })
    }
}

impl Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One bulk endpoint on the claimed interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit.
    pub address: u8,
    /// Declared `wMaxPacketSize`; the write framing unit.
    pub max_packet_size: u16,
}

impl EndpointInfo {
    /// Whether this is an IN (device-to-host) endpoint.
    pub fn is_input(&self) -> bool {
        self.address & LIBUSB_ENDPOINT_IN != 0
    }
}

// =============================================================================
// Retry combinator
// =============================================================================

/// Run `op` until it succeeds or fails terminally.
///
/// Timeout and resource-busy errors sleep `base_delay` and retry without
/// limit: both model contention or a momentarily absent device, and the
/// operator expects the daemon to keep waiting for a replug. Any other
/// error is returned immediately so one broken sensor cannot stall the
/// poll loop past its own cycle.
pub fn retryable<T, F>(mut op: F, base_delay: Duration) -> Result<T, BusError>
where
    F: FnMut() -> rusb::Result<T>,
{
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ (rusb::Error::Timeout | rusb::Error::Busy)) => {
                tracing::warn!(
                    error = %err,
                    delay_ms = base_delay.as_millis() as u64,
                    "Transient bus error, retrying"
                );
                thread::sleep(base_delay);
            }
            Err(err) => {
                tracing::error!(error = %err, "Unrecoverable bus error");
                return Err(BusError::Transfer(err));
            }
        }
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// An opened device, not yet claimed.
///
/// Identity is re-resolved on every collection attempt; handles are never
/// held across poll cycles since the physical device may be replugged.
pub struct OpenDevice {
    device: Device<GlobalContext>,
    handle: DeviceHandle<GlobalContext>,
}

impl fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenDevice")
            .field("bus", &self.device.bus_number())
            .field("address", &self.device.address())
            .finish_non_exhaustive()
    }
}

/// Locate one attached device by identity and open it.
///
/// Returns [`BusError::DeviceNotFound`] when nothing on the bus matches;
/// an open failure on a matching device (usually missing permissions)
/// surfaces as a terminal transfer error.
pub fn open(id: DeviceId) -> Result<OpenDevice, BusError> {
    for device in rusb::devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::debug!(error = %err, "Skipping device with unreadable descriptor");
                continue;
            }
        };
        if descriptor.vendor_id() == id.vendor && descriptor.product_id() == id.product {
            let handle = device.open()?;
            return Ok(OpenDevice { device, handle });
        }
    }
    Err(BusError::DeviceNotFound(id))
}

impl OpenDevice {
    /// Claim `interface`, optionally detaching a bound kernel driver first.
    ///
    /// Detach happens only when requested *and* a driver is currently
    /// active; the claim records whether it performed the detach so the
    /// release path can stay asymmetric.
    pub fn claim(
        self,
        interface: u8,
        detach: bool,
        base_delay: Duration,
    ) -> Result<InterfaceClaim, BusError> {
        let OpenDevice { device, mut handle } = self;
        let (bulk_in, bulk_out) = resolve_bulk_endpoints(&device, interface)?;

        let mut detached = false;
        if detach && handle.kernel_driver_active(interface).unwrap_or(false) {
            tracing::debug!(interface, "Detaching kernel driver");
            retryable(|| handle.detach_kernel_driver(interface), base_delay)?;
            detached = true;
        }

        if let Err(err) = retryable(|| handle.claim_interface(interface), base_delay) {
            // The claim never existed; hand the interface back to the kernel.
            if detached && let Err(attach_err) = handle.attach_kernel_driver(interface) {
                tracing::warn!(interface, error = %attach_err, "Failed to restore kernel driver");
            }
            return Err(err);
        }

        Ok(InterfaceClaim {
            handle,
            interface,
            detached,
            base_delay,
            bulk_in,
            bulk_out,
        })
    }
}

fn resolve_bulk_endpoints(
    device: &Device<GlobalContext>,
    interface: u8,
) -> Result<(Option<EndpointInfo>, Option<EndpointInfo>), BusError> {
    // First configuration, matching what the kernel activates for these
    // single-configuration sensor bridges.
    let config = device.config_descriptor(0)?;
    let mut bulk = Vec::new();
    for candidate in config.interfaces() {
        if candidate.number() != interface {
            continue;
        }
        for descriptor in candidate.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() == TransferType::Bulk {
                    bulk.push(EndpointInfo {
                        address: endpoint.address(),
                        max_packet_size: endpoint.max_packet_size(),
                    });
                }
            }
        }
    }
    Ok(classify_endpoints(bulk))
}

/// Split bulk endpoints into the first IN and first OUT by direction bit.
fn classify_endpoints(
    endpoints: impl IntoIterator<Item = EndpointInfo>,
) -> (Option<EndpointInfo>, Option<EndpointInfo>) {
    let mut bulk_in = None;
    let mut bulk_out = None;
    for endpoint in endpoints {
        let slot = if endpoint.is_input() {
            &mut bulk_in
        } else {
            &mut bulk_out
        };
        if slot.is_none() {
            *slot = Some(endpoint);
        }
    }
    (bulk_in, bulk_out)
}

// =============================================================================
// Interface claim
// =============================================================================

/// Scoped, exclusively-owned claim of one interface on one device.
///
/// Dropping the claim releases the interface on every exit path and
/// re-attaches the kernel driver only if this claim detached
/// it. A claim acquired with `detach = false`, or over an interface some
/// other actor had already detached, never attaches on the way out.
pub struct InterfaceClaim {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    detached: bool,
    base_delay: Duration,
    bulk_in: Option<EndpointInfo>,
    bulk_out: Option<EndpointInfo>,
}

impl InterfaceClaim {
    /// The first bulk IN endpoint of the claimed interface.
    pub fn bulk_in(&self) -> Result<EndpointInfo, BusError> {
        self.bulk_in.ok_or(BusError::MissingBulkIn {
            interface: self.interface,
        })
    }

    /// The first bulk OUT endpoint of the claimed interface.
    pub fn bulk_out(&self) -> Result<EndpointInfo, BusError> {
        self.bulk_out.ok_or(BusError::MissingBulkOut {
            interface: self.interface,
        })
    }

    /// Read one packet from a bulk endpoint through the retry policy.
    pub fn read(&self, endpoint: EndpointInfo, timeout: Duration) -> Result<Vec<u8>, BusError> {
        let mut buf = vec![0u8; endpoint.max_packet_size as usize];
        let n = retryable(
            || self.handle.read_bulk(endpoint.address, &mut buf, timeout),
            self.base_delay,
        )?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write `payload` to a bulk endpoint, zero-padded to one full packet.
    ///
    /// Payloads of `max_packet_size` bytes or more are a caller error and
    /// are rejected before any I/O, never truncated.
    pub fn write(
        &self,
        endpoint: EndpointInfo,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<usize, BusError> {
        let frame = frame_payload(payload, endpoint.max_packet_size as usize)?;
        retryable(
            || self.handle.write_bulk(endpoint.address, &frame, timeout),
            self.base_delay,
        )
    }
}

impl fmt::Debug for InterfaceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceClaim")
            .field("interface", &self.interface)
            .field("detached", &self.detached)
            .field("bulk_in", &self.bulk_in)
            .field("bulk_out", &self.bulk_out)
            .finish_non_exhaustive()
    }
}

impl Drop for InterfaceClaim {
    fn drop(&mut self) {
        let interface = self.interface;
        let delay = self.base_delay;
        let handle = &mut self.handle;

        if let Err(err) = retryable(|| handle.release_interface(interface), delay) {
            tracing::error!(interface, error = %err, "Failed to release interface");
        }
        // Asymmetric by contract: only the claim that detached re-attaches.
        if self.detached {
            tracing::debug!(interface, "Re-attaching kernel driver");
            if let Err(err) = retryable(|| handle.attach_kernel_driver(interface), delay) {
                tracing::error!(interface, error = %err, "Failed to re-attach kernel driver");
            }
        }
    }
}

/// Pad `payload` with trailing zeros to exactly `max_packet_size` bytes.
fn frame_payload(payload: &[u8], max_packet_size: usize) -> Result<Vec<u8>, BusError> {
    if payload.len() >= max_packet_size {
        return Err(BusError::OversizedPayload {
            len: payload.len(),
            max: max_packet_size,
        });
    }
    let mut frame = payload.to_vec();
    frame.resize(max_packet_size, 0);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DELAY: Duration = Duration::from_millis(1);

    #[test]
    fn test_device_id_parses_lsusb_form() {
        let id: DeviceId = "0487:0007".parse().unwrap();
        assert_eq!(id, DeviceId::new(0x0487, 0x0007));

        let id: DeviceId = "1a86:7523".parse().unwrap();
        assert_eq!(id.vendor, 0x1a86);
        assert_eq!(id.product, 0x7523);
    }

    #[test]
    fn test_device_id_display_roundtrip() {
        let id = DeviceId::new(0x0487, 0x0007);
        assert_eq!(id.to_string(), "0487:0007");
        assert_eq!(id.to_string().parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn test_device_id_rejects_malformed() {
        assert!("0487".parse::<DeviceId>().is_err());
        assert!("0x0487:0x0007".parse::<DeviceId>().is_err());
        assert!("zzzz:0007".parse::<DeviceId>().is_err());
        assert!("".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_device_id_serde_as_string() {
        let id = DeviceId::new(0x1a86, 0x7523);
        let yaml = serde_yaml::to_string(&id).unwrap();
        assert_eq!(yaml.trim(), "1a86:7523");
        let back: DeviceId = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_retryable_returns_success_immediately() {
        let mut attempts = 0;
        let result = retryable(
            || {
                attempts += 1;
                Ok(42)
            },
            TEST_DELAY,
        );
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_retryable_recovers_after_two_timeouts() {
        let mut attempts = 0;
        let result = retryable(
            || {
                attempts += 1;
                if attempts <= 2 {
                    Err(rusb::Error::Timeout)
                } else {
                    Ok("reading")
                }
            },
            TEST_DELAY,
        );
        assert_eq!(result.unwrap(), "reading");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_retryable_retries_resource_busy() {
        let mut attempts = 0;
        let result = retryable(
            || {
                attempts += 1;
                if attempts == 1 {
                    Err(rusb::Error::Busy)
                } else {
                    Ok(())
                }
            },
            TEST_DELAY,
        );
        assert!(result.is_ok());
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_retryable_fails_fast_on_terminal_error() {
        let mut attempts = 0;
        let result: Result<(), BusError> = retryable(
            || {
                attempts += 1;
                Err(rusb::Error::NoDevice)
            },
            TEST_DELAY,
        );
        assert!(matches!(
            result,
            Err(BusError::Transfer(rusb::Error::NoDevice))
        ));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_frame_pads_short_payload_with_zeros() {
        let frame = frame_payload(&[0xF3], 8).unwrap();
        assert_eq!(frame, vec![0xF3, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_frame_pads_to_exactly_max_packet_size() {
        let payload = vec![0xAA; 63];
        let frame = frame_payload(&payload, 64).unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(&frame[..63], payload.as_slice());
        assert_eq!(frame[63], 0);
    }

    #[test]
    fn test_frame_rejects_payload_at_packet_size() {
        let payload = vec![0xAA; 64];
        let result = frame_payload(&payload, 64);
        assert!(matches!(
            result,
            Err(BusError::OversizedPayload { len: 64, max: 64 })
        ));
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        assert!(frame_payload(&[0u8; 100], 64).is_err());
    }

    #[test]
    fn test_frame_accepts_empty_payload() {
        let frame = frame_payload(&[], 4).unwrap();
        assert_eq!(frame, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_classify_endpoints_splits_by_direction() {
        let endpoints = vec![
            EndpointInfo {
                address: 0x02,
                max_packet_size: 32,
            },
            EndpointInfo {
                address: 0x82,
                max_packet_size: 32,
            },
        ];
        let (bulk_in, bulk_out) = classify_endpoints(endpoints);
        assert_eq!(bulk_in.unwrap().address, 0x82);
        assert_eq!(bulk_out.unwrap().address, 0x02);
    }

    #[test]
    fn test_classify_endpoints_keeps_first_per_direction() {
        let endpoints = vec![
            EndpointInfo {
                address: 0x81,
                max_packet_size: 16,
            },
            EndpointInfo {
                address: 0x82,
                max_packet_size: 64,
            },
        ];
        let (bulk_in, bulk_out) = classify_endpoints(endpoints);
        assert_eq!(bulk_in.unwrap().address, 0x81);
        assert!(bulk_out.is_none());
    }

    #[test]
    fn test_endpoint_direction_bit() {
        let input = EndpointInfo {
            address: 0x81,
            max_packet_size: 8,
        };
        let output = EndpointInfo {
            address: 0x01,
            max_packet_size: 8,
        };
        assert!(input.is_input());
        assert!(!output.is_input());
    }
}
