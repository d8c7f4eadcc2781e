//! GS-USB transport
//!
//! `GsUsbTransport` drives candleLight, CANable and other GS-USB compatible
//! adapters through `rusb`. Each adapter is exposed as one channel whose
//! handle packs the USB bus number and device address.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rusb::{Device, DeviceHandle, GlobalContext};

use crate::connection::AcceptanceFilter;
use crate::constants::*;
use crate::error::TransportError;
use crate::frame::{ClassicWireFrame, FdWireFrame, Timestamp, WireFrame};
use crate::structures::{DeviceBitTiming, DeviceCapability, DeviceMode, HostFrame};
use crate::timing::BitTimingConfig;
use crate::transport::{ChannelHandle, Received, Transport, TransportResult};

impl ChannelHandle {
    /// Handle for the adapter at the given USB location
    pub fn from_usb(bus: u8, address: u8) -> Self {
        ChannelHandle((u16::from(bus) << 8) | u16::from(address))
    }

    /// USB bus number
    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// USB device address
    pub fn address(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

/// Nominal timing for classic CAN at an 87.5% sample point
///
/// Tables exist for 48 MHz, 80 MHz and 40 MHz (CF3 / TCAN4550) clocks.
pub fn nominal_timing(clock_hz: u32, bitrate: u32) -> Option<DeviceBitTiming> {
    let prop_seg = 1;
    let sjw = 1;

    let (phase_seg1, phase_seg2, brp) = match clock_hz {
        48_000_000 => match bitrate {
            10_000 => (12, 2, 300),
            20_000 => (12, 2, 150),
            50_000 => (12, 2, 60),
            100_000 => (12, 2, 30),
            125_000 => (12, 2, 24),
            250_000 => (12, 2, 12),
            500_000 => (12, 2, 6),
            800_000 => (11, 2, 4),
            1_000_000 => (12, 2, 3),
            _ => return None,
        },
        80_000_000 => match bitrate {
            10_000 => (12, 2, 500),
            20_000 => (12, 2, 250),
            50_000 => (12, 2, 100),
            100_000 => (12, 2, 50),
            125_000 => (12, 2, 40),
            250_000 => (12, 2, 20),
            500_000 => (12, 2, 10),
            800_000 => (7, 1, 10),
            1_000_000 => (12, 2, 5),
            _ => return None,
        },
        40_000_000 => match bitrate {
            10_000 => (12, 2, 250),
            20_000 => (12, 2, 125),
            50_000 => (12, 2, 50),
            100_000 => (12, 2, 25),
            125_000 => (12, 2, 20),
            250_000 => (12, 2, 10),
            500_000 => (12, 2, 5),
            800_000 => (7, 1, 5),
            1_000_000 => (5, 1, 5),
            _ => return None,
        },
        _ => return None,
    };

    Some(DeviceBitTiming::new(prop_seg, phase_seg1, phase_seg2, sjw, brp))
}

/// Check if a USB device is a GS-USB device
fn is_gs_usb_device(vendor_id: u16, product_id: u16) -> bool {
    GS_USB_DEVICE_IDS.contains(&(vendor_id, product_id))
}

/// Every attached GS-USB device
fn gs_usb_devices() -> TransportResult<Vec<Device<GlobalContext>>> {
    let mut devices = Vec::new();
    for device in rusb::devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if is_gs_usb_device(desc.vendor_id(), desc.product_id()) {
            devices.push(device);
        }
    }
    Ok(devices)
}

/// Open the adapter behind a channel handle
fn open_device(channel: ChannelHandle) -> TransportResult<DeviceHandle<GlobalContext>> {
    let device = gs_usb_devices()?
        .into_iter()
        .find(|d| d.bus_number() == channel.bus() && d.address() == channel.address())
        .ok_or(TransportError::ChannelUnavailable(channel))?;
    Ok(device.open()?)
}

/// Perform a control OUT transfer
fn control_out(
    handle: &DeviceHandle<GlobalContext>,
    request: u8,
    data: &[u8],
) -> TransportResult<()> {
    handle.write_control(
        0x41, // bmRequestType: vendor, host-to-device
        request,
        0,
        0, // wIndex
        data,
        GS_USB_TRANSFER_TIMEOUT,
    )?;
    Ok(())
}

/// Read the BT_CONST capability block
fn device_capability(handle: &DeviceHandle<GlobalContext>) -> TransportResult<DeviceCapability> {
    let mut buf = [0u8; DeviceCapability::SIZE];
    let len = handle.read_control(
        0xC1, // bmRequestType: vendor, device-to-host
        GS_USB_BREQ_BT_CONST,
        0,
        0, // wIndex
        &mut buf,
        GS_USB_TRANSFER_TIMEOUT,
    )?;
    DeviceCapability::unpack(&buf[..len]).ok_or(TransportError::InvalidResponse {
        expected: DeviceCapability::SIZE,
        actual: len,
    })
}

/// Whether an inbound host frame goes to the application
///
/// Error frames always pass so they can surface as status frames.
fn accept(frame: &HostFrame, filter: &AcceptanceFilter) -> bool {
    if !frame.is_rx() {
        trace!("Skipping TX echo {}", frame.echo_id);
        return false;
    }
    frame.is_error() || (!frame.is_remote() && filter.accepts(frame.arbitration_id()))
}

/// Read host frames until one is accepted or `timeout` has elapsed
fn next_frame<R, A>(timeout: Duration, mut read: R, accept: A) -> TransportResult<Option<HostFrame>>
where
    R: FnMut(Duration) -> TransportResult<Option<HostFrame>>,
    A: Fn(&HostFrame) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        // libusb reads a zero timeout as "wait forever"
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        match read(remaining)? {
            None => return Ok(None),
            Some(frame) if accept(&frame) => return Ok(Some(frame)),
            Some(_) => continue,
        }
    }
}

/// An adapter that has been started
struct OpenChannel {
    channel: ChannelHandle,
    handle: DeviceHandle<GlobalContext>,
    /// Mode flags the channel was started with
    flags: u32,
    filter: AcceptanceFilter,
    opened_at: Instant,
}

impl OpenChannel {
    fn fd_mode(&self) -> bool {
        (self.flags & GS_CAN_MODE_FD) != 0
    }

    fn hw_timestamps(&self) -> bool {
        (self.flags & GS_CAN_MODE_HW_TIMESTAMP) != 0
    }

    fn send(&self, frame: &HostFrame) -> TransportResult<()> {
        let data = frame.pack(self.fd_mode(), self.hw_timestamps());
        self.handle
            .write_bulk(GS_USB_ENDPOINT_OUT, &data, GS_USB_TRANSFER_TIMEOUT)?;
        Ok(())
    }

    /// Next frame for the application, skipping echoes, remote requests
    /// and identifiers outside the filter
    ///
    /// Skipped frames count against `timeout`, so a busy bus full of
    /// filtered traffic still returns `None` in time.
    fn receive<const N: usize>(
        &self,
        timeout: Duration,
    ) -> TransportResult<Option<Received<WireFrame<N>>>> {
        let hw_timestamps = self.hw_timestamps();
        let mut buf = vec![0u8; HostFrame::size(self.fd_mode(), hw_timestamps)];

        let read = |remaining: Duration| -> TransportResult<Option<HostFrame>> {
            let len = match self.handle.read_bulk(GS_USB_ENDPOINT_IN, &mut buf, remaining) {
                Ok(len) => len,
                Err(rusb::Error::Timeout) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            HostFrame::unpack(&buf[..len], hw_timestamps)
                .map(Some)
                .ok_or(TransportError::InvalidResponse {
                    expected: GS_USB_HEADER_SIZE,
                    actual: len,
                })
        };

        let Some(frame) = next_frame(timeout, read, |frame| accept(frame, &self.filter))? else {
            return Ok(None);
        };
        let timestamp = if hw_timestamps {
            Timestamp(u64::from(frame.timestamp_us))
        } else {
            Timestamp(self.opened_at.elapsed().as_micros() as u64)
        };
        Ok(Some(Received::new(frame.to_wire(), timestamp)))
    }

    /// Reset the channel and release the interface
    fn close(mut self) -> TransportResult<()> {
        let reset = control_out(
            &self.handle,
            GS_USB_BREQ_MODE,
            &DeviceMode::new(GS_CAN_MODE_RESET, 0).pack(),
        );
        let release = self.handle.release_interface(0).map_err(TransportError::from);
        reset.and(release)
    }
}

/// `Transport` backed by GS-USB adapters
///
/// One adapter channel can be open at a time.
pub struct GsUsbTransport {
    open: Option<OpenChannel>,
    read_timeout: Duration,
}

impl Default for GsUsbTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl GsUsbTransport {
    pub fn new() -> Self {
        Self {
            open: None,
            read_timeout: GS_USB_READ_TIMEOUT,
        }
    }

    /// Bulk IN timeout; an empty queue is reported after this long
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    fn channel(&self, channel: ChannelHandle) -> TransportResult<&OpenChannel> {
        self.open
            .as_ref()
            .filter(|open| open.channel == channel)
            .ok_or(TransportError::ChannelNotOpen(channel))
    }

    fn channel_mut(&mut self, channel: ChannelHandle) -> TransportResult<&mut OpenChannel> {
        self.open
            .as_mut()
            .filter(|open| open.channel == channel)
            .ok_or(TransportError::ChannelNotOpen(channel))
    }

    /// Claim the adapter, let `configure` program its timing, then start it
    ///
    /// `configure` returns the extra mode flags to start with.
    fn bring_up<F>(&mut self, channel: ChannelHandle, configure: F) -> TransportResult<()>
    where
        F: FnOnce(&DeviceHandle<GlobalContext>, &DeviceCapability) -> TransportResult<u32>,
    {
        if let Some(open) = &self.open {
            return Err(TransportError::Driver(format!(
                "channel {} is already open",
                open.channel
            )));
        }

        let mut handle = open_device(channel)?;
        // Reset to support restart multiple times
        handle.reset()?;

        // Detach kernel driver on Linux/Unix
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(0).unwrap_or(false) {
                handle.detach_kernel_driver(0)?;
            }
        }
        handle.claim_interface(0)?;

        let started = device_capability(&handle).and_then(|capability| {
            let mut flags = configure(&handle, &capability)?;
            if capability.supports_hw_timestamp() {
                flags |= GS_CAN_MODE_HW_TIMESTAMP;
            }
            let mode = DeviceMode::new(GS_CAN_MODE_START, flags);
            control_out(&handle, GS_USB_BREQ_MODE, &mode.pack())?;
            Ok(flags)
        });

        match started {
            Ok(flags) => {
                debug!("Started channel {} with mode flags 0x{:08x}", channel, flags);
                self.open = Some(OpenChannel {
                    channel,
                    handle,
                    flags,
                    filter: AcceptanceFilter::accept_all(),
                    opened_at: Instant::now(),
                });
                Ok(())
            }
            Err(e) => {
                if let Err(release) = handle.release_interface(0) {
                    warn!("Failed to release interface of {}: {}", channel, release);
                }
                Err(e)
            }
        }
    }
}

impl Transport for GsUsbTransport {
    fn enumerate(&mut self) -> TransportResult<Vec<ChannelHandle>> {
        Ok(gs_usb_devices()?
            .iter()
            .map(|d| ChannelHandle::from_usb(d.bus_number(), d.address()))
            .collect())
    }

    fn is_fd_capable(&mut self, channel: ChannelHandle) -> TransportResult<bool> {
        let capability = match self.channel(channel) {
            Ok(open) => device_capability(&open.handle)?,
            Err(_) => device_capability(&open_device(channel)?)?,
        };
        Ok(capability.supports_fd())
    }

    fn init(&mut self, channel: ChannelHandle, nominal_bitrate: u32) -> TransportResult<()> {
        self.bring_up(channel, |handle, capability| {
            let timing = nominal_timing(capability.fclk_can, nominal_bitrate).ok_or(
                TransportError::UnsupportedBitrate {
                    bitrate: nominal_bitrate,
                    clock_hz: capability.fclk_can,
                },
            )?;
            control_out(handle, GS_USB_BREQ_BITTIMING, &timing.pack())?;
            Ok(0)
        })
    }

    fn init_fd(&mut self, channel: ChannelHandle, timing: &BitTimingConfig) -> TransportResult<()> {
        self.bring_up(channel, |handle, capability| {
            if !capability.supports_fd() {
                return Err(TransportError::Driver(format!(
                    "channel {} does not support CAN FD",
                    channel
                )));
            }
            if capability.fclk_can != timing.f_clock {
                return Err(TransportError::ClockMismatch {
                    expected: timing.f_clock,
                    actual: capability.fclk_can,
                });
            }
            let nominal = DeviceBitTiming::from(timing.nominal);
            let data = DeviceBitTiming::from(timing.data);
            debug!("Nominal timing {}; data timing {}", nominal, data);
            control_out(handle, GS_USB_BREQ_BITTIMING, &nominal.pack())?;
            control_out(handle, GS_USB_BREQ_DATA_BITTIMING, &data.pack())?;
            Ok(GS_CAN_MODE_FD)
        })
    }

    fn set_filter(&mut self, channel: ChannelHandle, low: u32, high: u32) -> TransportResult<()> {
        // No hardware acceptance filter; applied on read
        self.channel_mut(channel)?.filter = AcceptanceFilter::new(low, high);
        Ok(())
    }

    fn uninit(&mut self, channel: ChannelHandle) -> TransportResult<()> {
        self.channel(channel)?;
        match self.open.take() {
            Some(open) => open.close(),
            None => Err(TransportError::ChannelNotOpen(channel)),
        }
    }

    fn write(&mut self, channel: ChannelHandle, frame: &ClassicWireFrame) -> TransportResult<()> {
        self.channel(channel)?
            .send(&HostFrame::from_wire(frame, GS_USB_ECHO_ID))
    }

    fn write_fd(&mut self, channel: ChannelHandle, frame: &FdWireFrame) -> TransportResult<()> {
        self.channel(channel)?
            .send(&HostFrame::from_wire(frame, GS_USB_ECHO_ID))
    }

    fn read(
        &mut self,
        channel: ChannelHandle,
    ) -> TransportResult<Option<Received<ClassicWireFrame>>> {
        let timeout = self.read_timeout;
        self.channel(channel)?.receive(timeout)
    }

    fn read_fd(&mut self, channel: ChannelHandle) -> TransportResult<Option<Received<FdWireFrame>>> {
        let timeout = self.read_timeout;
        self.channel(channel)?.receive(timeout)
    }
}

impl std::fmt::Debug for GsUsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("GsUsbTransport");
        if let Some(open) = &self.open {
            s.field("channel", &open.channel)
                .field("fd_mode", &open.fd_mode())
                .field("flags", &format_args!("0x{:08x}", open.flags))
                .field("filter", &open.filter);
        }
        s.field("read_timeout", &self.read_timeout).finish()
    }
}

impl Drop for GsUsbTransport {
    fn drop(&mut self) {
        // Try to stop the adapter when dropped
        if let Some(open) = self.open.take() {
            let _ = open.close();
        }
    }
}
