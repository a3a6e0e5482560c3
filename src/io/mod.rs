// src/io/mod.rs
//
// CAN frame type and the transport adapter abstraction.
// One adapter instance is owned by the receive worker; its companion send half
// is shared with the transmit scheduler.

pub mod codec; // Frame codec trait
mod error;
#[cfg(test)]
pub(crate) mod mock;
pub mod serial; // Line-oriented serial adapter
pub mod socketcan; // Native SocketCAN adapter (Linux)

pub use codec::FrameCodec;
pub use error::IoError;
pub use serial::{SerialLineAdapter, SerialLineCodec};

use once_cell::sync::Lazy;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::filter::MaskFilter;
use crate::settings::{ConnectionSettings, DeviceKind};

// ============================================================================
// Constants
// ============================================================================

/// Longest a blocking read may wait before the stop flag is checked again
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on a single blocking send
pub const SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest 11-bit identifier
pub const STANDARD_ID_MAX: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// Classic CAN payload limit
pub const MAX_DLC: u8 = 8;

// ============================================================================
// Time
// ============================================================================

static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic seconds since the first call in this process.
/// Used for frame receipt timestamps and inter-arrival periods.
pub fn now_secs() -> f64 {
    MONOTONIC_EPOCH.elapsed().as_secs_f64()
}

// ============================================================================
// Frame
// ============================================================================

/// Why a frame could not be constructed
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("DLC {0} out of range (max {MAX_DLC})")]
    DlcOutOfRange(u8),
    #[error("payload has {len} bytes but DLC is {dlc}")]
    PayloadLength { dlc: u8, len: usize },
    #[error("ID 0x{id:X} does not fit a {} identifier", id_width(.extended))]
    IdOutOfRange { id: u32, extended: bool },
}

fn id_width(extended: &bool) -> &'static str {
    if *extended {
        "29-bit"
    } else {
        "11-bit"
    }
}

/// One classic CAN frame. Immutable once constructed.
///
/// Invariant: `payload.len() == dlc` for data frames; remote frames carry an
/// empty payload and only a requested length.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    id: u32,
    extended: bool,
    remote: bool,
    dlc: u8,
    payload: Vec<u8>,
    timestamp: f64,
}

impl Frame {
    /// Build a frame, checking the id width, DLC range and payload length.
    pub fn new(
        id: u32,
        extended: bool,
        remote: bool,
        dlc: u8,
        payload: &[u8],
        timestamp: f64,
    ) -> Result<Self, FrameError> {
        let id_max = if extended { EXTENDED_ID_MAX } else { STANDARD_ID_MAX };
        if id > id_max {
            return Err(FrameError::IdOutOfRange { id, extended });
        }
        if dlc > MAX_DLC {
            return Err(FrameError::DlcOutOfRange(dlc));
        }
        if remote {
            return Ok(Self {
                id,
                extended,
                remote,
                dlc,
                payload: Vec::new(),
                timestamp,
            });
        }
        if payload.len() != dlc as usize {
            return Err(FrameError::PayloadLength {
                dlc,
                len: payload.len(),
            });
        }
        Ok(Self {
            id,
            extended,
            remote,
            dlc,
            payload: payload.to_vec(),
            timestamp,
        })
    }

    /// Data frame whose DLC is the payload length
    pub fn data(id: u32, extended: bool, payload: &[u8], timestamp: f64) -> Result<Self, FrameError> {
        let dlc = u8::try_from(payload.len()).map_err(|_| FrameError::DlcOutOfRange(u8::MAX))?;
        Self::new(id, extended, false, dlc, payload, timestamp)
    }

    /// Remote transmission request
    pub fn remote(id: u32, extended: bool, dlc: u8, timestamp: f64) -> Result<Self, FrameError> {
        Self::new(id, extended, true, dlc, &[], timestamp)
    }

    /// Standard data frame with id 0 and eight zero bytes
    pub fn zeroed() -> Self {
        Self {
            id: 0,
            extended: false,
            remote: false,
            dlc: MAX_DLC,
            payload: vec![0; MAX_DLC as usize],
            timestamp: 0.0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Receipt time in monotonic seconds (see [`now_secs`])
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Data frame with the same id and DLC, payload zero-padded to the DLC.
    /// Used to answer a remote request.
    pub fn to_data_response(&self) -> Self {
        let mut payload = self.payload.clone();
        payload.resize(self.dlc as usize, 0);
        Self {
            remote: false,
            payload,
            ..self.clone()
        }
    }

    /// Payload as upper-case hex pairs separated by spaces, e.g. `"01 AB FF"`
    pub fn payload_hex(&self) -> String {
        format_payload(&self.payload)
    }
}

/// Format bytes as upper-case hex pairs separated by single spaces
pub fn format_payload(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format an identifier the way the tool displays it: 3 hex digits for
/// standard ids, 8 for extended ones.
pub fn format_id(id: u32, extended: bool) -> String {
    if extended {
        format!("{:08X}", id)
    } else {
        format!("{:03X}", id)
    }
}

// ============================================================================
// Adapter Traits
// ============================================================================

/// A transport adapter owned by the receive worker.
///
/// Implementations block in `read_frame` for at most [`POLL_INTERVAL`] so the
/// worker can observe its stop flag promptly.
pub trait TransportAdapter: Send {
    /// Human-readable device label, e.g. `serial(/dev/ttyACM0)`
    fn device(&self) -> &str;

    /// Read one frame. `Ok(None)` means the poll interval elapsed with no
    /// complete frame; `Err` ends the session.
    fn read_frame(&mut self) -> Result<Option<Frame>, IoError>;

    /// Create the companion send half. Sends may run concurrently with reads.
    fn sender(&self) -> Result<Box<dyn FrameSender>, IoError>;

    /// Whether the mask filter was pushed down to the device at open time
    fn supports_hardware_filter(&self) -> bool;

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Send half of an adapter. Callers serialise access (see `worker::SendHandle`).
pub trait FrameSender: Send {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), IoError>;
}

/// Open the adapter variant named by the connection settings.
///
/// The mask filter is only meaningful for adapters that filter in hardware;
/// for the others it is ignored with a warning.
pub fn open_adapter(
    settings: &ConnectionSettings,
    mask: &MaskFilter,
) -> Result<Box<dyn TransportAdapter>, IoError> {
    match settings.device_kind {
        DeviceKind::SerialLine => {
            if mask.enabled {
                tlog!(
                    "[serial] Mask filter ignored: {} has no hardware filtering",
                    settings.channel
                );
            }
            let adapter = SerialLineAdapter::open(&settings.channel, settings.serial_baudrate)?;
            Ok(Box::new(adapter))
        }
        DeviceKind::SocketCan => socketcan::open(settings, mask),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_dlc_follows_payload() {
        let frame = Frame::data(0x123, false, &[1, 2, 3], 0.5).unwrap();
        assert_eq!(frame.dlc(), 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert!(!frame.is_remote());
        assert_eq!(frame.timestamp(), 0.5);
    }

    #[test]
    fn test_remote_frame_has_empty_payload() {
        let frame = Frame::new(0x100, false, true, 4, &[9, 9], 0.0).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.dlc(), 4);
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn test_data_response_pads_payload() {
        let rtr = Frame::remote(0x7DF, false, 3, 1.0).unwrap();
        let response = rtr.to_data_response();
        assert!(!response.is_remote());
        assert_eq!(response.dlc(), 3);
        assert_eq!(response.payload(), &[0, 0, 0]);

        let data = Frame::data(0x7E8, false, &[1, 2], 0.0).unwrap();
        assert_eq!(data.to_data_response(), data);
    }

    #[test]
    fn test_frame_rejects_bad_lengths() {
        assert_eq!(
            Frame::new(0x1, false, false, 4, &[1, 2], 0.0),
            Err(FrameError::PayloadLength { dlc: 4, len: 2 })
        );
        assert_eq!(
            Frame::new(0x1, false, false, 9, &[0; 9], 0.0),
            Err(FrameError::DlcOutOfRange(9))
        );
    }

    #[test]
    fn test_frame_rejects_wide_ids() {
        assert!(Frame::data(0x800, false, &[], 0.0).is_err());
        assert!(Frame::data(0x800, true, &[], 0.0).is_ok());
        assert!(Frame::data(0x2000_0000, true, &[], 0.0).is_err());
    }

    #[test]
    fn test_payload_hex_format() {
        let frame = Frame::data(0x1, false, &[0x01, 0xAB, 0xFF], 0.0).unwrap();
        assert_eq!(frame.payload_hex(), "01 AB FF");
        assert_eq!(format_payload(&[]), "");
    }

    #[test]
    fn test_format_id_width() {
        assert_eq!(format_id(0x12, false), "012");
        assert_eq!(format_id(0x12, true), "00000012");
    }

    #[test]
    fn test_now_secs_is_monotonic() {
        let a = now_secs();
        let b = now_secs();
        assert!(b >= a);
    }
}
