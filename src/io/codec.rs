// src/io/codec.rs
//
// Frame codec trait for wire formats that are parsed outside a device driver.
//
// The line-serial protocol implements it in serial/codec.rs. SocketCAN hands
// us typed frames from the kernel and needs no codec.

use crate::io::{Frame, IoError};

/// Trait for CAN frame codecs.
///
/// The associated types define the protocol-specific raw frame formats.
pub trait FrameCodec {
    /// The raw frame type for decoding (e.g., byte slice, ASCII line)
    type RawFrame: ?Sized;

    /// The encoded frame type for transmission
    type EncodedFrame;

    /// Decode one raw unit into a Frame stamped with the current time.
    ///
    /// Returns `Err(IoError::Decode)` if the unit is malformed.
    fn decode(raw: &Self::RawFrame) -> Result<Frame, IoError>;

    /// Encode a frame for transmission.
    fn encode(frame: &Frame) -> Result<Self::EncodedFrame, IoError>;
}
