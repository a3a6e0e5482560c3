// src/io/serial/codec.rs
//
// Text line codec for the serial CAN bridge.
//
// Frame formats:
//   Receive: <ID:hex>,<DLC:hex>[,<byte:hex>]*DLC   e.g. "123,2,AA,BB"
//   Send:    S:<ID:hex>,<DLC:hex>[,<byte:hex>]*\n  e.g. "S:123,2,AA,BB\n"
//
// The bridge has no explicit extended flag: an ID written with more than three
// hex digits is a 29-bit ID, in both directions.

use crate::io::codec::FrameCodec;
use crate::io::{now_secs, Frame, IoError, MAX_DLC};

const DEVICE: &str = "serial";

/// Widest ID string that still denotes an 11-bit identifier
const STANDARD_ID_DIGITS: usize = 3;

/// Serial bridge text codec.
pub struct SerialLineCodec;

impl SerialLineCodec {
    /// Lines the bridge prints for humans (banners, warnings) rather than frames
    pub fn is_chatter(line: &str) -> bool {
        line.starts_with("---") || line.starts_with("!!!")
    }
}

impl FrameCodec for SerialLineCodec {
    /// Raw frame is one text line without its terminator
    type RawFrame = str;
    /// Encoded frame is the ASCII command including the trailing newline
    type EncodedFrame = Vec<u8>;

    /// Decode one received line.
    ///
    /// Examples:
    ///   `123,4,AA,BB,CC,DD` -> standard ID 0x123, DLC 4
    ///   `18FF0001,1,7`      -> extended ID 0x18FF0001, DLC 1, data 07
    ///   `7DF,0`             -> standard ID 0x7DF, no data
    fn decode(line: &str) -> Result<Frame, IoError> {
        let line = line.trim();
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 2 {
            return Err(IoError::protocol(
                DEVICE,
                format!("expected at least 2 fields, got {}: '{}'", fields.len(), line),
            ));
        }

        let id_str = fields[0];
        if id_str.is_empty() || id_str.len() > 8 {
            return Err(IoError::protocol(DEVICE, format!("invalid ID field: '{}'", id_str)));
        }
        let id = u32::from_str_radix(id_str, 16)
            .map_err(|_| IoError::protocol(DEVICE, format!("invalid hex ID: '{}'", id_str)))?;
        let extended = id_str.len() > STANDARD_ID_DIGITS;

        let dlc = u8::from_str_radix(fields[1], 16)
            .map_err(|_| IoError::protocol(DEVICE, format!("invalid DLC: '{}'", fields[1])))?;
        if dlc > MAX_DLC {
            return Err(IoError::protocol(
                DEVICE,
                format!("invalid DLC: {} (max {})", dlc, MAX_DLC),
            ));
        }

        let data_fields = &fields[2..];
        if data_fields.len() != dlc as usize {
            return Err(IoError::protocol(
                DEVICE,
                format!("DLC {} but {} data fields", dlc, data_fields.len()),
            ));
        }

        let mut data = Vec::with_capacity(dlc as usize);
        for byte_str in data_fields {
            if byte_str.is_empty() || byte_str.len() > 2 {
                return Err(IoError::protocol(DEVICE, format!("invalid data byte: '{}'", byte_str)));
            }
            let byte = u8::from_str_radix(byte_str, 16).map_err(|_| {
                IoError::protocol(DEVICE, format!("invalid hex byte: '{}'", byte_str))
            })?;
            data.push(byte);
        }

        Frame::data(id, extended, &data, now_secs())
            .map_err(|e| IoError::protocol(DEVICE, e.to_string()))
    }

    /// Encode a frame as a bridge send command.
    ///
    /// Extended IDs are zero-padded to 8 digits so the bridge recognises them;
    /// standard IDs use 3 digits. Remote frames are sent with their DLC and no
    /// data bytes.
    fn encode(frame: &Frame) -> Result<Vec<u8>, IoError> {
        let mut cmd = String::with_capacity(40);
        cmd.push_str("S:");
        if frame.is_extended() {
            cmd.push_str(&format!("{:08X}", frame.id()));
        } else {
            cmd.push_str(&format!("{:03X}", frame.id()));
        }
        cmd.push_str(&format!(",{:X}", frame.dlc()));
        for byte in frame.payload() {
            cmd.push_str(&format!(",{:02X}", byte));
        }
        cmd.push('\n');
        Ok(cmd.into_bytes())
    }
}

// ============================================================================
// Tests
// ============================================================================
