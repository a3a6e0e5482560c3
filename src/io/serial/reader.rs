// src/io/serial/reader.rs
//
// Serial line adapter: reads newline-terminated text frames from a CAN bridge
// and writes send commands back through a cloned port handle.

use std::collections::VecDeque;
use std::io::{Read, Write};

use crate::io::codec::FrameCodec;
use crate::io::{Frame, FrameSender, IoError, TransportAdapter, POLL_INTERVAL, SEND_TIMEOUT};

use super::codec::SerialLineCodec;

/// Longest line the bridge can legitimately produce (8-digit ID, DLC, 8 bytes)
const MAX_LINE_LEN: usize = 64;

// ============================================================================
// Adapter
// ============================================================================

/// Receive side of a serial CAN bridge.
pub struct SerialLineAdapter {
    device: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    line_buf: String,
    pending: VecDeque<Frame>,
}

impl SerialLineAdapter {
    /// Open the port at `baud_rate` and discard anything buffered before we
    /// attached.
    pub fn open(port_path: &str, baud_rate: u32) -> Result<Self, IoError> {
        let device = format!("serial({})", port_path);

        let mut port = serialport::new(port_path, baud_rate)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| IoError::connection(&device, e.to_string()))?;
        let _ = port.clear(serialport::ClearBuffer::All);

        tlog!("[serial] Opened {} at {} baud", port_path, baud_rate);

        Ok(Self {
            device,
            port: Some(port),
            line_buf: String::with_capacity(MAX_LINE_LEN),
            pending: VecDeque::new(),
        })
    }

    /// Feed received bytes through the line assembler, queueing decoded frames.
    fn ingest(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if byte == b'\n' {
                if !self.line_buf.is_empty() {
                    self.finish_line();
                }
            } else if byte.is_ascii() && !byte.is_ascii_control() {
                self.line_buf.push(byte as char);
                if self.line_buf.len() > MAX_LINE_LEN {
                    tlog!("[serial] {} discarding overlong line", self.device);
                    self.line_buf.clear();
                }
            }
            // '\r' and other control bytes are dropped
        }
    }

    fn finish_line(&mut self) {
        let line = std::mem::take(&mut self.line_buf);
        if SerialLineCodec::is_chatter(&line) {
            return;
        }
        match SerialLineCodec::decode(&line) {
            Ok(frame) => self.pending.push_back(frame),
            Err(e) => tlog!("[serial] Dropped line '{}': {}", line, e),
        }
    }
}

impl TransportAdapter for SerialLineAdapter {
    fn device(&self) -> &str {
        &self.device
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, IoError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| IoError::read(&self.device, "port closed"))?;

        let mut read_buf = [0u8; 256];
        let n = match port.read(&mut read_buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => return Ok(None),
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
            Err(e) => return Err(IoError::read(&self.device, e.to_string())),
        };

        self.ingest(&read_buf[..n]);
        Ok(self.pending.pop_front())
    }

    fn sender(&self) -> Result<Box<dyn FrameSender>, IoError> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| IoError::connection(&self.device, "port closed"))?;
        let mut clone = port
            .try_clone()
            .map_err(|e| IoError::connection(&self.device, format!("clone port: {}", e)))?;
        clone
            .set_timeout(SEND_TIMEOUT)
            .map_err(|e| IoError::connection(&self.device, format!("set timeout: {}", e)))?;
        Ok(Box::new(SerialLineSender {
            device: self.device.clone(),
            port: clone,
        }))
    }

    fn supports_hardware_filter(&self) -> bool {
        false
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tlog!("[serial] Closed {}", self.device);
        }
        self.line_buf.clear();
        self.pending.clear();
    }
}

// ============================================================================
// Sender
// ============================================================================

/// Send half sharing the underlying OS handle with the adapter.
struct SerialLineSender {
    device: String,
    port: Box<dyn serialport::SerialPort>,
}

impl FrameSender for SerialLineSender {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), IoError> {
        let cmd = SerialLineCodec::encode(frame)?;
        self.port
            .write_all(&cmd)
            .and_then(|_| self.port.flush())
            .map_err(|e| IoError::send(&self.device, e.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================
