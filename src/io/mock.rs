// src/io/mock.rs
//
// In-memory transport for tests. A `MockBus` scripts what the adapter reads
// and records everything written through its sender.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Frame, FrameSender, IoError, TransportAdapter};

enum Scripted {
    Frame(Frame),
    Fail(String),
}

/// Shared control surface for a mock adapter and its sender.
#[derive(Clone, Default)]
pub struct MockBus {
    incoming: Arc<Mutex<VecDeque<Scripted>>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the adapter to read
    pub fn push(&self, frame: Frame) {
        self.incoming.lock().unwrap().push_back(Scripted::Frame(frame));
    }

    /// Queue a fatal read error
    pub fn push_error(&self, message: &str) {
        self.incoming
            .lock()
            .unwrap()
            .push_back(Scripted::Fail(message.to_string()));
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Frames written through any sender, in order
    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_ids(&self) -> Vec<u32> {
        self.sent().iter().map(Frame::id).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn adapter(&self) -> MockAdapter {
        MockAdapter { bus: self.clone() }
    }

    /// A sender not tied to any adapter, for scheduler tests
    pub fn sender(&self) -> Box<dyn FrameSender> {
        Box::new(MockSender { bus: self.clone() })
    }
}

pub struct MockAdapter {
    bus: MockBus,
}

impl TransportAdapter for MockAdapter {
    fn device(&self) -> &str {
        "mock"
    }

    fn read_frame(&mut self) -> Result<Option<Frame>, IoError> {
        let next = self.bus.incoming.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Frame(frame)) => Ok(Some(frame)),
            Some(Scripted::Fail(message)) => Err(IoError::read("mock", message)),
            None => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
        }
    }

    fn sender(&self) -> Result<Box<dyn FrameSender>, IoError> {
        Ok(self.bus.sender())
    }

    fn supports_hardware_filter(&self) -> bool {
        false
    }

    fn close(&mut self) {
        self.bus.closed.store(true, Ordering::SeqCst);
    }
}

struct MockSender {
    bus: MockBus,
}

impl FrameSender for MockSender {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), IoError> {
        if self.bus.fail_sends.load(Ordering::SeqCst) {
            return Err(IoError::send("mock", "bus refused frame"));
        }
        self.bus.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }
}
