// src/worker.rs
//
// Receive worker: owns one transport adapter, runs the blocking read loop on a
// dedicated thread, applies the software filter, lets the reactive responder
// see each accepted frame, then publishes it to every subscriber.
//
// The companion send path (`SendHandle`) is shared with the transmit
// scheduler. Sends from the read thread (RTR/Trigger responses) and from
// scheduler timers are serialised by the handle's mutex.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::broadcast;

use crate::filter::{passes, FilterSet};
use crate::io::{open_adapter, Frame, FrameSender, IoError, TransportAdapter};
use crate::settings::{ConnectionSettings, Shared};

/// Published events buffered per subscriber before it starts lagging
const EVENT_CAPACITY: usize = 16384;

// ============================================================================
// Types
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Opening,
    Running,
    Closing,
    /// Open or read failure; holds the reason until the next start
    Failed(String),
}

/// What the worker publishes to its subscribers
#[derive(Clone, Debug)]
pub enum WorkerEvent {
    Connected { device: String },
    Frame(Frame),
    ConnectionLost(String),
    Stopped,
}

/// Synchronous observer run on the read thread for every accepted frame,
/// before the frame is published.
pub trait FrameHook: Send + Sync {
    fn on_frame(&self, frame: &Frame);
}

// ============================================================================
// Send Path
// ============================================================================

/// Cloneable handle to the active adapter's send half.
#[derive(Clone, Default)]
pub struct SendHandle {
    sender: Arc<Mutex<Option<Box<dyn FrameSender>>>>,
    listen_only: Arc<AtomicBool>,
}

impl SendHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send one frame. Blocks at most for the adapter's send timeout.
    pub fn send(&self, frame: &Frame) -> Result<(), IoError> {
        if self.listen_only.load(Ordering::SeqCst) {
            return Err(IoError::send("worker", "listen-only mode"));
        }
        let mut guard = self
            .sender
            .lock()
            .map_err(|e| IoError::send("worker", format!("send lock poisoned: {}", e)))?;
        match guard.as_mut() {
            Some(sender) => sender.send_frame(frame),
            None => Err(IoError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sender.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub(crate) fn install(&self, sender: Box<dyn FrameSender>, listen_only: bool) {
        self.listen_only.store(listen_only, Ordering::SeqCst);
        if let Ok(mut guard) = self.sender.lock() {
            *guard = Some(sender);
        }
    }

    pub(crate) fn clear(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            *guard = None;
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

pub struct ReceiveWorker {
    filters: Shared<FilterSet>,
    events: broadcast::Sender<WorkerEvent>,
    state: Arc<Mutex<WorkerState>>,
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    send: SendHandle,
    hook: Option<Arc<dyn FrameHook>>,
}

impl ReceiveWorker {
    pub fn new(filters: Shared<FilterSet>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            filters,
            events,
            state: Arc::new(Mutex::new(WorkerState::Idle)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
            send: SendHandle::new(),
            hook: None,
        }
    }

    /// Register the responder consulted for every accepted frame.
    /// Takes effect on the next `start`.
    pub fn set_hook(&mut self, hook: Arc<dyn FrameHook>) {
        self.hook = Some(hook);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn send_handle(&self) -> SendHandle {
        self.send.clone()
    }

    pub fn filters(&self) -> &Shared<FilterSet> {
        &self.filters
    }

    pub fn state(&self) -> WorkerState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// True while the read thread is running
    pub fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn set_state(&self, state: WorkerState) {
        set_state(&self.state, state);
    }

    /// Open the adapter described by `settings` and start reading.
    ///
    /// Open failures are returned to the caller and leave the worker `Failed`;
    /// there is no retry.
    pub fn start(&mut self, settings: &ConnectionSettings) -> Result<(), IoError> {
        self.ensure_stopped()?;
        self.set_state(WorkerState::Opening);

        let adapter = match open_adapter(settings, &settings.hardware_filters) {
            Ok(adapter) => adapter,
            Err(e) => {
                tlog!("[worker] Open failed: {}", e);
                self.set_state(WorkerState::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.start_with(adapter, settings.listen_only)
    }

    /// Start reading from an already opened adapter.
    pub fn start_with(
        &mut self,
        mut adapter: Box<dyn TransportAdapter>,
        listen_only: bool,
    ) -> Result<(), IoError> {
        self.ensure_stopped()?;
        self.set_state(WorkerState::Opening);

        let sender = match adapter.sender() {
            Ok(sender) => sender,
            Err(e) => {
                adapter.close();
                self.set_state(WorkerState::Failed(e.to_string()));
                return Err(e);
            }
        };
        self.send.install(sender, listen_only);
        self.stop_flag.store(false, Ordering::SeqCst);

        let device = adapter.device().to_string();
        let ctx = ReadLoop {
            adapter,
            filters: self.filters.clone(),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            stop_flag: Arc::clone(&self.stop_flag),
            send: self.send.clone(),
            hook: self.hook.clone(),
        };

        self.set_state(WorkerState::Running);
        let _ = self.events.send(WorkerEvent::Connected {
            device: device.clone(),
        });

        let handle = std::thread::Builder::new()
            .name("canlab-rx".to_string())
            .spawn(move || ctx.run())
            .map_err(|e| {
                let err = IoError::connection(&device, format!("spawn read thread: {}", e));
                self.send.clear();
                self.set_state(WorkerState::Failed(err.to_string()));
                err
            })?;
        self.thread = Some(handle);

        tlog!(
            "[worker] Started on {}{}",
            device,
            if listen_only { " (listen-only)" } else { "" }
        );
        Ok(())
    }

    /// Stop the read loop and close the adapter. Returns once the adapter is
    /// closed. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            self.send.clear();
            return;
        };

        let was_running = self.state() == WorkerState::Running;
        if was_running {
            self.set_state(WorkerState::Closing);
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            tlog!("[worker] Read thread panicked");
        }
        self.send.clear();

        // A failure reason stays visible after the orderly shutdown
        if !matches!(self.state(), WorkerState::Failed(_)) {
            self.set_state(WorkerState::Idle);
        }
        let _ = self.events.send(WorkerEvent::Stopped);
        tlog!("[worker] Stopped");
    }

    /// Reap a read thread that already exited (connection lost) so the worker
    /// can be started again. A live thread is an error.
    fn ensure_stopped(&mut self) -> Result<(), IoError> {
        match self.thread.take() {
            Some(handle) if !handle.is_finished() => {
                self.thread = Some(handle);
                Err(IoError::configuration("worker is already running"))
            }
            Some(handle) => {
                if handle.join().is_err() {
                    tlog!("[worker] Read thread panicked");
                }
                self.send.clear();
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for ReceiveWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<WorkerState>, next: WorkerState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

// ============================================================================
// Read Loop
// ============================================================================

struct ReadLoop {
    adapter: Box<dyn TransportAdapter>,
    filters: Shared<FilterSet>,
    events: broadcast::Sender<WorkerEvent>,
    state: Arc<Mutex<WorkerState>>,
    stop_flag: Arc<AtomicBool>,
    send: SendHandle,
    hook: Option<Arc<dyn FrameHook>>,
}

impl ReadLoop {
    fn run(mut self) {
        let mut filters = self.filters.current();
        let mut filter_version = self.filters.version();

        while !self.stop_flag.load(Ordering::SeqCst) {
            let frame = match self.adapter.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => continue,
                Err(e) if !e.is_fatal() => {
                    tlog!("[worker] {}", e);
                    continue;
                }
                Err(e) => {
                    tlog!("[worker] Connection lost: {}", e);
                    self.send.clear();
                    set_state(&self.state, WorkerState::Failed(e.to_string()));
                    let _ = self.events.send(WorkerEvent::ConnectionLost(e.to_string()));
                    break;
                }
            };

            let version = self.filters.version();
            if version != filter_version {
                filters = self.filters.current();
                filter_version = version;
                tlog!("[worker] Filter set updated (v{})", version);
            }
            if !passes(&frame, &filters) {
                continue;
            }

            if let Some(hook) = &self.hook {
                hook.on_frame(&frame);
            }

            // No subscribers is not an error
            let _ = self.events.send(WorkerEvent::Frame(frame));
        }

        self.adapter.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
