// src/session.rs
//
// One live connection: the receive worker, the transmit scheduler answering
// on its read path, and a dispatch task folding published frames into the
// Monitor Cache and Tracer Log.
//
// A low-frequency housekeeping task flushes live trace recording and watches
// the worker. When the read thread dies it performs an orderly disconnect
// (global timer stop, then worker stop); reconnecting is left to the caller.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::dbc::{DbcNames, NameResolver, NoDatabase};
use crate::filter::FilterSet;
use crate::io::{IoError, TransportAdapter};
use crate::monitor::MonitorCache;
use crate::report::TraceRecorder;
use crate::settings::{AppConfig, ConnectionSettings, Shared};
use crate::tracer::TracerLog;
use crate::transmit::{ScheduleError, Scheduler, TransmitTable};
use crate::worker::{ReceiveWorker, WorkerEvent, WorkerState};

/// Worker liveness poll and trace flush period
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(2);

/// Everything the dispatch task writes
#[derive(Default)]
pub struct SessionData {
    pub monitor: MonitorCache,
    pub tracer: TracerLog,
    pub recorder: Option<TraceRecorder>,
    /// Frames the dispatch task skipped because it fell behind the worker
    pub lost_frames: u64,
}

type SharedResolver = Arc<RwLock<Arc<dyn NameResolver>>>;

pub struct Session {
    settings: Shared<ConnectionSettings>,
    filters: Shared<FilterSet>,
    worker: Arc<Mutex<ReceiveWorker>>,
    scheduler: Scheduler,
    data: Arc<Mutex<SessionData>>,
    resolver: SharedResolver,
    runtime: Handle,
    scenario_delay: Duration,
    dispatch: Option<JoinHandle<()>>,
    housekeeping: Option<JoinHandle<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn current_resolver(resolver: &SharedResolver) -> Arc<dyn NameResolver> {
    match resolver.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

impl Session {
    /// Build an idle session. Tasks are spawned on `runtime` once connected.
    pub fn new(config: &AppConfig, runtime: Handle) -> Self {
        let filters = Shared::new(config.filters.clone());
        let mut worker = ReceiveWorker::new(filters.clone());
        let table = Arc::new(Mutex::new(TransmitTable::new()));
        let scheduler = Scheduler::new(table, worker.send_handle(), runtime.clone());
        worker.set_hook(Arc::new(scheduler.clone()));
        let resolver: Arc<dyn NameResolver> = Arc::new(NoDatabase);

        Self {
            settings: Shared::new(config.connection.clone()),
            filters,
            worker: Arc::new(Mutex::new(worker)),
            scheduler,
            data: Arc::new(Mutex::new(SessionData::default())),
            resolver: Arc::new(RwLock::new(resolver)),
            runtime,
            scenario_delay: Duration::from_millis(config.scenario_delay_ms),
            dispatch: None,
            housekeeping: None,
        }
    }

    // ------------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------------

    /// Open the configured adapter and start receiving. The mask of the
    /// current filter set is what gets pushed to the adapter.
    pub fn connect(&mut self) -> Result<(), IoError> {
        let mut settings = (*self.settings.current()).clone();
        settings.hardware_filters = self.filters.current().mask;

        let events = self.subscribe_fresh()?;
        lock(&self.worker).start(&settings)?;
        self.replace_tasks(events);
        tlog!("[session] Connected to {}", settings.channel);
        Ok(())
    }

    /// Start receiving from an adapter the caller already opened
    pub fn connect_with(
        &mut self,
        adapter: Box<dyn TransportAdapter>,
        listen_only: bool,
    ) -> Result<(), IoError> {
        let events = self.subscribe_fresh()?;
        lock(&self.worker).start_with(adapter, listen_only)?;
        self.replace_tasks(events);
        Ok(())
    }

    fn subscribe_fresh(&mut self) -> Result<broadcast::Receiver<WorkerEvent>, IoError> {
        if self.is_connected() {
            return Err(IoError::configuration("session is already connected"));
        }
        // The previous connection died before housekeeping noticed
        if self.housekeeping.as_ref().is_some_and(|task| !task.is_finished()) {
            tlog!("[session] Previous connection lost, stopping timers");
            self.scheduler.stop_all();
        }
        Ok(lock(&self.worker).subscribe())
    }

    /// Swap in tasks for a worker that just started
    fn replace_tasks(&mut self, events: broadcast::Receiver<WorkerEvent>) {
        self.stop_tasks();
        self.dispatch = Some(self.runtime.spawn(dispatch(
            events,
            Arc::clone(&self.data),
            Arc::clone(&self.resolver),
        )));
        self.housekeeping = Some(self.runtime.spawn(housekeeping(
            Arc::downgrade(&self.worker),
            self.scheduler.clone(),
            Arc::clone(&self.data),
        )));
    }

    fn stop_tasks(&mut self) {
        if let Some(task) = self.housekeeping.take() {
            task.abort();
        }
        // The dispatch task ends by itself on Stopped or ConnectionLost
        self.dispatch.take();
    }

    /// Orderly disconnect: stop every timer, then stop the worker.
    pub fn disconnect(&mut self) {
        self.scheduler.stop_all();
        lock(&self.worker).stop();
        if let Some(task) = self.housekeeping.take() {
            task.abort();
        }
        self.flush_recording();
        tlog!("[session] Disconnected");
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.worker).is_alive()
    }

    pub fn worker_state(&self) -> WorkerState {
        lock(&self.worker).state()
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Takes effect on the next connect
    pub fn update_settings(&self, settings: ConnectionSettings) {
        self.settings.replace(settings);
    }

    pub fn settings(&self) -> Arc<ConnectionSettings> {
        self.settings.current()
    }

    /// Swap the software filters. The worker picks the new set up on its
    /// next frame; a changed mask only applies on reconnect.
    pub fn set_filters(&self, filters: FilterSet) -> u64 {
        let mask_changed = filters.mask != self.filters.current().mask;
        let version = self.filters.replace(filters);
        if mask_changed && self.is_connected() {
            tlog!("[session] Hardware mask changed; reconnect to apply");
        }
        version
    }

    pub fn filters(&self) -> Arc<FilterSet> {
        self.filters.current()
    }

    pub fn scenario_delay(&self) -> Duration {
        self.scenario_delay
    }

    pub fn set_scenario_delay(&mut self, delay: Duration) {
        self.scenario_delay = delay;
    }

    // ------------------------------------------------------------------------
    // Names
    // ------------------------------------------------------------------------

    /// Replace the name source and re-apply names to everything cached.
    pub fn set_resolver(&self, resolver: Arc<dyn NameResolver>) {
        match self.resolver.write() {
            Ok(mut guard) => *guard = Arc::clone(&resolver),
            Err(poisoned) => *poisoned.into_inner() = Arc::clone(&resolver),
        }
        let mut data = lock(&self.data);
        data.monitor.rebuild_comments(resolver.as_ref());
        data.tracer.rebuild_comments(resolver.as_ref());
    }

    /// Load a DBC file or folder and use it for names. Returns the number of
    /// distinct message ids known.
    pub fn load_dbc(&self, path: &Path) -> Result<usize, String> {
        let names = DbcNames::load(path)?;
        let count = names.len();
        self.set_resolver(Arc::new(names));
        Ok(count)
    }

    pub fn unload_dbc(&self) {
        self.set_resolver(Arc::new(NoDatabase));
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Lock the monitor/tracer state for reading or export
    pub fn data(&self) -> MutexGuard<'_, SessionData> {
        lock(&self.data)
    }

    /// Stop all timers and clear the Monitor Cache and Tracer Log
    pub fn reset(&self) {
        self.scheduler.stop_all();
        let mut data = lock(&self.data);
        data.monitor.reset();
        data.tracer.reset();
        data.lost_frames = 0;
        tlog!("[session] Reset");
    }

    /// Write the tracer so far to `path`, then keep appending new frames
    /// every housekeeping tick until `stop_recording`.
    pub fn start_recording(&self, path: &Path) -> std::io::Result<()> {
        let mut data = lock(&self.data);
        let recorder = TraceRecorder::start(path, &data.tracer)?;
        data.recorder = Some(recorder);
        tlog!("[session] Recording trace to {}", path.display());
        Ok(())
    }

    pub fn stop_recording(&self) {
        self.flush_recording();
        lock(&self.data).recorder = None;
    }

    fn flush_recording(&self) {
        flush_recorder(&self.data);
    }

    // ------------------------------------------------------------------------
    // Transmit
    // ------------------------------------------------------------------------

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Activate a scenario with the configured delay
    pub fn activate_scenario(&self, name: &str) -> Result<(), ScheduleError> {
        self.scheduler.activate_scenario(name, self.scenario_delay)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_connected() {
            self.disconnect();
        }
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

async fn dispatch(
    mut events: broadcast::Receiver<WorkerEvent>,
    data: Arc<Mutex<SessionData>>,
    resolver: SharedResolver,
) {
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Frame(frame)) => {
                let name = current_resolver(&resolver).resolve(frame.id());
                let mut guard = lock(&data);
                let SessionData {
                    monitor,
                    tracer,
                    recorder,
                    ..
                } = &mut *guard;
                monitor.update(&frame, &name);
                tracer.append(frame, &name);
                if let (Some(recorder), Some(entry)) = (recorder.as_mut(), tracer.entries().last()) {
                    recorder.record(tracer, entry);
                }
            }
            Ok(WorkerEvent::Connected { device }) => tlog!("[session] Receiving from {}", device),
            Ok(WorkerEvent::ConnectionLost(reason)) => {
                tlog!("[session] Connection lost: {}", reason);
                break;
            }
            Ok(WorkerEvent::Stopped) | Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(skipped)) => {
                lock(&data).lost_frames += skipped;
                tlog!("[session] Dispatch lagging, {} frame(s) dropped", skipped)
            }
        }
    }
}

async fn housekeeping(
    worker: Weak<Mutex<ReceiveWorker>>,
    scheduler: Scheduler,
    data: Arc<Mutex<SessionData>>,
) {
    let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        flush_recorder(&data);

        let Some(worker) = worker.upgrade() else { break };
        let mut worker = lock(&worker);
        if worker.is_alive() {
            continue;
        }
        let reason = match worker.state() {
            WorkerState::Failed(reason) => reason,
            other => format!("{:?}", other),
        };
        tlog!("[session] Worker stopped unexpectedly ({}), disconnecting", reason);
        scheduler.stop_all();
        worker.stop();
        break;
    }
}

fn flush_recorder(data: &Mutex<SessionData>) {
    let mut data = lock(data);
    if let Some(recorder) = data.recorder.as_mut() {
        if let Err(e) = recorder.flush() {
            tlog!("[session] Trace flush to {} failed: {}", recorder.path().display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::MockBus;
    use crate::io::Frame;
    use crate::transmit::{TransmitSlot, TxMode};
    use std::time::Instant;

    fn session() -> (Session, MockBus) {
        let bus = MockBus::new();
        let mut session = Session::new(&AppConfig::default(), Handle::current());
        session.connect_with(Box::new(bus.adapter()), false).unwrap();
        (session, bus)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(4);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    fn frame(id: u32, payload: &[u8]) -> Frame {
        Frame::data(id, false, payload, crate::io::now_secs()).unwrap()
    }

    #[tokio::test]
    async fn test_frames_reach_monitor_and_tracer() {
        let (session, bus) = session();
        session.set_resolver(Arc::new(|id: u32| {
            if id == 0x100 {
                "EngineData".to_string()
            } else {
                String::new()
            }
        }));

        bus.push(frame(0x100, &[1]));
        bus.push(frame(0x200, &[2]));
        bus.push(frame(0x100, &[3]));
        assert!(wait_until(|| session.data().tracer.len() == 3).await);

        let data = session.data();
        assert_eq!(data.monitor.len(), 2);
        let entry = data.monitor.get(0x100).unwrap();
        assert_eq!(entry.count, 2);
        assert!(entry.changed);
        assert_eq!(entry.comment, "EngineData");
        let ids: Vec<u32> = data.tracer.entries().iter().map(|e| e.frame.id()).collect();
        assert_eq!(ids, vec![0x100, 0x200, 0x100]);
    }

    #[tokio::test]
    async fn test_software_filter_swap() {
        let (session, bus) = session();
        let mut filters = FilterSet::default();
        filters.discrete.ids.insert(0x7E8);
        filters.discrete.enabled = true;
        session.set_filters(filters);

        bus.push(frame(0x100, &[]));
        bus.push(frame(0x7E8, &[]));
        assert!(wait_until(|| session.data().tracer.len() == 1).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.data().tracer.entries()[0].frame.id(), 0x7E8);
        assert!(session.data().monitor.get(0x100).is_none());
    }

    #[tokio::test]
    async fn test_rtr_answered_on_read_path() {
        let (session, bus) = session();
        {
            let mut table = session.scheduler().table().lock().unwrap();
            table.append(TransmitSlot::new(0x321, false, false, 2, &[0xBE, 0xEF], TxMode::Rtr, "").unwrap());
        }
        bus.push(Frame::remote(0x321, false, 2, 0.0).unwrap());
        assert!(wait_until(|| bus.sent().len() == 1).await);
        let sent = bus.sent();
        assert_eq!(sent[0].id(), 0x321);
        assert!(!sent[0].is_remote());
        assert_eq!(sent[0].payload(), &[0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_rebuild_names_after_load() {
        let (session, bus) = session();
        bus.push(frame(0x100, &[1]));
        assert!(wait_until(|| session.data().tracer.len() == 1).await);
        assert_eq!(session.data().monitor.get(0x100).unwrap().comment, "");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.dbc");
        std::fs::write(
            &path,
            "VERSION \"\"\nNS_ :\n\nBS_:\nBU_: ECU1\n\nBO_ 256 EngineData: 8 ECU1\n SG_ Speed : 0|16@1+ (0.1,0) [0|6553.5] \"km/h\" Vector__XXX\n\n",
        )
        .unwrap();
        assert_eq!(session.load_dbc(&path).unwrap(), 1);

        let data = session.data();
        assert_eq!(data.monitor.get(0x100).unwrap().comment, "EngineData");
        assert_eq!(data.monitor.get(0x100).unwrap().count, 1);
        assert_eq!(data.tracer.entries()[0].name, "EngineData");
    }

    #[tokio::test]
    async fn test_reset_clears_and_stops_timers() {
        let (session, bus) = session();
        {
            let mut table = session.scheduler().table().lock().unwrap();
            table.append(
                TransmitSlot::new(0x400, false, false, 0, &[], TxMode::Periodic { period_ms: 10 }, "").unwrap(),
            );
        }
        assert_eq!(session.scheduler().send_all(), 1);
        bus.push(frame(0x1, &[]));
        assert!(wait_until(|| session.data().tracer.len() == 1).await);

        session.reset();
        assert_eq!(session.scheduler().armed_count(), 0);
        let data = session.data();
        assert!(data.tracer.is_empty());
        assert!(data.monitor.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let (mut session, bus) = session();
        assert!(session.is_connected());
        assert!(session.connect_with(Box::new(bus.adapter()), false).is_err());

        session.disconnect();
        assert!(!session.is_connected());
        assert!(bus.is_closed());
        assert_eq!(session.worker_state(), WorkerState::Idle);

        let second = MockBus::new();
        session.connect_with(Box::new(second.adapter()), false).unwrap();
        second.push(frame(0x55, &[]));
        assert!(wait_until(|| session.data().tracer.len() == 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_death_triggers_disconnect() {
        let (session, bus) = session();
        {
            let mut table = session.scheduler().table().lock().unwrap();
            table.append(
                TransmitSlot::new(0x400, false, false, 0, &[], TxMode::Periodic { period_ms: 20 }, "").unwrap(),
            );
        }
        session.scheduler().send_all();
        bus.push_error("cable unplugged");

        assert!(wait_until(|| session.scheduler().armed_count() == 0).await);
        assert!(!session.is_connected());
        assert!(matches!(session.worker_state(), WorkerState::Failed(_)));
    }

    #[tokio::test]
    async fn test_reconnect_after_connection_lost() {
        let (mut session, bus) = session();
        {
            let mut table = session.scheduler().table().lock().unwrap();
            table.append(
                TransmitSlot::new(0x400, false, false, 0, &[], TxMode::Periodic { period_ms: 20 }, "").unwrap(),
            );
        }
        session.scheduler().send_all();
        bus.push_error("cable unplugged");
        assert!(wait_until(|| !session.is_connected()).await);

        let second = MockBus::new();
        session.connect_with(Box::new(second.adapter()), false).unwrap();
        assert!(session.is_connected());
        assert_eq!(session.worker_state(), WorkerState::Running);
        assert_eq!(session.scheduler().armed_count(), 0);

        second.push(frame(0x55, &[]));
        assert!(wait_until(|| session.data().tracer.len() == 1).await);

        // The replaced housekeeping task must not tear down the new link
        tokio::time::sleep(HOUSEKEEPING_INTERVAL + Duration::from_millis(500)).await;
        assert!(session.is_connected());
        assert_eq!(session.data().tracer.len(), 1);
    }

    #[tokio::test]
    async fn test_lagging_dispatch_counts_lost_frames() {
        let (events, rx) = broadcast::channel(2);
        let data = Arc::new(Mutex::new(SessionData::default()));
        let resolver: Arc<dyn NameResolver> = Arc::new(NoDatabase);
        for id in 1..=5 {
            events.send(WorkerEvent::Frame(frame(id, &[]))).unwrap();
        }
        events.send(WorkerEvent::Stopped).unwrap();

        dispatch(rx, Arc::clone(&data), Arc::new(RwLock::new(resolver))).await;

        let data = lock(&data);
        assert_eq!(data.lost_frames, 4);
        assert_eq!(data.tracer.len(), 1);
        assert_eq!(data.tracer.entries()[0].frame.id(), 5);
    }

    #[tokio::test]
    async fn test_live_recording() {
        let (session, bus) = session();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.csv");
        session.start_recording(&path).unwrap();

        bus.push(frame(0x10, &[0xAA]));
        bus.push(frame(0x20, &[0xBB]));
        assert!(wait_until(|| session.data().tracer.len() == 2).await);
        session.stop_recording();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains(";010;1;AA;"));
        assert!(lines[2].contains(";020;1;BB;"));
        assert!(session.data().recorder.is_none());
    }
}
