// src/transmit/scheduler.rs
//
// Transmit scheduler: periodic timers, RTR/Trigger auto-responders and
// two-phase scenario activation over the transmit table.
//
// Timers are keyed by `SlotId` and resolve the slot's current contents on
// every firing. A firing re-checks, under the scheduler lock, that its timer
// is still registered before sending; cancellation removes the registration
// under the same lock, so a cancelled timer never sends afterwards even if
// its tick was already due.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{SlotId, TransmitSlot, TransmitTable, TxMode, ValidationError};
use crate::io::{Frame, IoError};
use crate::worker::{FrameHook, SendHandle};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Io(#[from] IoError),
}

// ============================================================================
// State
// ============================================================================

struct ArmedTimer {
    generation: u64,
    /// Scenario that armed this timer, if any
    scenario: Option<String>,
    handle: JoinHandle<()>,
}

/// Scenario waiting out its delay before arming its periodic slots
struct PendingPhase {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerState {
    next_generation: u64,
    timers: HashMap<SlotId, ArmedTimer>,
    pending: HashMap<String, PendingPhase>,
}

impl TimerState {
    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn cancel(&mut self, slot: SlotId) -> bool {
        match self.timers.remove(&slot) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    fn cancel_scenario(&mut self, name: &str) -> usize {
        if let Some(phase) = self.pending.remove(name) {
            phase.handle.abort();
        }
        let slots: Vec<SlotId> = self
            .timers
            .iter()
            .filter(|(_, t)| t.scenario.as_deref() == Some(name))
            .map(|(id, _)| *id)
            .collect();
        for slot in &slots {
            self.cancel(*slot);
        }
        slots.len()
    }

    fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
        for (_, phase) in self.pending.drain() {
            phase.handle.abort();
        }
        count
    }
}

struct Inner {
    table: Arc<Mutex<TransmitTable>>,
    send: SendHandle,
    state: Mutex<TimerState>,
    runtime: Handle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.cancel_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Cloneable handle to one scheduler. Timers stop when the last handle drops.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Timer tasks are spawned on `runtime`.
    pub fn new(table: Arc<Mutex<TransmitTable>>, send: SendHandle, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                table,
                send,
                state: Mutex::new(TimerState::default()),
                runtime,
            }),
        }
    }

    pub fn table(&self) -> &Arc<Mutex<TransmitTable>> {
        &self.inner.table
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.inner.state).timers.len()
    }

    pub fn is_armed(&self, slot: SlotId) -> bool {
        lock(&self.inner.state).timers.contains_key(&slot)
    }

    // ------------------------------------------------------------------------
    // One-shot sends
    // ------------------------------------------------------------------------

    /// Send an arbitrary frame once, outside the table
    pub fn send_single_shot(&self, frame: &Frame) -> Result<(), IoError> {
        self.inner.send.send(frame)
    }

    /// Send one slot's frame once and count it on success
    pub fn send_slot(&self, slot: SlotId) -> Result<(), ScheduleError> {
        let frame = {
            let table = lock(&self.inner.table);
            table
                .get(slot)
                .map(TransmitSlot::frame)
                .ok_or(ValidationError::UnknownSlot(slot))?
        };
        self.inner.send.send(&frame)?;
        lock(&self.inner.table).increment_sent(slot);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Periodic
    // ------------------------------------------------------------------------

    /// Arm a timer for every periodic slot with a non-zero period. Slots that
    /// were already armed are re-armed. Returns the number armed.
    pub fn send_all(&self) -> usize {
        let periodic: Vec<(SlotId, u32)> = {
            let table = lock(&self.inner.table);
            table
                .iter()
                .filter_map(|(id, slot)| slot.mode().active_period().map(|p| (id, p)))
                .collect()
        };
        let mut state = lock(&self.inner.state);
        for (slot, period_ms) in &periodic {
            arm(&self.inner, &mut state, *slot, *period_ms, None);
        }
        tlog!("[scheduler] Send all: {} periodic slot(s) armed", periodic.len());
        periodic.len()
    }

    /// Arm one slot. Fails if it is not a periodic slot with a non-zero period.
    pub fn arm(&self, slot: SlotId) -> Result<(), ValidationError> {
        let period_ms = {
            let table = lock(&self.inner.table);
            let entry = table.get(slot).ok_or(ValidationError::UnknownSlot(slot))?;
            entry
                .mode()
                .active_period()
                .ok_or_else(|| ValidationError::InvalidPeriod(entry.mode().label()))?
        };
        let mut state = lock(&self.inner.state);
        arm(&self.inner, &mut state, slot, period_ms, None);
        Ok(())
    }

    pub fn disarm(&self, slot: SlotId) -> bool {
        lock(&self.inner.state).cancel(slot)
    }

    // ------------------------------------------------------------------------
    // Reactive responders
    // ------------------------------------------------------------------------

    /// Answer one received frame: RTR slots matching a remote request, and
    /// Trigger slots watching the frame's id. Every match is an independent
    /// send attempt, in table order. Returns the number sent.
    pub fn respond(&self, frame: &Frame) -> usize {
        let responses: Vec<(SlotId, Frame)> = {
            let table = lock(&self.inner.table);
            table
                .iter()
                .filter_map(|(id, slot)| match slot.mode() {
                    TxMode::Rtr if frame.is_remote() && slot.id() == frame.id() => {
                        Some((id, slot.response_frame()))
                    }
                    TxMode::Trigger { trigger_id } if trigger_id == frame.id() => {
                        Some((id, slot.frame()))
                    }
                    _ => None,
                })
                .collect()
        };

        let mut sent = 0;
        for (slot, response) in responses {
            match self.inner.send.send(&response) {
                Ok(()) => {
                    lock(&self.inner.table).increment_sent(slot);
                    sent += 1;
                }
                Err(e) => tlog!(
                    "[scheduler] Response {} to 0x{:X} failed: {}",
                    slot,
                    frame.id(),
                    e
                ),
            }
        }
        sent
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    /// Activate a scenario: send its first slot now, then after `delay` arm
    /// every remaining periodic slot of the group.
    ///
    /// Re-activating cancels that scenario's own timers and any pending
    /// second phase first. If the impulse send fails nothing is armed.
    pub fn activate_scenario(&self, name: &str, delay: Duration) -> Result<(), ScheduleError> {
        let name = name.trim().to_string();
        let group = lock(&self.inner.table).scenario(&name);
        let Some((&impulse, environment)) = group.split_first() else {
            return Err(ValidationError::UnknownScenario(name).into());
        };

        let cancelled = lock(&self.inner.state).cancel_scenario(&name);
        if cancelled > 0 {
            tlog!("[scheduler] Scenario '{}': cancelled {} timer(s)", name, cancelled);
        }

        if let Err(e) = self.send_slot(impulse) {
            tlog!("[scheduler] Scenario '{}': impulse failed: {}", name, e);
            return Err(e);
        }

        let environment = environment.to_vec();
        let weak = Arc::downgrade(&self.inner);
        let mut state = lock(&self.inner.state);
        let generation = state.generation();
        let task_name = name.clone();
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                start_environment(&inner, &task_name, generation, &environment);
            }
        });
        state
            .pending
            .insert(name.clone(), PendingPhase { generation, handle });

        tlog!(
            "[scheduler] Scenario '{}' activated, periodic phase in {} ms",
            name,
            delay.as_millis()
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cancellation and table edits
    // ------------------------------------------------------------------------

    /// Cancel every timer and pending scenario phase. Slot contents and
    /// counts are left alone.
    pub fn stop_all(&self) {
        let cancelled = lock(&self.inner.state).cancel_all();
        tlog!("[scheduler] Stopped {} timer(s)", cancelled);
    }

    /// Replace a slot's contents. An armed slot is re-armed with its new
    /// period, or disarmed if it is no longer periodic.
    pub fn update_slot(&self, slot: SlotId, contents: TransmitSlot) -> Result<(), ValidationError> {
        let period = contents.mode().active_period();
        lock(&self.inner.table).update(slot, contents)?;

        let mut state = lock(&self.inner.state);
        let Some(scenario) = state.timers.get(&slot).map(|t| t.scenario.clone()) else {
            return Ok(());
        };
        match period {
            Some(period_ms) => arm(&self.inner, &mut state, slot, period_ms, scenario),
            None => {
                state.cancel(slot);
            }
        }
        Ok(())
    }

    /// Cancel a slot's timer, then remove the slot.
    pub fn delete_slot(&self, slot: SlotId) -> Result<TransmitSlot, ValidationError> {
        if slot == lock(&self.inner.table).scratch_id() {
            return Err(ValidationError::ScratchSlot);
        }
        lock(&self.inner.state).cancel(slot);
        lock(&self.inner.table).remove(slot)
    }

    /// Stop everything and reset the table to its scratch slot
    pub fn clear_table(&self) {
        self.stop_all();
        lock(&self.inner.table).clear();
    }

    /// Stop everything and load new table contents (first slot becomes slot 0)
    pub fn replace_table(&self, slots: Vec<TransmitSlot>) {
        self.stop_all();
        let count = slots.len();
        lock(&self.inner.table).replace_all(slots);
        tlog!("[scheduler] Loaded {} slot(s)", count);
    }
}

impl FrameHook for Scheduler {
    fn on_frame(&self, frame: &Frame) {
        self.respond(frame);
    }
}

// ============================================================================
// Timer Tasks
// ============================================================================

/// Register and spawn a periodic timer, replacing any existing one for `slot`.
/// The first firing is one period from now.
fn arm(
    inner: &Arc<Inner>,
    state: &mut TimerState,
    slot: SlotId,
    period_ms: u32,
    scenario: Option<String>,
) {
    state.cancel(slot);
    let generation = state.generation();
    let period = Duration::from_millis(period_ms as u64);
    let weak = Arc::downgrade(inner);

    let handle = inner.runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            if !fire(&inner, slot, generation) {
                break;
            }
        }
    });

    state.timers.insert(
        slot,
        ArmedTimer {
            generation,
            scenario,
            handle,
        },
    );
}

/// One timer firing. Returns false when the timer should end.
///
/// The scheduler lock is held across the send so a concurrent cancel either
/// happens before the check (and we skip) or after the send completes.
fn fire(inner: &Inner, slot: SlotId, generation: u64) -> bool {
    let mut state = lock(&inner.state);
    if state.timers.get(&slot).map(|t| t.generation) != Some(generation) {
        return false;
    }

    let frame = {
        let table = lock(&inner.table);
        match table.get(slot) {
            Some(contents) if contents.mode().active_period().is_some() => Some(contents.frame()),
            _ => None,
        }
    };
    let Some(frame) = frame else {
        // Slot removed or no longer periodic
        state.timers.remove(&slot);
        return false;
    };

    // Blocks this runtime worker, and any other firing waiting on the state
    // lock, for at most `SEND_TIMEOUT`.
    match inner.send.send(&frame) {
        Ok(()) => lock(&inner.table).increment_sent(slot),
        Err(e) => tlog!("[scheduler] Periodic send {} failed: {}", slot, e),
    }
    true
}

/// Second phase of a scenario: arm its periodic slots if this activation is
/// still the current one.
fn start_environment(inner: &Arc<Inner>, name: &str, generation: u64, slots: &[SlotId]) {
    let mut state = lock(&inner.state);
    if state.pending.get(name).map(|p| p.generation) != Some(generation) {
        return;
    }
    state.pending.remove(name);

    let periodic: Vec<(SlotId, u32)> = {
        let table = lock(&inner.table);
        slots
            .iter()
            .filter_map(|id| {
                table
                    .get(*id)
                    .and_then(|slot| slot.mode().active_period())
                    .map(|p| (*id, p))
            })
            .collect()
    };
    for (slot, period_ms) in &periodic {
        arm(inner, &mut state, *slot, *period_ms, Some(name.to_string()));
    }
    tlog!(
        "[scheduler] Scenario '{}': {} periodic slot(s) armed",
        name,
        periodic.len()
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::mock::MockBus;

    struct Rig {
        bus: MockBus,
        table: Arc<Mutex<TransmitTable>>,
        scheduler: Scheduler,
    }

    fn rig() -> Rig {
        let bus = MockBus::new();
        let send = SendHandle::new();
        send.install(bus.sender(), false);
        let table = Arc::new(Mutex::new(TransmitTable::new()));
        let scheduler = Scheduler::new(table.clone(), send, Handle::current());
        Rig {
            bus,
            table,
            scheduler,
        }
    }

    impl Rig {
        fn add(&self, id: u32, mode: TxMode, comment: &str) -> SlotId {
            let slot = TransmitSlot::new(id, false, false, 1, &[id as u8], mode, comment).unwrap();
            self.table.lock().unwrap().append(slot)
        }

        fn count(&self, slot: SlotId) -> u32 {
            self.table.lock().unwrap().get(slot).unwrap().sent_count()
        }

        fn sent_of(&self, id: u32) -> usize {
            self.bus.sent_ids().iter().filter(|&&x| x == id).count()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn periodic(period_ms: u32) -> TxMode {
        TxMode::Periodic { period_ms }
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_fires_nine_times_in_950ms() {
        let rig = rig();
        let slot = rig.add(0x100, periodic(100), "");
        assert_eq!(rig.scheduler.send_all(), 1);

        tokio::time::sleep(ms(950)).await;
        assert_eq!(rig.bus.sent().len(), 9);
        assert_eq!(rig.count(slot), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_and_other_modes_are_inert() {
        let rig = rig();
        rig.add(0x100, periodic(0), "");
        rig.add(0x200, TxMode::Rtr, "");
        rig.add(0x300, TxMode::Off, "");
        assert_eq!(rig.scheduler.send_all(), 0);
        tokio::time::sleep(ms(1000)).await;
        assert!(rig.bus.sent().is_empty());
        let scratch = rig.table.lock().unwrap().scratch_id();
        assert!(rig.scheduler.arm(scratch).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_firing_reads_current_contents() {
        let rig = rig();
        let slot = rig.add(0x100, periodic(100), "");
        rig.scheduler.send_all();
        tokio::time::sleep(ms(150)).await;

        let edited = TransmitSlot::new(0x100, false, false, 2, &[0xAB, 0xCD], periodic(100), "").unwrap();
        rig.scheduler.update_slot(slot, edited).unwrap();
        tokio::time::sleep(ms(110)).await;

        let sent = rig.bus.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].payload(), &[0x00]);
        assert_eq!(sent[1].payload(), &[0xAB, 0xCD]);
        assert_eq!(rig.count(slot), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_to_off_disarms() {
        let rig = rig();
        let slot = rig.add(0x100, periodic(100), "");
        rig.scheduler.send_all();
        let off = TransmitSlot::new(0x100, false, false, 0, &[], TxMode::Off, "").unwrap();
        rig.scheduler.update_slot(slot, off).unwrap();
        assert!(!rig.scheduler.is_armed(slot));
        tokio::time::sleep(ms(500)).await;
        assert!(rig.bus.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_cancels_everything() {
        let rig = rig();
        let a = rig.add(0x100, periodic(100), "");
        rig.add(0x200, periodic(30), "");
        rig.scheduler.send_all();
        tokio::time::sleep(ms(250)).await;
        let before = rig.bus.sent().len();
        assert!(before > 0);

        rig.scheduler.stop_all();
        assert_eq!(rig.scheduler.armed_count(), 0);
        tokio::time::sleep(ms(2000)).await;
        assert_eq!(rig.bus.sent().len(), before);
        assert_eq!(rig.count(a), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_timer_first() {
        let rig = rig();
        let a = rig.add(0x100, periodic(100), "");
        let b = rig.add(0x200, periodic(100), "");
        rig.scheduler.send_all();
        tokio::time::sleep(ms(150)).await;

        let removed = rig.scheduler.delete_slot(a).unwrap();
        assert_eq!(removed.id(), 0x100);
        assert!(!rig.scheduler.is_armed(a));
        tokio::time::sleep(ms(300)).await;

        assert_eq!(rig.sent_of(0x100), 1);
        assert_eq!(rig.sent_of(0x200), 4);
        assert!(rig.scheduler.is_armed(b));
        let scratch = rig.table.lock().unwrap().scratch_id();
        assert_eq!(rig.scheduler.delete_slot(scratch), Err(ValidationError::ScratchSlot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_stop_timers() {
        let rig = rig();
        let slot = rig.add(0x100, periodic(100), "");
        rig.scheduler.send_all();
        rig.bus.set_fail_sends(true);
        tokio::time::sleep(ms(350)).await;
        assert!(rig.bus.sent().is_empty());
        assert_eq!(rig.count(slot), 0);

        rig.bus.set_fail_sends(false);
        tokio::time::sleep(ms(100)).await;
        assert_eq!(rig.bus.sent().len(), 1);
        assert_eq!(rig.count(slot), 1);
    }

    #[tokio::test]
    async fn test_rtr_response() {
        let rig = rig();
        let slot = TransmitSlot::new(0x100, false, false, 4, &[1, 2, 3, 4], TxMode::Rtr, "").unwrap();
        let id = rig.table.lock().unwrap().append(slot);

        let request = Frame::remote(0x100, false, 4, 0.0).unwrap();
        assert_eq!(rig.scheduler.respond(&request), 1);

        let sent = rig.bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id(), 0x100);
        assert!(!sent[0].is_remote());
        assert_eq!(sent[0].dlc(), 4);
        assert_eq!(sent[0].payload(), &[1, 2, 3, 4]);
        assert_eq!(rig.count(id), 1);

        // A data frame with the same id is not a request
        let data = Frame::data(0x100, false, &[9], 0.0).unwrap();
        assert_eq!(rig.scheduler.respond(&data), 0);
    }

    #[tokio::test]
    async fn test_trigger_matches_fire_in_table_order() {
        let rig = rig();
        let first = rig.add(0x301, TxMode::Trigger { trigger_id: 0x200 }, "");
        rig.add(0x302, TxMode::Trigger { trigger_id: 0x999 }, "");
        let third = rig.add(0x303, TxMode::Trigger { trigger_id: 0x200 }, "");

        let seen = Frame::data(0x200, false, &[0], 0.0).unwrap();
        assert_eq!(rig.scheduler.respond(&seen), 2);
        assert_eq!(rig.bus.sent_ids(), vec![0x301, 0x303]);
        assert_eq!(rig.count(first), 1);
        assert_eq!(rig.count(third), 1);

        rig.bus.set_fail_sends(true);
        assert_eq!(rig.scheduler.respond(&seen), 0);
        assert_eq!(rig.count(first), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_two_phases() {
        let rig = rig();
        let a = rig.add(0xA, TxMode::Off, "Crank");
        let b = rig.add(0xB, periodic(50), "Crank");
        let c = rig.add(0xC, periodic(100), "Crank");
        rig.add(0xD, periodic(10), "");

        rig.scheduler.activate_scenario("Crank", ms(200)).unwrap();
        assert_eq!(rig.bus.sent_ids(), vec![0xA]);
        assert_eq!(rig.count(a), 1);

        tokio::time::sleep(ms(199)).await;
        assert_eq!(rig.bus.sent_ids(), vec![0xA]);
        assert!(!rig.scheduler.is_armed(b));

        tokio::time::sleep(ms(61)).await;
        assert!(rig.scheduler.is_armed(b));
        assert!(rig.scheduler.is_armed(c));
        assert_eq!(rig.sent_of(0xB), 1);
        assert_eq!(rig.sent_of(0xC), 0);

        tokio::time::sleep(ms(41)).await;
        assert_eq!(rig.sent_of(0xB), 2);
        assert_eq!(rig.sent_of(0xC), 1);
        assert_eq!(rig.sent_of(0xD), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_reactivation_cancels_only_its_timers() {
        let rig = rig();
        rig.add(0xA, TxMode::Off, "Idle");
        let b = rig.add(0xB, periodic(100), "Idle");
        let other = rig.add(0xD, periodic(100), "");
        rig.scheduler.arm(other).unwrap();

        rig.scheduler.activate_scenario("Idle", ms(0)).unwrap();
        tokio::time::sleep(ms(150)).await;
        assert_eq!(rig.sent_of(0xB), 1);

        // Restart: B's timer is re-armed relative to the new activation
        rig.scheduler.activate_scenario("Idle", ms(200)).unwrap();
        assert!(!rig.scheduler.is_armed(b));
        assert!(rig.scheduler.is_armed(other));
        assert_eq!(rig.sent_of(0xA), 2);

        tokio::time::sleep(ms(250)).await;
        assert_eq!(rig.sent_of(0xB), 1);
        tokio::time::sleep(ms(80)).await;
        assert_eq!(rig.sent_of(0xB), 2);
        assert_eq!(rig.sent_of(0xD), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_during_delay_drops_old_phase() {
        let rig = rig();
        rig.add(0xA, TxMode::Off, "Wake");
        rig.add(0xB, periodic(100), "Wake");

        rig.scheduler.activate_scenario("Wake", ms(200)).unwrap();
        tokio::time::sleep(ms(100)).await;
        rig.scheduler.activate_scenario("Wake", ms(200)).unwrap();

        // The first activation's phase would have armed at 200 and fired at 300
        tokio::time::sleep(ms(250)).await;
        assert_eq!(rig.sent_of(0xB), 0);
        tokio::time::sleep(ms(60)).await;
        assert_eq!(rig.sent_of(0xB), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_impulse_skips_second_phase() {
        let rig = rig();
        rig.add(0xA, TxMode::Off, "Start");
        let b = rig.add(0xB, periodic(50), "Start");
        rig.bus.set_fail_sends(true);

        let result = rig.scheduler.activate_scenario("Start", ms(100));
        assert!(matches!(result, Err(ScheduleError::Io(_))));
        rig.bus.set_fail_sends(false);

        tokio::time::sleep(ms(1000)).await;
        assert!(!rig.scheduler.is_armed(b));
        assert!(rig.bus.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_scenario() {
        let rig = rig();
        let result = rig.scheduler.activate_scenario("Nope", ms(0));
        assert!(matches!(
            result,
            Err(ScheduleError::Validation(ValidationError::UnknownScenario(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_drops_pending_scenario() {
        let rig = rig();
        rig.add(0xA, TxMode::Off, "S");
        rig.add(0xB, periodic(50), "S");
        rig.scheduler.activate_scenario("S", ms(100)).unwrap();
        rig.scheduler.stop_all();
        tokio::time::sleep(ms(500)).await;
        assert_eq!(rig.bus.sent_ids(), vec![0xA]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_and_replace_table() {
        let rig = rig();
        rig.add(0x100, periodic(100), "");
        rig.scheduler.send_all();
        rig.scheduler.clear_table();
        assert_eq!(rig.scheduler.armed_count(), 0);
        assert_eq!(rig.table.lock().unwrap().len(), 1);

        let slots = vec![
            TransmitSlot::new(0x1, false, false, 0, &[], TxMode::Off, "").unwrap(),
            TransmitSlot::new(0x2, false, false, 0, &[], periodic(100), "").unwrap(),
        ];
        rig.scheduler.replace_table(slots);
        assert_eq!(rig.table.lock().unwrap().len(), 2);
        assert_eq!(rig.scheduler.send_all(), 1);
        tokio::time::sleep(ms(110)).await;
        assert_eq!(rig.bus.sent_ids(), vec![0x2]);
    }

    #[tokio::test]
    async fn test_single_shot_and_listen_only() {
        let rig = rig();
        let frame = Frame::data(0x7DF, false, &[2, 1, 0], 0.0).unwrap();
        rig.scheduler.send_single_shot(&frame).unwrap();
        assert_eq!(rig.bus.sent_ids(), vec![0x7DF]);

        let send = SendHandle::new();
        send.install(rig.bus.sender(), true);
        let quiet = Scheduler::new(rig.table.clone(), send, Handle::current());
        assert!(quiet.send_single_shot(&frame).is_err());
    }
}
