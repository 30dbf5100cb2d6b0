use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::notify::{NotificationSink, TimerUpdate};
use crate::section::{SectionId, SectionState, TickOutcome};
use crate::store::{SectionRecord, TimerStore};

/// Commands accepted by the registry, one per presentation-layer action.
#[derive(Debug, Clone)]
pub enum TimerCommand {
    /// Start counting down. A positive `remaining_ms` replaces the
    /// section's remaining time first; zero starts from the stored value.
    Start {
        section: SectionId,
        remaining_ms: u64,
    },
    Pause {
        section: SectionId,
    },
    Reset {
        section: SectionId,
    },
    /// Credit extra time. Non-positive deltas are rejected.
    AddTime {
        section: SectionId,
        delta_ms: i64,
    },
    /// Re-emit the current snapshot without changing state.
    RequestInfo {
        section: SectionId,
    },
    StopAlarm {
        section: SectionId,
    },
    Shutdown,
}

/// Construction parameters for [`TimerRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// The fixed set of section identifiers the registry manages.
    /// Commands naming any other identifier are ignored.
    pub sections: Vec<SectionId>,
    /// Cadence of the per-section countdown tick.
    pub tick_interval: Duration,
    /// Size of the command channel buffer.
    pub command_buffer_size: usize,
    /// Size of the internal tick channel buffer.
    pub tick_buffer_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sections: (1..=4).map(SectionId).collect(),
            tick_interval: Duration::from_secs(1),
            command_buffer_size: 32,
            tick_buffer_size: 32,
        }
    }
}

/// Internal tick message sent by a section's tick loop back to the
/// registry task, which is the only place state is mutated.
#[derive(Debug, Clone, Copy)]
struct TickEvent {
    section: SectionId,
    generation: u64,
}

/// A live tick loop for one running section.
struct TickLoop {
    token: CancellationToken,
    generation: u64,
}

/// The countdown engine: owns every section's state, applies commands in
/// arrival order, persists transitions through a [`TimerStore`], emits
/// through a [`NotificationSink`], and reconciles persisted state against
/// the wall clock once on startup.
///
/// All mutation happens on the registry task. Tick loops are spawned per
/// running section and only send [`TickEvent`]s; replacing a loop cancels
/// the old one and bumps a generation counter, so a lingering tick from a
/// cancelled loop is recognized as stale and dropped.
pub struct TimerRegistry {
    /// Channel for receiving timer commands
    command_rx: mpsc::Receiver<TimerCommand>,

    /// Sending side of the internal tick channel, cloned into tick loops
    tick_tx: mpsc::Sender<TickEvent>,
    tick_rx: mpsc::Receiver<TickEvent>,

    /// Per-section countdown state, fixed key set from construction
    sections: BTreeMap<SectionId, SectionState>,

    /// Live tick loops keyed by section
    loops: BTreeMap<SectionId, TickLoop>,
    next_generation: u64,

    store: Arc<dyn TimerStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,

    tick_interval: Duration,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

/// Handle for sending commands to the registry
#[derive(Clone)]
pub struct RegistryHandle {
    command_tx: mpsc::Sender<TimerCommand>,
}

impl TimerRegistry {
    /// Create a new registry and its command handle.
    ///
    /// The registry does nothing until [`run`](Self::run) is spawned;
    /// `run` performs recovery before accepting any command.
    pub fn new(
        config: RegistryConfig,
        store: Arc<dyn TimerStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        cancel_token: CancellationToken,
    ) -> (Self, RegistryHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer_size);
        let (tick_tx, tick_rx) = mpsc::channel(config.tick_buffer_size);

        let sections = config
            .sections
            .iter()
            .map(|id| (*id, SectionState::default()))
            .collect();

        let registry = TimerRegistry {
            command_rx,
            tick_tx,
            tick_rx,
            sections,
            loops: BTreeMap::new(),
            next_generation: 0,
            store,
            sink,
            clock,
            tick_interval: config.tick_interval,
            cancel_token,
        };

        let handle = RegistryHandle { command_tx };

        (registry, handle)
    }

    /// Run the registry: recover persisted sections, then process commands
    /// and ticks until shutdown.
    pub async fn run(mut self) {
        log::info!("Timer registry started with {} sections", self.sections.len());

        self.recover().await;

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.cancel_token.is_cancelled() {
                                log::info!("Timer registry cancelled");
                                break;
                            }
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            log::info!("Timer registry shutting down - all handles dropped");
                            break;
                        }
                    }
                },

                Some(event) = self.tick_rx.recv() => {
                    self.handle_tick(event).await;
                },

                _ = self.cancel_token.cancelled() => {
                    log::info!("Timer registry cancelled via token");
                    break;
                },
            }
        }

        self.teardown();
        log::info!("Timer registry stopped");
    }

    /// Handle one command. Returns `true` on shutdown.
    async fn handle_command(&mut self, command: TimerCommand) -> bool {
        match command {
            TimerCommand::Start {
                section,
                remaining_ms,
            } => self.start(section, remaining_ms).await,
            TimerCommand::Pause { section } => self.pause(section).await,
            TimerCommand::Reset { section } => self.reset(section).await,
            TimerCommand::AddTime { section, delta_ms } => self.add_time(section, delta_ms).await,
            TimerCommand::RequestInfo { section } => self.request_info(section),
            TimerCommand::StopAlarm { section } => self.stop_alarm(section),
            TimerCommand::Shutdown => return true,
        }
        false
    }

    async fn start(&mut self, section: SectionId, seed_remaining_ms: u64) {
        let now = self.clock.now_ms();
        let Some(state) = self.sections.get_mut(&section) else {
            log::warn!("Ignoring start for unknown section {}", section);
            return;
        };
        if state.is_running() {
            return;
        }
        if seed_remaining_ms > 0 {
            state.set_remaining(seed_remaining_ms);
        }
        let Some(end) = state.begin(now) else {
            log::debug!("Ignoring start for section {} with no time remaining", section);
            return;
        };
        let remaining = state.remaining_ms();

        self.sync_alarm_device();
        self.persist_running(section, remaining, end).await;
        self.spawn_tick_loop(section);
        self.emit(section, false);
        self.refresh_indicator();
    }

    async fn pause(&mut self, section: SectionId) {
        let Some(state) = self.sections.get_mut(&section) else {
            log::warn!("Ignoring pause for unknown section {}", section);
            return;
        };
        if !state.pause() {
            return;
        }
        let remaining = state.remaining_ms();

        self.cancel_tick_loop(section);
        self.persist(
            section,
            SectionRecord {
                running: false,
                remaining_ms: remaining,
                end_timestamp_ms: None,
            },
        )
        .await;
        self.emit(section, false);
        self.refresh_indicator();
    }

    async fn reset(&mut self, section: SectionId) {
        if !self.sections.contains_key(&section) {
            log::warn!("Ignoring reset for unknown section {}", section);
            return;
        }
        self.cancel_tick_loop(section);
        if let Some(state) = self.sections.get_mut(&section) {
            state.reset();
        }
        self.remove_persisted(section).await;
        self.sync_alarm_device();
        self.emit(section, false);
        self.refresh_indicator();
    }

    async fn add_time(&mut self, section: SectionId, delta_ms: i64) {
        if delta_ms <= 0 {
            log::debug!(
                "Ignoring non-positive time credit of {} ms for section {}",
                delta_ms,
                section
            );
            return;
        }
        let now = self.clock.now_ms();
        let Some(state) = self.sections.get_mut(&section) else {
            log::warn!("Ignoring time credit for unknown section {}", section);
            return;
        };
        let was_running = state.is_running();
        state.add_time(delta_ms as u64);

        if was_running {
            // Restart with a fresh end timestamp. The stop is internal:
            // no update is emitted between the cancel and the restart, so
            // the section never appears paused to an observer.
            state.pause();
            let Some(end) = state.begin(now) else {
                return;
            };
            let remaining = state.remaining_ms();

            self.sync_alarm_device();
            self.persist_running(section, remaining, end).await;
            self.spawn_tick_loop(section);
            self.emit(section, false);
            self.refresh_indicator();
        } else {
            let remaining = state.remaining_ms();

            self.sync_alarm_device();
            self.persist(
                section,
                SectionRecord {
                    running: false,
                    remaining_ms: remaining,
                    end_timestamp_ms: None,
                },
            )
            .await;
            self.emit(section, false);
        }
    }

    fn request_info(&self, section: SectionId) {
        if !self.sections.contains_key(&section) {
            log::warn!("Ignoring info request for unknown section {}", section);
            return;
        }
        self.emit(section, false);
    }

    fn stop_alarm(&mut self, section: SectionId) {
        let Some(state) = self.sections.get_mut(&section) else {
            log::warn!("Ignoring alarm stop for unknown section {}", section);
            return;
        };
        state.stop_alarm();
        self.emit(section, false);
        self.sync_alarm_device();
    }

    /// Apply one tick for a running section, ignoring ticks from loops
    /// that have since been cancelled or replaced.
    async fn handle_tick(&mut self, event: TickEvent) {
        let live = self
            .loops
            .get(&event.section)
            .map(|l| l.generation == event.generation)
            .unwrap_or(false);
        if !live {
            return;
        }
        let now = self.clock.now_ms();
        let outcome = match self.sections.get_mut(&event.section) {
            Some(state) => state.tick(now),
            None => return,
        };
        match outcome {
            TickOutcome::Continue(remaining) => {
                // remaining was just computed as end - now, so this
                // re-persists the original end timestamp.
                self.persist_running(event.section, remaining, now + remaining)
                    .await;
                self.emit(event.section, false);
                self.refresh_indicator();
            }
            TickOutcome::Finished => {
                self.finish_section(event.section).await;
            }
        }
    }

    /// A countdown reached zero: raise the alarm, erase persisted state,
    /// emit the finished update and the one-shot alert.
    async fn finish_section(&mut self, section: SectionId) {
        self.cancel_tick_loop(section);
        if let Some(state) = self.sections.get_mut(&section) {
            state.finish();
        }
        self.sync_alarm_device();
        self.remove_persisted(section).await;
        self.emit(section, true);
        self.refresh_indicator();
        self.sink.show_finished_alert(section);
    }

    /// One-time reconciliation at startup: resume or finalize every
    /// persisted section by diffing its absolute end timestamp against
    /// the current wall clock.
    async fn recover(&mut self) {
        let persisted = match self.store.active_sections().await {
            Ok(sections) => sections,
            Err(e) => {
                log::warn!("Recovery skipped, persisted sections unavailable: {}", e);
                return;
            }
        };

        for section in persisted {
            if !self.sections.contains_key(&section) {
                log::warn!("Skipping persisted state for unknown section {}", section);
                continue;
            }
            let record = match self.store.get(section).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Skipping section {} during recovery: {}", section, e);
                    continue;
                }
            };

            if record.running {
                let Some(end) = record.end_timestamp_ms else {
                    log::warn!(
                        "Skipping running section {} with no persisted end timestamp",
                        section
                    );
                    continue;
                };
                let now = self.clock.now_ms();
                if now < end {
                    // Time remains: resume anchored to the original end
                    // timestamp rather than restarting the duration.
                    let remaining = match self.sections.get_mut(&section) {
                        Some(state) => state.resume_anchored(end, now),
                        None => continue,
                    };
                    log::info!(
                        "Resuming section {} with {} ms remaining",
                        section,
                        remaining
                    );
                    self.persist_running(section, remaining, end).await;
                    self.spawn_tick_loop(section);
                    self.emit(section, false);
                } else {
                    // Finished while the process was down.
                    log::info!("Section {} finished while the process was down", section);
                    self.finish_section(section).await;
                }
            } else if record.remaining_ms > 0 {
                if let Some(state) = self.sections.get_mut(&section) {
                    state.set_remaining(record.remaining_ms);
                }
                self.emit(section, false);
            }
        }

        self.refresh_indicator();
    }

    /// Spawn the one-second tick loop for a section, replacing (and
    /// cancelling) any prior loop for it.
    fn spawn_tick_loop(&mut self, section: SectionId) {
        self.cancel_tick_loop(section);

        self.next_generation += 1;
        let generation = self.next_generation;
        let token = self.cancel_token.child_token();
        let tick_tx = self.tick_tx.clone();
        let tick_interval = self.tick_interval;

        self.loops.insert(
            section,
            TickLoop {
                token: token.clone(),
                generation,
            },
        );

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick completes immediately; swallow it so
            // the first real tick lands one interval after the start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if tick_tx.send(TickEvent { section, generation }).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn cancel_tick_loop(&mut self, section: SectionId) {
        if let Some(tick_loop) = self.loops.remove(&section) {
            tick_loop.token.cancel();
        }
    }

    /// Recompute the shared alarm device flag from the per-section map.
    fn sync_alarm_device(&self) {
        let any_playing = self.sections.values().any(|s| s.is_alarm_playing());
        self.sink.set_alarm_device_active(any_playing);
    }

    /// Recompute the ongoing indicator from the per-section map.
    fn refresh_indicator(&self) {
        let running: Vec<(SectionId, u64)> = self
            .sections
            .iter()
            .filter(|(_, state)| state.is_running())
            .map(|(id, state)| (*id, state.remaining_ms()))
            .collect();
        self.sink.refresh_ongoing_indicator(&running);
    }

    fn emit(&self, section: SectionId, finished: bool) {
        if let Some(state) = self.sections.get(&section) {
            self.sink.emit_update(TimerUpdate {
                section,
                remaining_ms: state.remaining_ms(),
                is_running: state.is_running(),
                is_alarm_playing: state.is_alarm_playing(),
                finished,
            });
        }
    }

    async fn persist_running(&self, section: SectionId, remaining_ms: u64, end_timestamp_ms: u64) {
        self.persist(
            section,
            SectionRecord {
                running: true,
                remaining_ms,
                end_timestamp_ms: Some(end_timestamp_ms),
            },
        )
        .await;
    }

    /// Best-effort durability: a failed write is logged, never allowed to
    /// block the command or desynchronize in-memory state.
    async fn persist(&self, section: SectionId, record: SectionRecord) {
        if let Err(e) = self.store.put(section, record).await {
            log::warn!("Failed to persist state for section {}: {}", section, e);
        }
    }

    async fn remove_persisted(&self, section: SectionId) {
        if let Err(e) = self.store.remove(section).await {
            log::warn!(
                "Failed to erase persisted state for section {}: {}",
                section,
                e
            );
        }
    }

    /// Cancel every live tick loop and silence the alarm device.
    fn teardown(&mut self) {
        while let Some((_, tick_loop)) = self.loops.pop_first() {
            tick_loop.token.cancel();
        }
        self.sink.set_alarm_device_active(false);
    }
}

impl RegistryHandle {
    /// Start a section's countdown. A positive `remaining_ms` replaces
    /// the section's remaining time first.
    pub async fn start(
        &self,
        section: SectionId,
        remaining_ms: u64,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx
            .send(TimerCommand::Start {
                section,
                remaining_ms,
            })
            .await
    }

    /// Start a section's countdown (non-blocking)
    pub fn try_start(
        &self,
        section: SectionId,
        remaining_ms: u64,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx.try_send(TimerCommand::Start {
            section,
            remaining_ms,
        })
    }

    /// Pause a section's countdown
    pub async fn pause(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx.send(TimerCommand::Pause { section }).await
    }

    /// Pause a section's countdown (non-blocking)
    pub fn try_pause(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx.try_send(TimerCommand::Pause { section })
    }

    /// Reset a section to the implicit zero state
    pub async fn reset(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx.send(TimerCommand::Reset { section }).await
    }

    /// Reset a section to the implicit zero state (non-blocking)
    pub fn try_reset(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx.try_send(TimerCommand::Reset { section })
    }

    /// Credit extra time to a section
    pub async fn add_time(
        &self,
        section: SectionId,
        delta_ms: i64,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx
            .send(TimerCommand::AddTime { section, delta_ms })
            .await
    }

    /// Credit extra time to a section (non-blocking)
    pub fn try_add_time(
        &self,
        section: SectionId,
        delta_ms: i64,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx
            .try_send(TimerCommand::AddTime { section, delta_ms })
    }

    /// Ask for a section's current snapshot to be re-emitted
    pub async fn request_info(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx
            .send(TimerCommand::RequestInfo { section })
            .await
    }

    /// Ask for a section's current snapshot to be re-emitted (non-blocking)
    pub fn try_request_info(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx
            .try_send(TimerCommand::RequestInfo { section })
    }

    /// Stop a section's alarm
    pub async fn stop_alarm(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx
            .send(TimerCommand::StopAlarm { section })
            .await
    }

    /// Stop a section's alarm (non-blocking)
    pub fn try_stop_alarm(
        &self,
        section: SectionId,
    ) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx.try_send(TimerCommand::StopAlarm { section })
    }

    /// Shutdown the registry
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<TimerCommand>> {
        self.command_tx.send(TimerCommand::Shutdown).await
    }

    /// Shutdown the registry (non-blocking)
    pub fn try_shutdown(&self) -> Result<(), mpsc::error::TrySendError<TimerCommand>> {
        self.command_tx.try_send(TimerCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryTimerStore, StoreError};
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<TimerUpdate>>,
        alerts: Mutex<Vec<SectionId>>,
        device: Mutex<Vec<bool>>,
        indicators: Mutex<Vec<Vec<(SectionId, u64)>>>,
    }

    impl RecordingSink {
        fn updates_for(&self, section: SectionId) -> Vec<TimerUpdate> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .filter(|u| u.section == section)
                .cloned()
                .collect()
        }

        fn last_update_for(&self, section: SectionId) -> Option<TimerUpdate> {
            self.updates_for(section).last().cloned()
        }

        fn finished_count(&self, section: SectionId) -> usize {
            self.updates_for(section).iter().filter(|u| u.finished).count()
        }

        fn alerts(&self) -> Vec<SectionId> {
            self.alerts.lock().unwrap().clone()
        }

        fn device_active(&self) -> Option<bool> {
            self.device.lock().unwrap().last().copied()
        }

        fn last_indicator(&self) -> Option<Vec<(SectionId, u64)>> {
            self.indicators.lock().unwrap().last().cloned()
        }
    }

    impl NotificationSink for RecordingSink {
        fn emit_update(&self, update: TimerUpdate) {
            self.updates.lock().unwrap().push(update);
        }

        fn refresh_ongoing_indicator(&self, running: &[(SectionId, u64)]) {
            self.indicators.lock().unwrap().push(running.to_vec());
        }

        fn show_finished_alert(&self, section: SectionId) {
            self.alerts.lock().unwrap().push(section);
        }

        fn set_alarm_device_active(&self, active: bool) {
            self.device.lock().unwrap().push(active);
        }
    }

    /// Store whose writes always fail; reads behave as if empty.
    struct FailingStore;

    #[async_trait]
    impl TimerStore for FailingStore {
        async fn put(&self, _: SectionId, _: SectionRecord) -> Result<(), StoreError> {
            Err(StoreError::Io(io::Error::other("disk full")))
        }

        async fn remove(&self, _: SectionId) -> Result<(), StoreError> {
            Err(StoreError::Io(io::Error::other("disk full")))
        }

        async fn get(&self, _: SectionId) -> Result<Option<SectionRecord>, StoreError> {
            Ok(None)
        }

        async fn active_sections(&self) -> Result<Vec<SectionId>, StoreError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        handle: RegistryHandle,
        sink: Arc<RecordingSink>,
        store: Arc<MemoryTimerStore>,
        clock: ManualClock,
    }

    fn test_config(sections: &[u32]) -> RegistryConfig {
        RegistryConfig {
            sections: sections.iter().copied().map(SectionId).collect(),
            tick_interval: Duration::from_millis(10),
            command_buffer_size: 16,
            tick_buffer_size: 16,
        }
    }

    fn spawn_registry(sections: &[u32], store: Arc<MemoryTimerStore>, clock: ManualClock) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (registry, handle) = TimerRegistry::new(
            test_config(sections),
            store.clone(),
            sink.clone(),
            Arc::new(clock.clone()),
            CancellationToken::new(),
        );
        tokio::spawn(registry.run());
        Harness {
            handle,
            sink,
            store,
            clock,
        }
    }

    fn fresh(sections: &[u32]) -> Harness {
        spawn_registry(sections, Arc::new(MemoryTimerStore::new()), ManualClock::new(0))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn countdown_runs_to_zero_and_finishes_once() {
        let h = fresh(&[1, 2]);
        h.handle.start(SectionId(1), 5_000).await.unwrap();
        wait_until(|| h.sink.last_update_for(SectionId(1)).is_some()).await;
        assert_eq!(h.store.get(SectionId(1)).await.unwrap().map(|r| r.running), Some(true));

        h.clock.advance(6_000);
        wait_until(|| h.sink.finished_count(SectionId(1)) == 1).await;

        let last = h.sink.last_update_for(SectionId(1)).unwrap();
        assert_eq!(last.remaining_ms, 0);
        assert!(!last.is_running);
        assert!(last.is_alarm_playing);
        assert!(last.finished);
        assert_eq!(h.sink.alerts(), vec![SectionId(1)]);
        assert_eq!(h.sink.device_active(), Some(true));
        assert_eq!(h.store.get(SectionId(1)).await.unwrap(), None);

        // The loop is gone; the finished update stays a one-shot.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.sink.finished_count(SectionId(1)), 1);
    }

    #[tokio::test]
    async fn start_with_zero_remaining_is_rejected() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 0).await.unwrap();
        h.handle.request_info(SectionId(1)).await.unwrap();
        wait_until(|| !h.sink.updates_for(SectionId(1)).is_empty()).await;

        let updates = h.sink.updates_for(SectionId(1));
        assert_eq!(updates.len(), 1); // Only the info snapshot.
        assert!(!updates[0].is_running);
        assert_eq!(h.store.get(SectionId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn non_positive_time_credit_is_rejected() {
        let h = fresh(&[1]);
        h.handle.add_time(SectionId(1), 0).await.unwrap();
        h.handle.add_time(SectionId(1), -5_000).await.unwrap();
        h.handle.request_info(SectionId(1)).await.unwrap();
        wait_until(|| !h.sink.updates_for(SectionId(1)).is_empty()).await;

        let updates = h.sink.updates_for(SectionId(1));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].remaining_ms, 0);
    }

    #[tokio::test]
    async fn pause_when_not_running_is_a_silent_noop() {
        let h = fresh(&[1]);
        h.handle.add_time(SectionId(1), 1_000).await.unwrap();
        wait_until(|| h.sink.updates_for(SectionId(1)).len() == 1).await;

        h.handle.pause(SectionId(1)).await.unwrap();
        h.handle.pause(SectionId(1)).await.unwrap();
        h.handle.request_info(SectionId(1)).await.unwrap();
        wait_until(|| h.sink.updates_for(SectionId(1)).len() >= 2).await;

        // Only the credit and the info snapshot emitted anything.
        let updates = h.sink.updates_for(SectionId(1));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].remaining_ms, 1_000);
        assert!(!updates[1].is_running);
    }

    #[tokio::test]
    async fn pausing_twice_matches_pausing_once() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 5_000).await.unwrap();
        wait_until(|| h.sink.last_update_for(SectionId(1)).is_some()).await;

        h.handle.pause(SectionId(1)).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| !u.is_running)
                .unwrap_or(false)
        })
        .await;
        // Ticks already in flight when the pause landed have drained by now.
        sleep(Duration::from_millis(50)).await;
        let count = h.sink.updates_for(SectionId(1)).len();

        h.handle.pause(SectionId(1)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(h.sink.updates_for(SectionId(1)).len(), count);
        let record = h.store.get(SectionId(1)).await.unwrap().unwrap();
        assert!(!record.running);
        assert_eq!(record.remaining_ms, 5_000);
        assert_eq!(record.end_timestamp_ms, None);
    }

    #[tokio::test]
    async fn time_credit_while_running_never_appears_stopped() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 10_000).await.unwrap();
        wait_until(|| h.sink.last_update_for(SectionId(1)).is_some()).await;

        h.handle.add_time(SectionId(1), 5_000).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.remaining_ms == 15_000)
                .unwrap_or(false)
        })
        .await;

        for update in h.sink.updates_for(SectionId(1)) {
            assert!(update.is_running, "observed a stopped snapshot: {:?}", update);
        }
        let record = h.store.get(SectionId(1)).await.unwrap().unwrap();
        assert!(record.running);
        assert_eq!(record.remaining_ms, 15_000);
        assert_eq!(record.end_timestamp_ms, Some(15_000));
    }

    #[tokio::test]
    async fn alarm_device_stays_on_until_the_last_section_is_silenced() {
        let h = fresh(&[1, 2]);
        h.handle.start(SectionId(1), 1_000).await.unwrap();
        h.handle.start(SectionId(2), 1_000).await.unwrap();
        wait_until(|| {
            let running = |s| {
                h.sink
                    .last_update_for(s)
                    .map(|u| u.is_running)
                    .unwrap_or(false)
            };
            running(SectionId(1)) && running(SectionId(2))
        })
        .await;
        h.clock.advance(2_000);
        wait_until(|| {
            h.sink.finished_count(SectionId(1)) == 1 && h.sink.finished_count(SectionId(2)) == 1
        })
        .await;
        assert_eq!(h.sink.device_active(), Some(true));

        h.handle.stop_alarm(SectionId(1)).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| !u.is_alarm_playing)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(h.sink.device_active(), Some(true));

        h.handle.stop_alarm(SectionId(2)).await.unwrap();
        wait_until(|| h.sink.device_active() == Some(false)).await;
    }

    #[tokio::test]
    async fn stopping_an_alarm_twice_matches_stopping_it_once() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 500).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.is_running)
                .unwrap_or(false)
        })
        .await;
        h.clock.advance(1_000);
        wait_until(|| h.sink.finished_count(SectionId(1)) == 1).await;

        h.handle.stop_alarm(SectionId(1)).await.unwrap();
        h.handle.stop_alarm(SectionId(1)).await.unwrap();
        wait_until(|| h.sink.device_active() == Some(false)).await;

        let last = h.sink.last_update_for(SectionId(1)).unwrap();
        assert!(!last.is_alarm_playing);
    }

    #[tokio::test]
    async fn unknown_section_is_ignored() {
        let h = fresh(&[1, 2]);
        h.handle.start(SectionId(9), 1_000).await.unwrap();
        h.handle.request_info(SectionId(1)).await.unwrap();
        wait_until(|| !h.sink.updates_for(SectionId(1)).is_empty()).await;

        assert!(h.sink.updates_for(SectionId(9)).is_empty());
        assert_eq!(h.store.get(SectionId(9)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_erases_persisted_state_and_zeroes_the_section() {
        let h = fresh(&[1]);
        h.handle.add_time(SectionId(1), 5_000).await.unwrap();
        wait_until(|| h.sink.updates_for(SectionId(1)).len() == 1).await;
        assert!(h.store.get(SectionId(1)).await.unwrap().is_some());

        h.handle.reset(SectionId(1)).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.remaining_ms == 0)
                .unwrap_or(false)
        })
        .await;
        assert_eq!(h.store.get(SectionId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reset_clears_the_alarm_and_silences_the_device() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 500).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.is_running)
                .unwrap_or(false)
        })
        .await;
        h.clock.advance(1_000);
        wait_until(|| h.sink.finished_count(SectionId(1)) == 1).await;
        assert_eq!(h.sink.device_active(), Some(true));

        h.handle.reset(SectionId(1)).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| !u.is_alarm_playing && u.remaining_ms == 0 && !u.finished)
                .unwrap_or(false)
        })
        .await;

        // The device is recomputed from the section map before the reset
        // update is emitted, so it is already off here.
        assert_eq!(h.sink.device_active(), Some(false));
        let last = h.sink.last_update_for(SectionId(1)).unwrap();
        assert!(!last.is_running);
    }

    #[tokio::test]
    async fn failing_store_does_not_block_commands() {
        let sink = Arc::new(RecordingSink::default());
        let (registry, handle) = TimerRegistry::new(
            test_config(&[1]),
            Arc::new(FailingStore),
            sink.clone(),
            Arc::new(ManualClock::new(0)),
            CancellationToken::new(),
        );
        tokio::spawn(registry.run());

        handle.start(SectionId(1), 1_000).await.unwrap();
        wait_until(|| {
            sink.last_update_for(SectionId(1))
                .map(|u| u.is_running)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn recovery_finalizes_a_section_that_expired_while_down() {
        // Section 2 was started at t=0 with 65 s; the process comes back
        // exactly 65 s later.
        let store = Arc::new(MemoryTimerStore::new());
        store
            .put(
                SectionId(2),
                SectionRecord {
                    running: true,
                    remaining_ms: 65_000,
                    end_timestamp_ms: Some(65_000),
                },
            )
            .await
            .unwrap();

        let h = spawn_registry(&[1, 2, 3, 4], store, ManualClock::new(65_000));
        wait_until(|| h.sink.finished_count(SectionId(2)) == 1).await;

        let last = h.sink.last_update_for(SectionId(2)).unwrap();
        assert_eq!(last.remaining_ms, 0);
        assert!(!last.is_running);
        assert!(last.is_alarm_playing);
        assert_eq!(h.sink.alerts(), vec![SectionId(2)]);
        assert_eq!(h.store.get(SectionId(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn recovery_resumes_anchored_to_the_persisted_end_timestamp() {
        let store = Arc::new(MemoryTimerStore::new());
        store
            .put(
                SectionId(1),
                SectionRecord {
                    running: true,
                    remaining_ms: 65_000,
                    end_timestamp_ms: Some(100_000),
                },
            )
            .await
            .unwrap();

        let h = spawn_registry(&[1], store, ManualClock::new(40_000));
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.is_running && u.remaining_ms <= 60_000)
                .unwrap_or(false)
        })
        .await;

        // The end timestamp is preserved, not restarted from now.
        let record = h.store.get(SectionId(1)).await.unwrap().unwrap();
        assert_eq!(record.end_timestamp_ms, Some(100_000));

        h.clock.set(100_000);
        wait_until(|| h.sink.finished_count(SectionId(1)) == 1).await;
        assert_eq!(h.sink.alerts(), vec![SectionId(1)]);
    }

    #[tokio::test]
    async fn recovery_restores_a_paused_section() {
        let store = Arc::new(MemoryTimerStore::new());
        store
            .put(
                SectionId(3),
                SectionRecord {
                    running: false,
                    remaining_ms: 12_000,
                    end_timestamp_ms: None,
                },
            )
            .await
            .unwrap();

        let h = spawn_registry(&[1, 2, 3, 4], store, ManualClock::new(500_000));
        wait_until(|| h.sink.last_update_for(SectionId(3)).is_some()).await;

        let update = h.sink.last_update_for(SectionId(3)).unwrap();
        assert_eq!(update.remaining_ms, 12_000);
        assert!(!update.is_running);
        assert!(!update.finished);
        // Paused state stays persisted until a reset or a finish.
        assert!(h.store.get(SectionId(3)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recovery_skips_entries_it_cannot_interpret() {
        let store = Arc::new(MemoryTimerStore::new());
        // Not in the configured section set.
        store
            .put(
                SectionId(9),
                SectionRecord {
                    running: true,
                    remaining_ms: 1_000,
                    end_timestamp_ms: Some(1_000),
                },
            )
            .await
            .unwrap();
        // Running but missing its end timestamp.
        store
            .put(
                SectionId(2),
                SectionRecord {
                    running: true,
                    remaining_ms: 1_000,
                    end_timestamp_ms: None,
                },
            )
            .await
            .unwrap();
        store
            .put(
                SectionId(1),
                SectionRecord {
                    running: false,
                    remaining_ms: 5_000,
                    end_timestamp_ms: None,
                },
            )
            .await
            .unwrap();

        let h = spawn_registry(&[1, 2, 3, 4], store, ManualClock::new(0));
        wait_until(|| h.sink.last_update_for(SectionId(1)).is_some()).await;

        assert!(h.sink.updates_for(SectionId(9)).is_empty());
        assert!(h.sink.updates_for(SectionId(2)).is_empty());
        assert!(h.sink.alerts().is_empty());
        assert_eq!(
            h.sink.last_update_for(SectionId(1)).unwrap().remaining_ms,
            5_000
        );
    }

    #[tokio::test]
    async fn shutdown_silences_the_device_and_closes_the_handle() {
        let h = fresh(&[1]);
        h.handle.start(SectionId(1), 500).await.unwrap();
        wait_until(|| {
            h.sink
                .last_update_for(SectionId(1))
                .map(|u| u.is_running)
                .unwrap_or(false)
        })
        .await;
        h.clock.advance(1_000);
        wait_until(|| h.sink.device_active() == Some(true)).await;

        h.handle.shutdown().await.unwrap();
        wait_until(|| h.sink.device_active() == Some(false)).await;

        let result = h.handle.try_start(SectionId(1), 1_000);
        assert!(result.is_err(), "commands after shutdown should fail");
    }

    #[tokio::test]
    async fn running_sections_appear_in_the_ongoing_indicator() {
        let h = fresh(&[1, 2]);
        h.handle.start(SectionId(1), 5_000).await.unwrap();
        h.handle.start(SectionId(2), 9_000).await.unwrap();
        wait_until(|| {
            h.sink
                .last_indicator()
                .map(|i| i.len() == 2)
                .unwrap_or(false)
        })
        .await;

        let indicator = h.sink.last_indicator().unwrap();
        assert_eq!(indicator[0].0, SectionId(1));
        assert_eq!(indicator[1].0, SectionId(2));

        h.handle.pause(SectionId(1)).await.unwrap();
        h.handle.pause(SectionId(2)).await.unwrap();
        wait_until(|| {
            h.sink
                .last_indicator()
                .map(|i| i.is_empty())
                .unwrap_or(false)
        })
        .await;
    }
}
