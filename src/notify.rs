use tokio::sync::mpsc;

use crate::format::format_hms;
use crate::section::SectionId;

/// One state-change emission from the registry to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerUpdate {
    pub section: SectionId,
    pub remaining_ms: u64,
    pub is_running: bool,
    pub is_alarm_playing: bool,
    /// Set on the single emission produced when the countdown reaches zero.
    pub finished: bool,
}

/// Outbound side effects of the registry.
///
/// Every call is fire-and-forget: implementations must absorb their own
/// failures, because the registry's state transition has already happened
/// by the time the sink is invoked and is never rolled back.
pub trait NotificationSink: Send + Sync {
    /// Push a state update for one section.
    fn emit_update(&self, update: TimerUpdate);

    /// Refresh the shared "timers running" indicator with every running
    /// section and its remaining time. An empty slice clears the indicator.
    fn refresh_ongoing_indicator(&self, running: &[(SectionId, u64)]);

    /// Raise the one-shot "time's up" alert for a section.
    fn show_finished_alert(&self, section: SectionId);

    /// Start or stop the single shared audible alarm device.
    fn set_alarm_device_active(&self, active: bool);
}

/// Sink that forwards updates over a bounded channel and renders the
/// device-facing calls to the log.
///
/// A presentation layer holds the receiving side; updates for one section
/// arrive in emission order. When the channel is full the update is
/// dropped with a warning rather than blocking the registry.
pub struct ChannelSink {
    updates: mpsc::Sender<TimerUpdate>,
}

impl ChannelSink {
    /// Create a sink and the receiver a presentation layer consumes.
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<TimerUpdate>) {
        let (updates, rx) = mpsc::channel(buffer_size);
        (Self { updates }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn emit_update(&self, update: TimerUpdate) {
        if let Err(e) = self.updates.try_send(update) {
            match e {
                mpsc::error::TrySendError::Full(update) => {
                    log::warn!(
                        "Update channel full, dropping update for section {}",
                        update.section
                    );
                }
                mpsc::error::TrySendError::Closed(update) => {
                    log::warn!(
                        "Update channel closed, cannot deliver update for section {}",
                        update.section
                    );
                }
            }
        }
    }

    fn refresh_ongoing_indicator(&self, running: &[(SectionId, u64)]) {
        if running.is_empty() {
            log::debug!("Ongoing indicator cleared");
            return;
        }
        let text = running
            .iter()
            .map(|(section, remaining_ms)| format!("Sec {}: {}", section, format_hms(*remaining_ms)))
            .collect::<Vec<_>>()
            .join(" | ");
        log::debug!("Ongoing indicator: {}", text);
    }

    fn show_finished_alert(&self, section: SectionId) {
        log::info!("Section {}: time is up", section);
    }

    fn set_alarm_device_active(&self, active: bool) {
        log::info!(
            "Alarm device {}",
            if active { "activated" } else { "silenced" }
        );
    }
}
