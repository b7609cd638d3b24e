//! # Progress Tracking Module
//!
//! Sink di eventi per la CLI: un singolo tracker thread-safe che gestisce
//! sia l'output JSON sia la progress bar tradizionale.

use crate::json_output::JsonMessage;
use crate::pipeline::build::LogLevel;
use crate::pipeline::events::{BuildEvent, BuildEventKind, EventSink};
use crate::progress::ProgressManager;
use std::sync::Mutex;

/// Counters seen so far, for the final report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerCounters {
    pub events: usize,
    pub items_done: usize,
    pub warnings: usize,
    pub last_sequence: Option<u64>,
}

/// Event sink driving the progress bar or the JSON stream
pub struct ProgressTracker {
    json_output: bool,
    progress_manager: ProgressManager,
    counters: Mutex<TrackerCounters>,
}

impl ProgressTracker {
    pub fn new(json_output: bool) -> Self {
        let progress_manager = if json_output {
            ProgressManager::hidden()
        } else {
            ProgressManager::new(0)
        };
        Self::with_manager(json_output, progress_manager)
    }

    pub fn with_manager(json_output: bool, progress_manager: ProgressManager) -> Self {
        Self {
            json_output,
            progress_manager,
            counters: Mutex::new(TrackerCounters::default()),
        }
    }

    pub fn counters(&self) -> TrackerCounters {
        self.counters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn render(&self, event: &BuildEvent) {
        match &event.kind {
            BuildEventKind::PhaseChanged { status, stage } => {
                let label = match stage {
                    Some(stage) => format!("[{}] {}", status, stage),
                    None => format!("[{}]", status),
                };
                self.progress_manager.reset(0, &label);
            }
            BuildEventKind::AssetProgress { stage, item, done, total } => {
                if self.progress_manager.position() == 0 {
                    self.progress_manager.reset(*total as u64, &format!("[{}]", stage));
                }
                self.progress_manager.set_position(*done as u64);
                self.progress_manager.set_message(&format!("[{}] {}", stage, item));
            }
            BuildEventKind::Log { level, message, .. } => {
                if matches!(level, LogLevel::Warn | LogLevel::Error) {
                    self.progress_manager.println(&format!("[{:?}] {}", level, message));
                }
            }
            BuildEventKind::Completed { status, error, stats, .. } => {
                let summary = match error {
                    Some(error) => format!("[{}] {}", status, error),
                    None => format!("[{}] {}", status, stats.format_summary()),
                };
                self.progress_manager.finish(&summary);
            }
        }
    }
}

impl EventSink for ProgressTracker {
    fn emit(&self, event: &BuildEvent) {
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.events += 1;
            counters.last_sequence = Some(event.sequence);
            match &event.kind {
                BuildEventKind::AssetProgress { .. } => counters.items_done += 1,
                BuildEventKind::Log { level: LogLevel::Warn, .. } => counters.warnings += 1,
                _ => {}
            }
        }

        if self.json_output {
            JsonMessage::from(event).emit();
        } else {
            self.render(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::build::BuildStatus;
    use crate::pipeline::events::EventHub;
    use crate::pipeline::stage::Stage;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn test_tracker_counts_events_from_hub() {
        let tracker = Arc::new(ProgressTracker::with_manager(false, ProgressManager::hidden()));
        let hub = EventHub::new().with_sink(tracker.clone());
        let id = Uuid::new_v4();

        hub.publish(id, BuildEventKind::PhaseChanged { status: BuildStatus::Optimizing, stage: Some(Stage::Css) });
        hub.publish(id, BuildEventKind::AssetProgress { stage: Stage::Css, item: "a.css".into(), done: 1, total: 2 });
        hub.publish(id, BuildEventKind::AssetProgress { stage: Stage::Css, item: "b.css".into(), done: 2, total: 2 });
        hub.publish(id, BuildEventKind::Log { level: LogLevel::Warn, stage: Some(Stage::Css), message: "x".into() });

        let counters = tracker.counters();
        assert_eq!(counters.events, 4);
        assert_eq!(counters.items_done, 2);
        assert_eq!(counters.warnings, 1);
        assert_eq!(counters.last_sequence, Some(3));
    }
}
