//! Log and progress events streamed from a running job.
//!
//! The agent side holds an [`EventEmitter`]; the controller side holds a
//! [`JobMonitor`] that routes events into two distinct channels:
//!
//! - logs are append-only and delivered in emission order;
//! - progress is a single slot where the newest event replaces the previous.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{ChannelError, ConvergentError, Result};

use crate::error::WireError;

use super::envelope::AgentMessage;
use super::state::JobState;
use super::wire::{wire_enum, wire_record, Wire, WireReader, WireWriter};

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress information.
    Information,
    /// Something unexpected that did not stop the job.
    Warning,
    /// A failure reported by the job.
    Error,
}

wire_enum!(LogLevel {
    Debug = 0,
    Information = 1,
    Warning = 2,
    Error = 3,
});

/// One log line emitted by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
}

wire_record!(LogEvent { level, message });

/// A progress update emitted by a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Percent complete, between 0 and 100.
    pub percent_complete: Option<u8>,
    /// Current activity label.
    pub activity: Option<String>,
}

wire_record!(ProgressEvent {
    percent_complete,
    activity,
});

/// Any event a job can stream back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A log line.
    Log(LogEvent),
    /// A progress update.
    Progress(ProgressEvent),
}

impl Wire for JobEvent {
    fn encode(&self, writer: &mut WireWriter) {
        match self {
            Self::Log(event) => {
                writer.put_u8(1);
                event.encode(writer);
            }
            Self::Progress(event) => {
                writer.put_u8(2);
                event.encode(writer);
            }
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        match reader.get_u8()? {
            1 => Ok(Self::Log(LogEvent::decode(reader)?)),
            2 => Ok(Self::Progress(ProgressEvent::decode(reader)?)),
            tag => Err(WireError::InvalidTag {
                type_name: "JobEvent",
                tag,
            }),
        }
    }
}

/// Receives job events on the controller side.
pub trait LogSink: Send + Sync {
    /// Called for every log event, in order.
    fn log(&self, event: &LogEvent);

    /// Called for every progress event.
    fn progress(&self, _event: &ProgressEvent) {}
}

/// Forwards job events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn log(&self, event: &LogEvent) {
        match event.level {
            LogLevel::Debug => debug!("[agent] {}", event.message),
            LogLevel::Information => info!("[agent] {}", event.message),
            LogLevel::Warning => warn!("[agent] {}", event.message),
            LogLevel::Error => error!("[agent] {}", event.message),
        }
    }

    fn progress(&self, event: &ProgressEvent) {
        debug!(
            "[agent] progress {}% {}",
            event.percent_complete.map_or_else(|| String::from("?"), |p| p.to_string()),
            event.activity.as_deref().unwrap_or("")
        );
    }
}

/// Agent-side event emitter handed to a running job.
///
/// Events share the agent's message stream with the final outcome, so every
/// event a job emits reaches the controller before its result.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<AgentMessage>,
}

impl EventEmitter {
    /// Wraps an existing agent message stream.
    #[must_use]
    pub const fn new(sender: mpsc::UnboundedSender<AgentMessage>) -> Self {
        Self { sender }
    }

    /// Creates an emitter and the receiving end of its stream.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Creates an emitter whose events are dropped.
    #[must_use]
    pub fn discard() -> Self {
        Self::channel().0
    }

    /// Emits a raw event. Events after the controller went away are dropped.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(AgentMessage::Event(event));
    }

    /// Emits a log event.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(JobEvent::Log(LogEvent {
            level,
            message: message.into(),
        }));
    }

    /// Emits a debug log event.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    /// Emits an informational log event.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Information, message);
    }

    /// Emits a warning log event.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    /// Emits an error log event.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Emits a progress event.
    pub fn progress(&self, percent_complete: Option<u8>, activity: Option<String>) {
        self.emit(JobEvent::Progress(ProgressEvent {
            percent_complete: percent_complete.map(|p| p.min(100)),
            activity,
        }));
    }
}

/// Controller-side router for one caller's job events and job state.
pub struct JobMonitor {
    logs: mpsc::UnboundedSender<LogEvent>,
    progress: watch::Sender<Option<ProgressEvent>>,
    state: watch::Sender<JobState>,
    sink: Option<Arc<dyn LogSink>>,
}

/// The caller's view of a [`JobMonitor`].
#[derive(Debug)]
pub struct JobSubscription {
    logs: mpsc::UnboundedReceiver<LogEvent>,
    progress: watch::Receiver<Option<ProgressEvent>>,
    state: watch::Receiver<JobState>,
}

impl JobMonitor {
    /// Creates a monitor and the subscription that reads from it.
    #[must_use]
    pub fn new() -> (Self, JobSubscription) {
        let (logs_tx, logs_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(JobState::Created);

        let monitor = Self {
            logs: logs_tx,
            progress: progress_tx,
            state: state_tx,
            sink: None,
        };
        let subscription = JobSubscription {
            logs: logs_rx,
            progress: progress_rx,
            state: state_rx,
        };
        (monitor, subscription)
    }

    /// Creates a monitor that only pushes events to `tracing`.
    #[must_use]
    pub fn tracing() -> Self {
        Self::new().0.with_sink(Arc::new(TracingLogSink))
    }

    /// Adds a push-style sink, called before events reach the subscription.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Routes one event from the agent.
    pub fn deliver(&self, event: JobEvent) {
        match event {
            JobEvent::Log(log) => {
                if let Some(sink) = &self.sink {
                    sink.log(&log);
                }
                let _ = self.logs.send(log);
            }
            JobEvent::Progress(progress) => {
                if let Some(sink) = &self.sink {
                    sink.progress(&progress);
                }
                self.progress.send_replace(Some(progress));
            }
        }
    }

    /// Resets the job state for a new submission.
    pub fn begin(&self) {
        self.state.send_replace(JobState::Created);
    }

    /// Returns the current job state.
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Advances the job state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed.
    pub fn advance(&self, next: JobState) -> Result<()> {
        let current = self.state();
        if !current.can_advance_to(next) {
            return Err(ConvergentError::Channel(ChannelError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            }));
        }
        debug!("Job state: {current} -> {next}");
        self.state.send_replace(next);
        Ok(())
    }
}

impl std::fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitor")
            .field("state", &self.state())
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl JobSubscription {
    /// Waits for the next log event; `None` once the monitor is gone.
    pub async fn next_log(&mut self) -> Option<LogEvent> {
        self.logs.recv().await
    }

    /// Returns the next log event if one is already queued.
    pub fn try_next_log(&mut self) -> Option<LogEvent> {
        self.logs.try_recv().ok()
    }

    /// Drains every queued log event.
    pub fn drain_logs(&mut self) -> Vec<LogEvent> {
        std::iter::from_fn(|| self.try_next_log()).collect()
    }

    /// Returns the most recent progress event.
    #[must_use]
    pub fn latest_progress(&self) -> Option<ProgressEvent> {
        self.progress.borrow().clone()
    }

    /// Returns the current job state.
    #[must_use]
    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    impl LogSink for RecordingSink {
        fn log(&self, event: &LogEvent) {
            if let Ok(mut lines) = self.lines.lock() {
                lines.push(event.message.clone());
            }
        }
    }

    #[test]
    fn test_logs_are_ordered_and_progress_is_latest_only() {
        let (monitor, mut subscription) = JobMonitor::new();

        monitor.deliver(JobEvent::Log(LogEvent {
            level: LogLevel::Information,
            message: String::from("first"),
        }));
        monitor.deliver(JobEvent::Progress(ProgressEvent {
            percent_complete: Some(10),
            activity: Some(String::from("copy")),
        }));
        monitor.deliver(JobEvent::Log(LogEvent {
            level: LogLevel::Warning,
            message: String::from("second"),
        }));
        monitor.deliver(JobEvent::Progress(ProgressEvent {
            percent_complete: Some(90),
            activity: None,
        }));

        let messages: Vec<String> = subscription
            .drain_logs()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["first", "second"]);

        let progress = subscription.latest_progress().expect("progress");
        assert_eq!(progress.percent_complete, Some(90));
        assert_eq!(progress.activity, None);
    }

    #[test]
    fn test_sink_sees_events() {
        let sink = Arc::new(RecordingSink::default());
        let (monitor, _subscription) = JobMonitor::new();
        let monitor = monitor.with_sink(sink.clone());

        monitor.deliver(JobEvent::Log(LogEvent {
            level: LogLevel::Debug,
            message: String::from("hello"),
        }));

        let lines = sink.lines.lock().expect("lock");
        assert_eq!(lines.as_slice(), ["hello"]);
    }

    #[test]
    fn test_state_transitions_are_checked() {
        let (monitor, subscription) = JobMonitor::new();
        assert_eq!(subscription.state(), JobState::Created);

        assert!(monitor.advance(JobState::Running).is_err());
        monitor.advance(JobState::Submitted).expect("submit");
        monitor.advance(JobState::Running).expect("run");
        monitor.advance(JobState::Completed).expect("complete");
        assert!(monitor.advance(JobState::Failed).is_err());
        assert_eq!(subscription.state(), JobState::Completed);

        monitor.begin();
        assert_eq!(monitor.state(), JobState::Created);
    }

    #[test]
    fn test_emitter_clamps_percent() {
        let (emitter, mut receiver) = EventEmitter::channel();
        emitter.progress(Some(250), None);

        match receiver.try_recv().expect("event") {
            AgentMessage::Event(JobEvent::Progress(p)) => assert_eq!(p.percent_complete, Some(100)),
            other => panic!("expected progress, got {other:?}"),
        }
    }
}
