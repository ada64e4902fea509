//! Job execution protocol.
//!
//! A controller builds a [`Job`], submits it through a [`JobClient`] over an
//! [`AgentChannel`], and an [`Agent`] executes it against its resource
//! adapters. Logs and progress stream back while the job runs.

mod agent;
mod cancel;
mod channel;
mod client;
mod context;
mod envelope;
mod events;
mod state;
mod stream;
pub mod wire;

pub use agent::Agent;
pub use cancel::{poll_until, CancellationSignal, PollPolicy};
pub use channel::{AgentChannel, LocalChannel, DEFAULT_CANCEL_GRACE};
pub use client::JobClient;
pub use context::{AgentResources, Job, JobContext};
pub use envelope::{AgentMessage, JobOutcome, JobRequest, PROTOCOL_VERSION};
pub use events::{
    EventEmitter, JobEvent, JobMonitor, JobSubscription, LogEvent, LogLevel, LogSink,
    ProgressEvent, TracingLogSink,
};
pub use state::JobState;
pub use stream::{
    read_frame, serve, serve_connection, write_frame, Connector, DuplexConnector, FrameTag,
    StreamChannel, TcpConnector, MAX_FRAME_LEN,
};
