//! Framed byte-stream transport.
//!
//! Every frame is a one-byte tag, a little-endian `u32` payload length and
//! the payload. A connection carries exactly one job: the controller sends a
//! `Request` frame and optionally a `Cancel` frame; the agent answers with
//! `Started`, any number of `Event` frames and one `Finished` frame.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::{ChannelError, ConvergentError, Result, WireError};

use super::agent::Agent;
use super::cancel::CancellationSignal;
use super::channel::{pump_messages, AgentChannel, DEFAULT_CANCEL_GRACE};
use super::envelope::{AgentMessage, JobOutcome, JobRequest};
use super::events::{JobEvent, JobMonitor};
use super::wire::{from_bytes, to_bytes};

/// Largest payload accepted in one frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// Controller to agent: the encoded [`JobRequest`].
    Request = 1,
    /// Controller to agent: stop the running job.
    Cancel = 2,
    /// Agent to controller: execution began.
    Started = 10,
    /// Agent to controller: an encoded [`JobEvent`].
    Event = 11,
    /// Agent to controller: the encoded [`JobOutcome`].
    Finished = 12,
}

impl TryFrom<u8> for FrameTag {
    type Error = WireError;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Request),
            2 => Ok(Self::Cancel),
            10 => Ok(Self::Started),
            11 => Ok(Self::Event),
            12 => Ok(Self::Finished),
            tag => Err(WireError::InvalidTag {
                type_name: "FrameTag",
                tag,
            }),
        }
    }
}

fn stream_failure(context: &str, error: &std::io::Error) -> ConvergentError {
    ConvergentError::Channel(ChannelError::failure(format!("{context}: {error}")))
}

/// Writes one frame and flushes it.
///
/// # Errors
///
/// Returns a channel failure if the payload is too large or the write fails.
pub async fn write_frame<W>(writer: &mut W, tag: FrameTag, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow {
            length: payload.len(),
        }
        .into());
    }
    let len = u32::try_from(payload.len()).map_err(|_| WireError::LengthOverflow {
        length: payload.len(),
    })?;

    let mut header = [0u8; 5];
    header[0] = tag as u8;
    header[1..].copy_from_slice(&len.to_le_bytes());

    writer
        .write_all(&header)
        .await
        .map_err(|e| stream_failure("writing frame header", &e))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| stream_failure("writing frame payload", &e))?;
    writer
        .flush()
        .await
        .map_err(|e| stream_failure("flushing frame", &e))
}

/// Reads one frame; `None` when the peer closed the stream between frames.
///
/// # Errors
///
/// Returns an error on a truncated frame, an unknown tag or an oversized
/// payload.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<(FrameTag, Zeroizing<Vec<u8>>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(stream_failure("reading frame", &e)),
    }
    reader
        .read_exact(&mut header[1..])
        .await
        .map_err(|e| stream_failure("reading frame header", &e))?;

    let tag = FrameTag::try_from(header[0])?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    let len = usize::try_from(len).map_err(|_| WireError::LengthOverflow {
        length: usize::MAX,
    })?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::LengthOverflow { length: len }.into());
    }

    let mut payload = Zeroizing::new(vec![0u8; len]);
    reader
        .read_exact(payload.as_mut_slice())
        .await
        .map_err(|e| stream_failure("reading frame payload", &e))?;
    Ok(Some((tag, payload)))
}

async fn write_message<W>(writer: &mut W, message: &AgentMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match message {
        AgentMessage::Started => write_frame(writer, FrameTag::Started, &[]).await,
        AgentMessage::Event(event) => {
            write_frame(writer, FrameTag::Event, &to_bytes(event)?).await
        }
        AgentMessage::Finished(outcome) => {
            write_frame(writer, FrameTag::Finished, &to_bytes(outcome)?).await
        }
    }
}

fn decode_message(tag: FrameTag, payload: &[u8]) -> Result<AgentMessage> {
    match tag {
        FrameTag::Started => Ok(AgentMessage::Started),
        FrameTag::Event => Ok(AgentMessage::Event(from_bytes::<JobEvent>(payload)?)),
        FrameTag::Finished => Ok(AgentMessage::Finished(from_bytes::<JobOutcome>(payload)?)),
        FrameTag::Request | FrameTag::Cancel => Err(ConvergentError::Channel(
            ChannelError::failure(format!("agent sent a controller frame ({tag:?})")),
        )),
    }
}

/// Opens one byte stream to an agent.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Stream>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Serves every connection from an in-process agent over an in-memory pipe.
///
/// Runs the full framed protocol without sockets.
#[derive(Debug, Clone)]
pub struct DuplexConnector {
    agent: Arc<Agent>,
}

impl DuplexConnector {
    /// Creates a connector backed by `agent`.
    #[must_use]
    pub const fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    type Stream = tokio::io::DuplexStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let agent = Arc::clone(&self.agent);
        tokio::spawn(async move {
            if let Err(e) = serve_connection(agent, server).await {
                debug!("In-process connection ended with error: {e}");
            }
        });
        Ok(client)
    }

    fn describe(&self) -> String {
        String::from("in-process")
    }
}

/// Connects to an agent listening on TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector for `host:port`.
    #[must_use]
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                ChannelError::unavailable(format!(
                    "timed out after {:?} connecting to {}",
                    self.connect_timeout, self.address
                ))
            })?
            .map_err(|e| {
                ChannelError::unavailable(format!("cannot connect to {}: {}", self.address, e))
            })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", self.address, e);
        }
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Runs jobs on a remote agent, one connection per job.
#[derive(Debug, Clone)]
pub struct StreamChannel<C: Connector> {
    connector: C,
    cancel_grace: Duration,
}

impl<C: Connector> StreamChannel<C> {
    /// Creates a channel over the given connector.
    #[must_use]
    pub const fn new(connector: C) -> Self {
        Self {
            connector,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Sets how long a cancelled job may take to report back.
    #[must_use]
    pub const fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

#[async_trait]
impl<C: Connector> AgentChannel for StreamChannel<C> {
    async fn transmit(
        &self,
        request: JobRequest,
        cancel: &CancellationSignal,
        monitor: &JobMonitor,
    ) -> Result<JobOutcome> {
        let stream = self.connector.connect().await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        debug!("Sending '{}' to {}", request.kind, self.connector.describe());
        let payload = Zeroizing::new(to_bytes(&request)?);
        drop(request);
        write_frame(&mut writer, FrameTag::Request, &payload)
            .await
            .map_err(|e| ChannelError::unavailable(format!("sending request failed: {e}")))?;
        drop(payload);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(Some((tag, payload))) => match decode_message(tag, &payload) {
                        Ok(message) => {
                            let finished = matches!(message, AgentMessage::Finished(_));
                            if tx.send(message).is_err() || finished {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Discarding malformed agent frame: {e}");
                            break;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Agent stream failed: {e}");
                        break;
                    }
                }
            }
        });

        let forward = cancel.clone();
        let cancel_task = tokio::spawn(async move {
            forward.cancelled().await;
            if let Err(e) = write_frame(&mut writer, FrameTag::Cancel, &[]).await {
                debug!("Could not forward cancellation: {e}");
            }
        });

        let result = pump_messages(&mut rx, cancel, monitor, self.cancel_grace).await;
        cancel_task.abort();
        reader_task.abort();
        result
    }

    fn describe(&self) -> String {
        self.connector.describe()
    }
}

/// Serves exactly one job over an accepted connection.
///
/// # Errors
///
/// Returns an error if the stream breaks or the first frame is not a
/// request.
pub async fn serve_connection<S>(agent: Arc<Agent>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let Some((tag, payload)) = read_frame(&mut reader).await? else {
        debug!("Controller disconnected before sending a request");
        return Ok(());
    };
    if tag != FrameTag::Request {
        return Err(ConvergentError::Channel(ChannelError::failure(format!(
            "expected a request frame, got {tag:?}"
        ))));
    }

    let request: JobRequest = match from_bytes(&payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting undecodable request: {e}");
            let failure = ConvergentError::from(e).to_remote();
            let finished = AgentMessage::Finished(JobOutcome::Failed(failure));
            return write_message(&mut writer, &finished).await;
        }
    };
    drop(payload);

    let cancel = CancellationSignal::new();
    let watcher_cancel = cancel.clone();
    let watcher = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some((FrameTag::Cancel, _))) => {
                    info!("Controller requested cancellation");
                    watcher_cancel.cancel();
                }
                Ok(Some((tag, _))) => warn!("Ignoring unexpected {tag:?} frame"),
                Ok(None) | Err(_) => {
                    watcher_cancel.cancel();
                    break;
                }
            }
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let job_cancel = cancel.clone();
    let job = tokio::spawn(async move { agent.execute(request, job_cancel, tx).await });

    let mut finished = false;
    while let Some(message) = rx.recv().await {
        finished = matches!(message, AgentMessage::Finished(_));
        if let Err(e) = write_message(&mut writer, &message).await {
            cancel.cancel();
            watcher.abort();
            return Err(e);
        }
        if finished {
            break;
        }
    }
    watcher.abort();

    if !finished {
        let failure = ConvergentError::internal("job terminated without reporting an outcome");
        let message = AgentMessage::Finished(JobOutcome::Failed(failure.to_remote()));
        write_message(&mut writer, &message).await?;
    }
    if let Err(e) = job.await {
        warn!("Job task ended abnormally: {e}");
    }

    writer
        .shutdown()
        .await
        .map_err(|e| stream_failure("closing connection", &e))
}

/// Accepts connections until `shutdown` fires, serving each on its own task.
///
/// # Errors
///
/// Returns an error if the listener address cannot be read.
pub async fn serve(
    agent: Arc<Agent>,
    listener: TcpListener,
    shutdown: CancellationSignal,
) -> Result<()> {
    info!("Agent listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Agent shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {peer}");
                    let agent = Arc::clone(&agent);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(agent, stream).await {
                            warn!("Connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) => warn!("Accept failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::job::context::{AgentResources, Job, JobContext};
    use crate::job::state::JobState;
    use crate::job::wire::wire_record;
    use crate::script::ProcessScriptHost;

    #[derive(Debug, Clone)]
    struct Countdown {
        steps: u32,
    }

    wire_record!(Countdown { steps });

    #[async_trait]
    impl Job for Countdown {
        type Output = u32;

        fn kind() -> String {
            String::from("test.countdown")
        }

        async fn execute(&self, ctx: &JobContext) -> Result<u32> {
            for step in 0..self.steps {
                ctx.checkpoint()?;
                ctx.events().info(format!("step {step}"));
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(self.steps)
        }
    }

    fn channel() -> StreamChannel<DuplexConnector> {
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()));
        let agent = Arc::new(Agent::new(resources).register::<Countdown>());
        StreamChannel::new(DuplexConnector::new(agent))
    }

    fn request(steps: u32) -> JobRequest {
        JobRequest::new(
            Countdown::kind(),
            to_bytes(&Countdown { steps }).expect("encode"),
        )
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameTag::Event, &[7, 8]).await.expect("write");
        assert_eq!(buf, vec![11, 2, 0, 0, 0, 7, 8]);

        let mut cursor = buf.as_slice();
        let (tag, payload) = read_frame(&mut cursor).await.expect("read").expect("frame");
        assert_eq!(tag, FrameTag::Event);
        assert_eq!(payload.as_slice(), &[7, 8]);
        assert!(read_frame(&mut cursor).await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let bytes = [12u8, 0xff, 0xff, 0xff, 0xff];
        let mut cursor = &bytes[..];
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_channel_delivers_events_in_order() {
        let (monitor, mut subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");

        let outcome = channel()
            .transmit(request(3), &CancellationSignal::new(), &monitor)
            .await
            .expect("transmit");

        assert_eq!(outcome, JobOutcome::Completed(to_bytes(&3u32).expect("encode")));
        let messages: Vec<String> = subscription
            .drain_logs()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["step 0", "step 1", "step 2"]);
    }

    #[tokio::test]
    async fn test_stream_channel_forwards_cancel() {
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = channel()
            .transmit(request(100_000), &cancel, &monitor)
            .await
            .expect("transmit");

        assert_eq!(outcome, JobOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_over_stream() {
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");

        let outcome = channel()
            .transmit(JobRequest::new("missing", vec![]), &CancellationSignal::new(), &monitor)
            .await
            .expect("transmit");

        match outcome {
            JobOutcome::Failed(failure) => assert_eq!(failure.code, ErrorCode::Failed),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let channel = StreamChannel::new(TcpConnector::new(address, Duration::from_secs(2)));
        let (monitor, _subscription) = JobMonitor::new();
        let err = channel
            .transmit(request(1), &CancellationSignal::new(), &monitor)
            .await
            .expect_err("connect should fail");

        assert!(err.is_transport());
        assert_eq!(err.code(), ErrorCode::AdapterUnavailable);
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("addr").to_string();
        let resources = AgentResources::new(Arc::new(ProcessScriptHost::default()));
        let agent = Arc::new(Agent::new(resources).register::<Countdown>());
        let shutdown = CancellationSignal::new();
        let server = tokio::spawn(serve(agent, listener, shutdown.clone()));

        let channel = StreamChannel::new(TcpConnector::new(address, Duration::from_secs(2)));
        let (monitor, _subscription) = JobMonitor::new();
        monitor.advance(JobState::Submitted).expect("submit");
        let outcome = channel
            .transmit(request(1), &CancellationSignal::new(), &monitor)
            .await
            .expect("transmit");
        assert_eq!(outcome, JobOutcome::Completed(to_bytes(&1u32).expect("encode")));

        shutdown.cancel();
        server.await.expect("join").expect("serve");
    }
}
