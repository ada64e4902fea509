//! Script hosts run a [`ScriptJob`] body and stream its output.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::credential::Credential;
use crate::error::{ChannelError, ConvergentError, Result, ScriptError};
use crate::job::JobContext;

use super::job::{ScriptJob, ScriptResult};
use super::output::{classify, OutputCollector, ScriptStream};

/// Environment variable carrying the credential username.
pub const CREDENTIAL_USERNAME_VAR: &str = "CONVERGENT_CREDENTIAL_USERNAME";

/// Runs script bodies on the agent.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Runs `script` to completion or cancellation, forwarding classified
    /// output through the context's event stream in emission order.
    ///
    /// A nonzero exit code is returned in the result, not as an error.
    async fn run(&self, script: &ScriptJob, ctx: &JobContext) -> Result<ScriptResult>;
}

/// Runs scripts through an interpreter process.
///
/// Variables become environment variables of the child. A credential's
/// username is passed in [`CREDENTIAL_USERNAME_VAR`] and its secret is
/// written to the child's standard input, which is then closed.
#[derive(Debug, Clone)]
pub struct ProcessScriptHost {
    program: String,
    args: Vec<String>,
}

impl Default for ProcessScriptHost {
    fn default() -> Self {
        Self::new("sh", ["-c"])
    }
}

impl ProcessScriptHost {
    /// Creates a host that runs `program args... <body>`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    fn spawn(&self, script: &ScriptJob) -> Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&script.body)
            .envs(script.variables.iter().map(|v| (&v.name, &v.value)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credential) = &script.credential {
            command
                .env(CREDENTIAL_USERNAME_VAR, &credential.username)
                .stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        command.spawn().map_err(|e| {
            ScriptError::LaunchFailed {
                program: self.program.clone(),
                message: e.to_string(),
            }
            .into()
        })
    }
}

fn spawn_reader<R>(reader: R, stream: ScriptStream, lines: mpsc::UnboundedSender<(ScriptStream, String)>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if lines.send((stream, line)).is_err() {
                break;
            }
        }
    });
}

async fn stop(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill script: {e}");
    }
}

async fn kill(child: &mut Child) -> ConvergentError {
    stop(child).await;
    ConvergentError::Channel(ChannelError::Cancelled)
}

/// Writes the secret to the child's standard input and closes it.
///
/// The script is killed if the write fails or cancellation fires first.
async fn hand_credential(
    credential: &Credential,
    mut stdin: ChildStdin,
    child: &mut Child,
    ctx: &JobContext,
) -> Result<()> {
    let secret = credential.secret().expose(|bytes| Zeroizing::new(bytes.to_vec()));
    let written = tokio::select! {
        written = async {
            stdin.write_all(&secret).await?;
            stdin.shutdown().await
        } => written,
        () = ctx.cancel().cancelled() => return Err(kill(child).await),
    };

    if let Err(e) = written {
        stop(child).await;
        return Err(ScriptError::CredentialHandoff {
            message: e.to_string(),
        }
        .into());
    }
    Ok(())
}

#[async_trait]
impl ScriptHost for ProcessScriptHost {
    async fn run(&self, script: &ScriptJob, ctx: &JobContext) -> Result<ScriptResult> {
        let mut child = self.spawn(script)?;
        debug!("Started script interpreter '{}'", self.program);

        if let (Some(credential), Some(stdin)) = (&script.credential, child.stdin.take()) {
            hand_credential(credential, stdin, &mut child, ctx).await?;
        }

        let (sender, mut lines) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, ScriptStream::Stdout, sender.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, ScriptStream::Stderr, sender);
        }

        let mut collector =
            OutputCollector::new(script.include_debug, script.include_verbose, script.collect_output);
        loop {
            tokio::select! {
                line = lines.recv() => match line {
                    Some((stream, line)) => collector.accept(classify(&line, stream), ctx.events()),
                    None => break,
                },
                () = ctx.cancel().cancelled() => return Err(kill(&mut child).await),
            }
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status?),
            () = ctx.cancel().cancelled() => None,
        };
        let Some(status) = waited else {
            return Err(kill(&mut child).await);
        };
        let exit_code = status.code().unwrap_or(-1);
        debug!("Script finished with exit code {exit_code}");

        Ok(ScriptResult {
            skipped: false,
            exit_code,
            outputs: collector.finish(),
        })
    }
}
