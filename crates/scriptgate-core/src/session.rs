//! Line-delimited request/response loop.
//!
//! `Starting → Ready → Terminated`. The ready record is written before any
//! request is read; afterwards each non-blank input line yields exactly one
//! output line, flushed immediately, in order.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use scriptgate_config::ConfigError;

use crate::dispatcher::{Dispatcher, Flow};
use crate::error::GatewayError;
use crate::protocol::{ReadyRecord, Request, Response};

/// Errors that end a session abnormally.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("script engine failed to start: {0}")]
    Engine(String),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ready record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session already terminated")]
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Terminated,
}

/// Why a session ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    EndOfStream,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Requests answered, including failures.
    pub handled: u64,
    pub reason: EndReason,
}

/// One client session over a reader/writer pair.
pub struct Session {
    dispatcher: Dispatcher,
    state: SessionState,
}

impl Session {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            state: SessionState::Starting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Serve requests from `reader` until end of stream or `shutdown`.
    pub async fn run<R, W>(&mut self, mut reader: R, writer: &mut W) -> Result<SessionSummary, SessionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }

        write_line(writer, &serde_json::to_string(&ReadyRecord::new())?).await?;
        self.state = SessionState::Ready;
        info!("session ready");

        let mut handled = 0;
        let mut buf = Vec::new();
        let reason = loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break EndReason::EndOfStream;
            }

            let (response, flow) = match decode(&buf) {
                Ok(None) => continue,
                Ok(Some(request)) => self.dispatcher.dispatch(request).await,
                Err(err) => {
                    debug!(error = %err, "undecodable request line");
                    (Response::from(err), Flow::Continue)
                }
            };

            write_line(writer, &response.to_line()).await?;
            handled += 1;

            if flow == Flow::Stop {
                break EndReason::Shutdown;
            }
        };

        self.state = SessionState::Terminated;
        info!(handled, ?reason, "session terminated");
        Ok(SessionSummary { handled, reason })
    }
}

/// Run one session over the process's standard input and output.
///
/// On unix, records go to a private duplicate of stdout and fd 1 is pointed
/// at stderr, so child processes started by scripts cannot write into the
/// protocol stream.
pub async fn serve_stdio(dispatcher: Dispatcher) -> Result<SessionSummary, SessionError> {
    let mut session = Session::new(dispatcher);
    let reader = BufReader::new(tokio::io::stdin());

    #[cfg(unix)]
    let mut writer = tokio::fs::File::from_std(reserve_stdout()?);
    #[cfg(not(unix))]
    let mut writer = tokio::io::stdout();

    session.run(reader, &mut writer).await
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn reserve_stdout() -> std::io::Result<std::fs::File> {
    use std::os::fd::{FromRawFd, OwnedFd};

    // SAFETY: dup has no memory arguments; a non-negative result is a new
    // descriptor owned by nobody else.
    let fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by dup and is not shared.
    let protocol = unsafe { OwnedFd::from_raw_fd(fd) };

    // SAFETY: dup2 only rewires the descriptor table.
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    debug!("protocol stream moved off fd 1");
    Ok(std::fs::File::from(protocol))
}

/// Decode one raw line. Blank lines yield `None`.
fn decode(raw: &[u8]) -> Result<Option<Request>, GatewayError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| GatewayError::Decode(format!("request is not valid UTF-8: {e}")))?
        .trim();
    if line.is_empty() {
        return Ok(None);
    }
    Request::decode(line).map(Some)
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
