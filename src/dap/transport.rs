//! DAP transport abstraction layer.
//! Supports child-process stdio (spawned adapters) and TCP (remote adapters)
//! behind one `Content-Length` framing codec.

use crate::dap::protocol::Message;
use crate::debugger::error::Error;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// Grace period between a polite termination signal and a forced kill of the
/// adapter process.
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Receiving half of a DAP byte carrier.
#[async_trait]
pub trait TransportReader: Send {
    /// Read a single DAP message (with `Content-Length` framing).
    async fn recv(&mut self) -> Result<Message, Error>;
}

/// Sending half of a DAP byte carrier.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write a single DAP message (with `Content-Length` framing).
    async fn send(&mut self, message: &Message) -> Result<(), Error>;
}

/// Framing decoder over any byte stream.
pub struct FramedReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        FramedReader {
            reader: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportReader for FramedReader<R> {
    async fn recv(&mut self) -> Result<Message, Error> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line).await?;
            if read_n == 0 {
                if content_length.is_some() {
                    return Err(Error::Protocol("truncated header block".into()));
                }
                return Err(Error::TransportClosed);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if content_length.is_some() {
                    break;
                }
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(v) = lower.strip_prefix("content-length:") {
                let len = v
                    .trim()
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad Content-Length header: {line}")))?;
                content_length = Some(len);
            }
        }

        let len = content_length.ok_or_else(|| Error::Protocol("missing Content-Length header".into()))?;
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .await
            .map_err(|_| Error::Protocol("truncated message body".into()))?;
        let msg: Message =
            serde_json::from_slice(&buf).map_err(|e| Error::Protocol(format!("malformed message: {e}")))?;
        Ok(msg)
    }
}

/// Framing encoder over any byte stream.
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        FramedWriter { writer: inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWriter for FramedWriter<W> {
    async fn send(&mut self, message: &Message) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Owner of a spawned adapter process handle. Terminating the session must
/// reap the child; `shutdown` signals first and force-kills after
/// [`KILL_GRACE_PERIOD`].
pub struct ChildGuard {
    child: Child,
}

impl ChildGuard {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn shutdown(&mut self) {
        if self.child.try_wait().ok().flatten().is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).is_ok() {
                let waited = tokio::time::timeout(KILL_GRACE_PERIOD, self.child.wait()).await;
                if let Ok(Ok(status)) = waited {
                    log::debug!("adapter process exited with {status}");
                    return;
                }
                log::warn!("adapter process ignored SIGTERM, killing");
            }
        }

        if let Err(e) = self.child.kill().await {
            log::warn!("kill adapter process: {e}");
        }
        let _ = self.child.wait().await;
    }
}

/// Spawn an adapter process and frame its stdio. The command line is executed
/// as an argv array, never through a shell.
pub fn spawn(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    cwd: Option<&PathBuf>,
) -> Result<(FramedReader<ChildStdout>, FramedWriter<ChildStdin>, ChildGuard), Error> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Protocol("adapter stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Protocol("adapter stdout unavailable".into()))?;

    Ok((
        FramedReader::new(stdout),
        FramedWriter::new(stdin),
        ChildGuard { child },
    ))
}

/// Connect to an adapter listening on `host:port`.
pub async fn connect(
    host: &str,
    port: u16,
) -> Result<(FramedReader<OwnedReadHalf>, FramedWriter<OwnedWriteHalf>), Error> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    Ok((FramedReader::new(rx), FramedWriter::new(tx)))
}

/// Frame an arbitrary read/write pair. Used by in-process tests.
pub fn from_streams<R, W>(reader: R, writer: W) -> (FramedReader<R>, FramedWriter<W>)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    (FramedReader::new(reader), FramedWriter::new(writer))
}
