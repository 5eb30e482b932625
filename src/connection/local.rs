//! Local gate transport: launches the gate's entry stub as a child process
//! on the control node itself, for hosts whose connection type is `local`.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};
use crate::traits::{GateChannel, Transport};

/// Bidirectional stream over a child process's stdin/stdout pipes.
pub struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
    // Held so the child is killed when the gate channel is dropped, not
    // left running after a transport loss.
    _child: Child,
}

impl std::fmt::Debug for ChildIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildIo").finish_non_exhaustive()
    }
}

impl AsyncRead for ChildIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

/// Launches gates as local child processes.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    host: String,
}

impl LocalTransport {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn host(&self) -> &str {
        &self.host
    }

    async fn launch(&self, command: &str) -> Result<Box<dyn GateChannel>> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::TransportLost(format!("{}: failed to spawn gate: {e}", self.host)))?;

        let stdin = child.stdin.take().ok_or_else(|| Error::TransportLost(self.host.clone()))?;
        let stdout = child.stdout.take().ok_or_else(|| Error::TransportLost(self.host.clone()))?;

        Ok(Box::new(ChildIo {
            stdin,
            stdout,
            _child: child,
        }))
    }
}
