//! Core traits defining the fundamental abstractions in FTL2.
//!
//! This module is deliberately small: the bulk of FTL2's behavior lives in
//! purpose-built modules (`inventory`, `policy`, `bundle`, `gate`, `executor`).
//! What remains here is the trait that every gate transport backend (local
//! subprocess, SSH) implements, since the executor and fan-out driver only
//! ever depend on this abstraction and never on a concrete backend.

use async_trait::async_trait;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A half-duplex byte stream to a running gate process's stdin/stdout.
///
/// Implementations own the underlying child process or SSH channel and tear
/// it down when dropped. The gate protocol layer frames messages over this
/// stream; it has no knowledge of how the bytes are carried.
pub trait GateChannel: AsyncRead + AsyncWrite + Send + Unpin + Debug {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + Debug> GateChannel for T {}

/// Transport backend capable of launching a gate process on a target host.
///
/// `local` and `ssh` are the two transports named in the data model; both
/// reduce to "run this command, hand me its stdio."
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Transport kind, used in error messages and tracing fields ("local", "ssh").
    fn kind(&self) -> &'static str;

    /// The host this transport targets.
    fn host(&self) -> &str;

    /// Launch `command` on the target and return its stdio as a byte stream.
    ///
    /// For `local` this spawns a child process directly; for `ssh` this opens
    /// a session channel and execs the command on the remote end.
    async fn launch(&self, command: &str) -> Result<Box<dyn GateChannel>>;
}
