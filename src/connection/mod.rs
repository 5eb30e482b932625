//! Gate transports: how the controller launches and talks to a gate
//! process, whether that's a local child process or a remote one reached
//! over SSH.
//!
//! Everything above this layer only depends on [`crate::traits::Transport`];
//! the executor asks a per-host transport to `launch` a command and gets
//! back a byte stream, without caring which concrete transport it is.

pub mod local;

#[cfg(feature = "russh")]
pub mod ssh;

pub use local::LocalTransport;

#[cfg(feature = "russh")]
pub use ssh::SshTransport;

use std::sync::Arc;

use crate::error::Result;
use crate::inventory::{ConnectionType, Host};
use crate::traits::Transport;

/// Open the transport appropriate for a host's configured connection type.
pub async fn connect(host: &Host) -> Result<Arc<dyn Transport>> {
    match host.connection {
        ConnectionType::Local => Ok(Arc::new(LocalTransport::new(host.name.clone()))),
        #[cfg(feature = "russh")]
        ConnectionType::Ssh => Ok(Arc::new(SshTransport::connect(host).await?)),
        #[cfg(not(feature = "russh"))]
        ConnectionType::Ssh => Err(crate::error::Error::Config(
            "ssh connections require the russh feature".to_string(),
        )),
    }
}
