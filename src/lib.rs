//! # FTL2 - A Fleet Automation Engine
//!
//! FTL2 runs declarative module invocations across a fleet of hosts over
//! SSH, concurrently and idempotently. It is embedded as a library rather
//! than driven by a playbook DSL: callers open a [`Context`](context::Context),
//! call modules against a host or group, and get back one outcome per host.
//!
//! ## Core Concepts
//!
//! - **Inventory**: hosts organized into groups, loaded from a document or
//!   discovered dynamically, with hosts addable at runtime
//! - **Modules**: units of work invoked by name, either native (running
//!   in-process on the control node) or dispatched to a remote gate
//! - **Bundles**: content-addressed archives packing a module and its
//!   dependencies for a target host
//! - **Gates**: a length-prefixed JSON protocol spoken with a process
//!   launched on the target host, one SSH session per host
//! - **Policy**: an ordered deny-rule list evaluated before every call
//! - **Secrets**: env vars and KV references resolved once and bound into
//!   module params, redacted out of the audit trail
//! - **Audit**: an append-only, replayable record of every call
//! - **State**: a crash-safe snapshot of dynamically-added hosts and vars
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            Context                                    │
//! │            (inventory + state, secrets, policy, audit)               │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!          ┌─────────────────────────┼─────────────────────────┐
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │   Module         │   │   Fan-out driver    │   │   Event bus         │
//! │   Registry       │   │   (bounded          │   │   (progress/log/    │
//! │                  │   │    concurrency)      │   │    data streams)    │
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Gate transport                                │
//! │             (local child process, or SSH per host)                   │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         Target Hosts                                 │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use ftl2::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let context = Context::open(context_config, NullSink).await?;
//!
//!     let mut params = indexmap::IndexMap::new();
//!     params.insert("msg".to_string(), serde_json::Value::String("hello".to_string()));
//!     let outcomes = context.call("webservers", "ftl2.builtin.debug", params).await?;
//!
//!     context.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of the types most callers need.

    pub use crate::audit::{AuditLog, Outcome, Record};
    pub use crate::config::Config;
    pub use crate::context::{Context, ContextConfig, GroupHandle};
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventBus, EventSink, LogLevel, NullSink};
    pub use crate::executor::fanout::{all_succeeded, failures, FailMode, HostOutcome};
    pub use crate::executor::Executor;
    pub use crate::inventory::{ConnectionType, Group, Host, Inventory, Selector, Source};
    pub use crate::modules::{Module, ModuleDescriptor, ModuleOutput, ModuleRegistry};
    pub use crate::policy::{Decision, Policy, Rule};
    pub use crate::secrets::{SecretResolver, SecretSpec};
    pub use crate::state::State;
}

/// The audit log: an append-only, replayable record of every module call.
pub mod audit;

/// Content-addressed module bundling for gate dispatch.
pub mod bundle;

/// Configuration loading, layering defaults, a config file, and environment.
pub mod config;

/// The controller handle: wires every collaborator together for one run.
pub mod context;

/// Gate transports: local child processes and SSH sessions.
pub mod connection;

/// The crate-wide error type and `Result` alias.
pub mod error;

/// The event bus: progress, log, and data streams from in-flight calls.
pub mod events;

/// The per-call execution pipeline and the fan-out driver.
pub mod executor;

/// The gate wire protocol and gate lifecycle management.
pub mod gate;

/// Inventory management: hosts, groups, and selectors.
pub mod inventory;

/// The module registry and the native module trait.
pub mod modules;

/// Deny-rule policy evaluation.
pub mod policy;

/// Secret resolution and credential redaction.
pub mod secrets;

/// Crash-safe state snapshot storage.
pub mod state;

/// Shared async abstractions: the gate transport and channel traits.
pub mod traits;

/// Returns the current version of FTL2.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns detailed version information including build metadata.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        target: std::env::consts::ARCH,
        profile: if cfg!(debug_assertions) { "debug" } else { "release" },
    }
}

/// Detailed version information for the FTL2 build.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: &'static str,
    pub target: &'static str,
    pub profile: &'static str,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ftl2 {} ({}, {})", self.version, self.target, self.profile)
    }
}
