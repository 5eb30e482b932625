//! Fan-out driver (C10): runs one call across every host a selector
//! resolves to, bounded by `max_parallel_hosts` concurrent hosts.
//!
//! Each host's audit record lands in the log at the position its host
//! occupies in the selector's resolved order, not the order its call
//! happens to finish in: [`crate::audit::AuditLog::reserve`] claims that
//! position up front, before any host's call starts.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Executor;
use crate::error::{Error, Result};
use crate::inventory::{Host, Inventory, Selector};
use crate::modules::ModuleOutput;

/// How a fan-out call behaves when one host fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Run every host to completion regardless of failures elsewhere.
    BestEffort,
    /// Cancel pending hosts as soon as one fails, draining in-flight remote
    /// calls for up to `cancel_grace` before abandoning their gate frames.
    FailFast,
}

/// Outcome of one host's call within a fan-out.
#[derive(Debug, Clone)]
pub struct HostOutcome {
    pub host: String,
    pub result: std::result::Result<ModuleOutput, String>,
}

/// Run `module(params)` against every host `selector` resolves to.
///
/// Results are returned in the same order as `inventory.hosts(selector)`,
/// independent of which host's call actually finished first.
pub async fn fan_out(
    executor: &Arc<Executor>,
    inventory: &Inventory,
    selector: &Selector,
    module: &str,
    params: IndexMap<String, Value>,
    max_parallel_hosts: usize,
    fail_mode: FailMode,
    cancel_grace: Duration,
) -> Result<Vec<HostOutcome>> {
    let hosts = inventory.hosts(selector)?;
    if hosts.is_empty() {
        return Ok(Vec::new());
    }

    let slots: Vec<usize> = hosts.iter().map(|_| executor.audit.reserve()).collect();
    let semaphore = Arc::new(Semaphore::new(max_parallel_hosts.max(1)));
    let cancel = CancellationToken::new();

    let mut handles = Vec::with_capacity(hosts.len());
    for (host, slot) in hosts.iter().copied().zip(slots) {
        let permit_pool = semaphore.clone();
        let cancel = cancel.clone();
        let host_owned = host.clone();
        let params = params.clone();
        let module = module.to_string();
        let executor = executor.clone();

        handles.push(tokio::spawn(async move {
            if cancel.is_cancelled() {
                return HostOutcome {
                    host: host_owned.name.clone(),
                    result: Err("cancelled before starting".to_string()),
                };
            }
            let _permit = permit_pool.acquire_owned().await.expect("semaphore never closes");
            run_one(&executor, &host_owned, &module, params, slot, &cancel, fail_mode).await
        }));
    }

    // A cancelled call races its gate frame against `cancel` and returns
    // almost immediately (see `Gate::execute_cancellable`); this is a
    // backstop for anything that doesn't observe cancellation cooperatively
    // (a native dispatch, or a call not yet past its `connect`/`build`
    // setup), so no task can outlive `cancel_grace` past the first failure.
    let abort_handles: Vec<_> = handles.iter().map(tokio::task::JoinHandle::abort_handle).collect();
    let grace_cancel = cancel.clone();
    let grace_task = tokio::spawn(async move {
        grace_cancel.cancelled().await;
        tokio::time::sleep(cancel_grace).await;
        for handle in abort_handles {
            handle.abort();
        }
    });

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match tokio::time::timeout(cancel_grace + Duration::from_secs(1), handle).await {
            Ok(Ok(outcome)) => outcomes.push(outcome),
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "fan-out task panicked or was aborted");
                outcomes.push(HostOutcome {
                    host: "unknown".to_string(),
                    result: Err("task panicked or was aborted".to_string()),
                });
            }
            Err(_) => {
                outcomes.push(HostOutcome {
                    host: "unknown".to_string(),
                    result: Err("call abandoned after cancel grace".to_string()),
                });
            }
        }
    }
    grace_task.abort();

    Ok(outcomes)
}

async fn run_one(
    executor: &Executor,
    host: &Host,
    module: &str,
    params: IndexMap<String, Value>,
    slot: usize,
    cancel: &CancellationToken,
    fail_mode: FailMode,
) -> HostOutcome {
    let result = executor.execute_into(Some(slot), module, host, params, cancel).await;

    if result.is_err() && fail_mode == FailMode::FailFast {
        cancel.cancel();
    }

    HostOutcome {
        host: host.name.clone(),
        result: result.map_err(|e| e.to_string()),
    }
}

/// Whether every host in a fan-out's outcomes succeeded.
pub fn all_succeeded(outcomes: &[HostOutcome]) -> bool {
    outcomes.iter().all(|o| o.result.is_ok())
}

/// Outcomes for the hosts that failed, preserving selector order.
pub fn failures(outcomes: &[HostOutcome]) -> Vec<&HostOutcome> {
    outcomes.iter().filter(|o| o.result.is_err()).collect()
}

/// Names of the hosts that failed, preserving selector order.
pub fn failed(outcomes: &[HostOutcome]) -> Vec<&str> {
    outcomes.iter().filter(|o| o.result.is_err()).map(|o| o.host.as_str()).collect()
}

/// Error messages for the hosts that failed, preserving selector order.
pub fn errors(outcomes: &[HostOutcome]) -> Vec<&str> {
    outcomes.iter().filter_map(|o| o.result.as_ref().err()).map(String::as_str).collect()
}
