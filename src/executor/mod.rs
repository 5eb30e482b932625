//! Executor (C9): the per-call pipeline that turns `(module, host, params)`
//! into a recorded [`ModuleOutput`].
//!
//! [`fanout`] builds on this to run one call across a whole selector.

pub mod fanout;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{AuditLog, Outcome, Record};
use crate::bundle::BundleBuilder;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::gate::{Gate, GateEvent, GateManager};
use crate::inventory::Host;
use crate::modules::{Module, ModuleOutput, ModuleRegistry, Resolution};
use crate::policy::{Decision, Policy};
use crate::secrets::SecretResolver;

/// Everything a call needs to dispatch, either natively or through a gate.
/// One `Executor` is shared (via `Arc`) across every call in a context.
pub struct Executor {
    pub registry: ModuleRegistry,
    pub policy: Policy,
    pub secrets: SecretResolver,
    pub audit: AuditLog,
    pub bundles: BundleBuilder,
    pub gates: GateManager,
    pub events: EventBus,
    pub target_profile: String,
    pub environment: String,
    /// Per-call deadline, enforced around native dispatch. Remote dispatch
    /// relies on the gate's own call lifecycle instead (see spec §9).
    pub timeout: Duration,
    call_index: AtomicUsize,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: ModuleRegistry,
        policy: Policy,
        secrets: SecretResolver,
        audit: AuditLog,
        bundles: BundleBuilder,
        gates: GateManager,
        events: EventBus,
        target_profile: impl Into<String>,
        environment: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            policy,
            secrets,
            audit,
            bundles,
            gates,
            events,
            target_profile: target_profile.into(),
            environment: environment.into(),
            timeout,
            call_index: AtomicUsize::new(0),
        }
    }

    /// Run one module call against one host.
    ///
    /// Order matters: replay is checked before policy so a replayed call
    /// never re-evaluates a policy that may have since changed, and secret
    /// bindings are merged after policy so `policy.evaluate` only ever sees
    /// what the caller actually wrote.
    pub async fn execute(&self, module: &str, host: &Host, params: IndexMap<String, Value>) -> Result<ModuleOutput> {
        self.execute_into(None, module, host, params, &CancellationToken::new()).await
    }

    /// Same pipeline as [`Self::execute`], but files the resulting record
    /// into an audit slot reserved ahead of time (see
    /// [`crate::audit::AuditLog::reserve`]) instead of appending it at the
    /// back of the log. The fan-out driver uses this to keep audit emission
    /// order equal to selector order even though hosts race to completion,
    /// and passes `cancel` through so a fail-fast cancellation can abandon
    /// this call's in-flight gate frame instead of waiting it out.
    pub(crate) async fn execute_into(
        &self,
        slot: Option<usize>,
        module: &str,
        host: &Host,
        params: IndexMap<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<ModuleOutput> {
        let call_index = self.call_index.fetch_add(1, Ordering::SeqCst);
        let request_id = format!("{}-{call_index}", host.name);
        let original_params = params.clone();
        let started = Instant::now();

        if let Some(record) = self.audit.try_replay(module, &host.name, call_index) {
            self.events.emit(Event::ModuleComplete {
                request_id,
                host: host.name.clone(),
                module: module.to_string(),
                replayed: true,
            });
            return Ok(ModuleOutput {
                success: !matches!(record.outcome, Outcome::Failed),
                changed: record.changed,
                output: record.output,
                error: record.error,
            });
        }

        match self.policy.evaluate(module, &host.name, &self.environment, &params) {
            Decision::Allow => {}
            Decision::Deny(reason) => return Err(Error::PolicyDenied(reason)),
        }

        let mut params = params;
        for (key, value) in self.secrets.bindings_for(module) {
            params.entry(key).or_insert(value);
        }

        self.events.emit(Event::ModuleStart {
            request_id: request_id.clone(),
            host: host.name.clone(),
            module: module.to_string(),
        });

        let dispatch_result = self.dispatch(module, host, &params, &request_id, cancel).await;
        log_completion(&host.name, module, &dispatch_result);

        let duration_ms = started.elapsed().as_millis() as u64;
        let redacted = self.secrets.redact(&original_params, module);

        let record = match &dispatch_result {
            Ok(output) => Record {
                request_id: request_id.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                host: host.name.clone(),
                module: module.to_string(),
                params: redacted,
                outcome: if output.success { Outcome::Ok } else { Outcome::Failed },
                changed: output.changed,
                output: output.output.clone(),
                error: output.error.clone(),
                duration_ms,
            },
            Err(e) => Record {
                request_id: request_id.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                host: host.name.clone(),
                module: module.to_string(),
                params: redacted,
                outcome: Outcome::Failed,
                changed: false,
                output: Value::Null,
                error: Some(e.to_string()),
                duration_ms,
            },
        };
        match slot {
            Some(slot) => self.audit.finalize(slot, record),
            None => self.audit.append(record),
        }

        self.events.emit(Event::ModuleComplete {
            request_id,
            host: host.name.clone(),
            module: module.to_string(),
            replayed: false,
        });

        dispatch_result
    }

    async fn dispatch(
        &self,
        module: &str,
        host: &Host,
        params: &IndexMap<String, Value>,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ModuleOutput> {
        match self.registry.resolve(module)? {
            Resolution::Native(native) => self.dispatch_native(native, params.clone()).await,
            Resolution::Remote { fqcn, .. } => self.dispatch_remote(&fqcn, host, params, request_id, cancel).await,
        }
    }

    /// Run a native module under a supervised call: a panic inside it
    /// surfaces as an error instead of unwinding into the caller, and a call
    /// that outlives `self.timeout` is aborted rather than left running.
    async fn dispatch_native(&self, native: Arc<dyn Module>, params: IndexMap<String, Value>) -> Result<ModuleOutput> {
        let fqcn = native.fqcn();
        let handle = tokio::spawn(async move { native.execute(&params, false).await });
        let abort_handle = handle.abort_handle();

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => Err(Error::Other {
                message: format!("native module '{fqcn}' panicked"),
                source: None,
            }),
            Ok(Err(join_err)) => Err(Error::Other {
                message: format!("native module '{fqcn}' call did not complete: {join_err}"),
                source: None,
            }),
            Err(_) => {
                abort_handle.abort();
                Err(Error::Timeout(self.timeout))
            }
        }
    }

    /// Dispatch through a gate, retrying exactly once on `TransportLost`
    /// after the gate is relaunched (spec §7: the controller never retries a
    /// module call itself, only the gate restart around it).
    async fn dispatch_remote(
        &self,
        fqcn: &str,
        host: &Host,
        params: &IndexMap<String, Value>,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ModuleOutput> {
        let transport = crate::connection::connect(host).await?;
        let bundle = self.bundles.build(&[fqcn.to_string()], &self.target_profile).await?;

        let mut last_transport_err = None;
        for attempt in 0..2 {
            let gate = self.gates.ensure(&transport, &bundle).await?;
            match self.call_gate(&gate, fqcn, params, request_id, cancel).await {
                Ok(output) => return Ok(output),
                Err(Error::TransportLost(lost_host)) if attempt == 0 => {
                    warn!(host = %lost_host, "gate transport lost mid-call, restarting gate for one retry");
                    last_transport_err = Some(Error::TransportLost(lost_host));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_transport_err.unwrap_or_else(|| Error::TransportLost(host.name.clone())))
    }

    async fn call_gate(
        &self,
        gate: &Gate,
        fqcn: &str,
        params: &IndexMap<String, Value>,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ModuleOutput> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<GateEvent>();
        let bus = self.events.clone();
        let request_id_owned = request_id.to_string();
        let no_log = self.secrets.no_log_registry();
        let forward = tokio::spawn(async move {
            while let Some(gate_event) = events_rx.recv().await {
                bus.emit(crate::events::from_gate_event(
                    &request_id_owned,
                    gate_event.kind,
                    gate_event.payload,
                    &no_log,
                ));
            }
        });

        let params_value = Value::Object(params.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        let result = gate.execute_cancellable(fqcn, params_value, false, events_tx, cancel).await;
        forward.await.ok();

        let result = result?;
        Ok(ModuleOutput {
            success: result.success,
            changed: result.changed,
            output: result.output,
            error: result.error,
        })
    }
}

/// Logged when a call finishes so operators following the controller's log
/// stream see every module completion, not just failures.
pub(crate) fn log_completion(host: &str, module: &str, output: &Result<ModuleOutput>) {
    match output {
        Ok(o) if o.success => info!(host, module, changed = o.changed, "module completed"),
        Ok(o) => warn!(host, module, error = ?o.error, "module reported failure"),
        Err(e) => warn!(host, module, error = %e, "module call errored"),
    }
}
