//! The top-level controller handle: owns every long-lived collaborator for
//! one run and guarantees they're torn down cleanly on every exit path.
//!
//! A `Context` is the thing embedding code actually holds. Everything else
//! in the crate is a collaborator it wires together: inventory, state,
//! secrets, policy, audit, bundling, gates, the module registry, and the
//! event bus.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::audit::{AuditLog, Outcome};
use crate::bundle::BundleBuilder;
use crate::config::Config;
use crate::error::Result;
use crate::events::{Event, EventBus, EventSink};
use crate::executor::fanout::{self, FailMode, HostOutcome};
use crate::executor::Executor;
use crate::gate::{GateLaunchConfig, GateManager};
use crate::inventory::{Group, Inventory, Selector, Source};
use crate::modules::ModuleRegistry;
use crate::policy::Policy;
use crate::secrets::{SecretResolver, SecretSpec};
use crate::state::State;

/// Where inventory, policy, state, and audit history come from when
/// opening a context.
pub struct ContextConfig {
    pub inventory: Source,
    pub policy: Option<Policy>,
    pub secrets: SecretSpec,
    pub state_path: PathBuf,
    pub audit_path: Option<PathBuf>,
    pub replay: bool,
    pub config: Config,
}

/// An open run: inventory resolved, state loaded, secrets fetched, gates
/// ready to launch on demand. Dropping a context without calling
/// [`Context::close`] still flushes state and audit via their own `Drop`
/// impls, but gates are only shut down gracefully through `close`.
pub struct Context {
    inventory: Inventory,
    state: Arc<State>,
    executor: Arc<Executor>,
    config: Config,
}

impl Context {
    /// Open a context: load inventory and state, resolve secrets, parse
    /// policy, and prepare (but don't yet launch) gates.
    pub async fn open(cfg: ContextConfig, sink: impl EventSink) -> Result<Self> {
        let state = Arc::new(State::load(&cfg.state_path)?);
        let inventory = Inventory::load(cfg.inventory)?.with_state(state.clone());

        let secrets = SecretResolver::resolve(cfg.secrets, cfg.config.secrets_addr.as_deref(), cfg.config.secrets_token.clone()).await?;
        let policy = cfg.policy.unwrap_or_else(Policy::empty);

        let audit = match cfg.audit_path {
            Some(path) => AuditLog::with_path(path, cfg.replay)?,
            None => AuditLog::new(),
        };

        let registry = ModuleRegistry::new(cfg.config.module_search_paths.clone(), cfg.config.collection_root.clone());
        let bundles = BundleBuilder::new(
            cfg.config.module_search_paths.clone(),
            cfg.config.collection_root.clone(),
            cfg.config.lib_root.clone(),
            cfg.config.cache_dir.clone(),
        );
        let gates = GateManager::new(GateLaunchConfig {
            remote_cache_dir: "~/.cache/ftl2/gate".to_string(),
            entry_command: cfg.config.gate_entry_command.clone(),
            diagnostic_command: cfg.config.gate_diagnostic_command.clone(),
        });

        let (events, _consumer) = EventBus::spawn(sink);

        let executor = Arc::new(Executor::new(
            registry,
            policy,
            secrets,
            audit,
            bundles,
            gates,
            events,
            cfg.config.target_profile.clone(),
            cfg.config.environment.clone(),
            cfg.config.timeout,
        ));

        Ok(Self {
            inventory,
            state,
            executor,
            config: cfg.config,
        })
    }

    /// Run `module(params)` against a single host or group, returning one
    /// outcome per resolved host in selector order.
    pub async fn call(
        &self,
        selector: impl Into<Selector>,
        module: &str,
        params: IndexMap<String, Value>,
    ) -> Result<Vec<HostOutcome>> {
        fanout::fan_out(
            &self.executor,
            &self.inventory,
            &selector.into(),
            module,
            params,
            self.config.max_parallel_hosts,
            FailMode::BestEffort,
            self.config.cancel_grace,
        )
        .await
    }

    /// Same as [`Self::call`], but cancels not-yet-started hosts the moment
    /// any host fails.
    pub async fn call_fail_fast(
        &self,
        selector: impl Into<Selector>,
        module: &str,
        params: IndexMap<String, Value>,
    ) -> Result<Vec<HostOutcome>> {
        fanout::fan_out(
            &self.executor,
            &self.inventory,
            &selector.into(),
            module,
            params,
            self.config.max_parallel_hosts,
            FailMode::FailFast,
            self.config.cancel_grace,
        )
        .await
    }

    /// Run one module once against `host`, bypassing fan-out, policy, the
    /// audit log, and the persistent gate — the entry stub's `--run` mode
    /// instead of `--stream`, for debugging a module's bundled form
    /// directly. `dest_dir` is where the bundle is extracted on the target.
    pub async fn run_diagnostic(&self, host: &crate::inventory::Host, module: &str, dest_dir: &std::path::Path, params: Value) -> Result<Value> {
        let transport = crate::connection::connect(host).await?;
        let bundle = self.executor.bundles.build(&[module.to_string()], &self.executor.target_profile).await?;
        self.executor.gates.run_diagnostic(&transport, &bundle, dest_dir, module, params).await
    }

    /// Add a host to the inventory for the remainder of this run (and
    /// persist it to state, so later runs pick it up automatically).
    pub fn add_host(&mut self, name: impl Into<String>, attrs: IndexMap<String, serde_yaml::Value>) -> Result<()> {
        self.inventory.add_host(name, attrs)
    }

    /// A scoped handle for repeated calls against one group, sugar over
    /// passing the same selector to [`Self::call`] every time.
    pub fn group<'a>(&'a self, name: &str) -> GroupHandle<'a> {
        GroupHandle {
            context: self,
            selector: Selector::Group(name.to_string()),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn audit(&self) -> &AuditLog {
        &self.executor.audit
    }

    /// Every group known to the inventory.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.inventory.groups()
    }

    /// The resolved value of a secret binding by name, if one was resolved
    /// for this run.
    pub fn secret(&self, name: &str) -> Option<&str> {
        self.executor.secrets.get(name)
    }

    /// Hosts that have at least one failed call recorded in the audit log
    /// for this run, in the order their failures were recorded.
    pub fn failed(&self) -> Vec<String> {
        self.executor
            .audit
            .records()
            .into_iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .map(|r| r.host)
            .collect()
    }

    /// Error messages for every failed call recorded in the audit log for
    /// this run, in the order their failures were recorded.
    pub fn errors(&self) -> Vec<String> {
        self.executor
            .audit
            .records()
            .into_iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .filter_map(|r| r.error)
            .collect()
    }

    pub fn emit(&self, event: Event) {
        self.executor.events.emit(event);
    }

    /// Flush state and the audit log, then shut down every live gate. Safe
    /// to call more than once; a dropped context without an explicit
    /// `close` still flushes state and audit via their own `Drop` impls,
    /// but leaves gates running until they notice the transport is gone.
    pub async fn close(&self) -> Result<()> {
        self.executor.gates.shutdown_all().await;
        self.executor.audit.flush()?;
        self.state.flush()?;
        Ok(())
    }
}

/// A context scoped to one group, so repeated calls don't have to restate
/// the selector.
pub struct GroupHandle<'a> {
    context: &'a Context,
    selector: Selector,
}

impl GroupHandle<'_> {
    pub async fn call(&self, module: &str, params: IndexMap<String, Value>) -> Result<Vec<HostOutcome>> {
        fanout::fan_out(
            &self.context.executor,
            &self.context.inventory,
            &self.selector,
            module,
            params,
            self.context.config.max_parallel_hosts,
            FailMode::BestEffort,
            self.context.config.cancel_grace,
        )
        .await
    }
}
