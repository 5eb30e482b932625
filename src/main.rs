//! FTL2 — a thin diagnostic front-end over the `ftl2` library.
//!
//! Not the focus of this crate: real automation is expected to drive
//! [`ftl2::context::Context`] directly from async Rust. This binary exists
//! to validate an inventory/policy file and to run a single ad-hoc module
//! call against a selector for smoke-testing.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use ftl2::config::Config;
use ftl2::context::{Context, ContextConfig};
use ftl2::events::NullSink;
use ftl2::inventory::{Host, Inventory, Source};
use ftl2::policy::Policy;
use ftl2::secrets::SecretSpec;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ftl2", version, about = "Fleet automation engine diagnostics")]
struct Cli {
    /// Inventory document (YAML/JSON).
    #[arg(long, global = true)]
    inventory: Option<PathBuf>,

    /// Policy document (YAML list of deny rules).
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Config file layered over built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State snapshot path.
    #[arg(long, global = true, default_value = "ftl2-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the inventory and policy files and report any errors.
    Validate,
    /// Run a single module call against a selector and print the result.
    Call {
        /// Host name, group name, or comma-separated list.
        selector: String,
        /// Dotted or bare module name.
        module: String,
        /// `key=value` params, repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },
    /// Run one module's bundled form once, bypassing fan-out, policy, and
    /// the persistent gate — for debugging what the bundle builder actually
    /// ships to a host.
    Run {
        /// Dotted or bare module name.
        module: String,
        /// Directory the bundle is extracted into before running.
        #[arg(long, default_value = "ftl2-diagnostic")]
        dest: PathBuf,
        /// `key=value` params, repeatable.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,
    },
}

fn parse_param(raw: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let parsed = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), parsed))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let inventory_source = match &cli.inventory {
        Some(path) => Source::Path(path.clone()),
        None => Source::Value(serde_yaml::Value::Mapping(Default::default())),
    };

    match &cli.command {
        Commands::Validate => run_validate(&cli, inventory_source),
        Commands::Call { selector, module, params } => {
            run_call(&cli, inventory_source, selector, module, params.clone()).await
        }
        Commands::Run { module, dest, params } => run_diagnostic(&cli, module, dest, params.clone()).await,
    }
}

fn run_validate(cli: &Cli, inventory_source: Source) -> Result<()> {
    Inventory::load(inventory_source).context("loading inventory")?;
    println!("inventory: ok");

    if let Some(path) = &cli.policy {
        let document = std::fs::read_to_string(path).context("reading policy file")?;
        Policy::parse(&document).context("parsing policy")?;
        println!("policy: ok");
    }

    Ok(())
}

async fn run_call(
    cli: &Cli,
    inventory_source: Source,
    selector: &str,
    module: &str,
    params: Vec<(String, serde_json::Value)>,
) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).unwrap_or_else(|e| {
        eprintln!("warning: failed to load config: {e}, using defaults");
        Config::default()
    });

    let policy = match &cli.policy {
        Some(path) => {
            let document = std::fs::read_to_string(path).context("reading policy file")?;
            Some(Policy::parse(&document).context("parsing policy")?)
        }
        None => None,
    };

    let context = Context::open(
        ContextConfig {
            inventory: inventory_source,
            policy,
            secrets: SecretSpec::default(),
            state_path: cli.state.clone(),
            audit_path: None,
            replay: false,
            config,
        },
        NullSink,
    )
    .await
    .context("opening context")?;

    let param_map = params.into_iter().collect();
    let outcomes = context.call(selector, module, param_map).await.context("running call")?;

    for outcome in &outcomes {
        match &outcome.result {
            Ok(output) => println!(
                "{}: {} (changed={}) {}",
                outcome.host,
                if output.success { "ok" } else { "failed" },
                output.changed,
                output.output
            ),
            Err(message) => println!("{}: error: {message}", outcome.host),
        }
    }

    context.close().await.context("closing context")?;

    let failed = outcomes
        .iter()
        .any(|o| o.result.is_err() || matches!(&o.result, Ok(output) if !output.success));
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_diagnostic(cli: &Cli, module: &str, dest: &PathBuf, params: Vec<(String, serde_json::Value)>) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).unwrap_or_else(|e| {
        eprintln!("warning: failed to load config: {e}, using defaults");
        Config::default()
    });

    let context = Context::open(
        ContextConfig {
            inventory: Source::Value(serde_yaml::Value::Mapping(Default::default())),
            policy: None,
            secrets: SecretSpec::default(),
            state_path: cli.state.clone(),
            audit_path: None,
            replay: false,
            config,
        },
        NullSink,
    )
    .await
    .context("opening context")?;

    let param_map: serde_json::Map<String, serde_json::Value> = params.into_iter().collect();
    let host = Host::local("localhost");
    let output = context
        .run_diagnostic(&host, module, dest, serde_json::Value::Object(param_map))
        .await
        .context("running diagnostic")?;

    println!("{}", serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string()));

    context.close().await.context("closing context")?;
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("FTL2_LOG_FORMAT").as_deref() == Ok("json");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
