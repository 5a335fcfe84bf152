//! armvm: plan and simulate virtual machine reconciliation passes.
//!
//! - `plan` validates a desired configuration and prints the disruption plan
//!   for a set of changed attributes without contacting anything
//! - `simulate` runs a full update pass against the in-memory control plane
//!   and prints the ordered remote call log

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use armvm::classifier::Classifier;
use armvm::desired::{ChangeSet, ConfigSnapshot, DesiredState};
use armvm::guard::LockTable;
use armvm::inspector::PowerState;
use armvm::plan::{HostFacts, Planner};
use armvm::reconciler::{Reconciler, VirtualMachineReconciler};
use armvm::sim::SimulatedCloud;
use armvm::{EngineConfig, ResourceIdentity};

/// armvm virtual machine reconciler
#[derive(Parser, Debug)]
#[command(name = "armvm", version, about)]
struct Args {
    /// Subscription the resources live in
    #[arg(
        long,
        env = "ARMVM_SUBSCRIPTION_ID",
        default_value = "00000000-0000-0000-0000-000000000000",
        global = true
    )]
    subscription: String,

    /// JSON file with the engine configuration, replaces the flags below
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    engine: EngineConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the desired configuration and print the update plan
    Plan {
        /// Desired configuration (JSON)
        #[arg(long)]
        desired: PathBuf,

        /// Changed attribute paths, comma separated
        #[arg(long, value_delimiter = ',')]
        changed: Vec<String>,

        /// Size offered by the current host (repeatable). Without any, every
        /// size counts as available
        #[arg(long = "available-size")]
        available_sizes: Vec<String>,
    },

    /// Run an update pass against the simulated control plane
    Simulate {
        /// Desired configuration (JSON)
        #[arg(long)]
        desired: PathBuf,

        /// Changed attribute paths, comma separated. Derived from `--initial`
        /// when omitted
        #[arg(long, value_delimiter = ',')]
        changed: Vec<String>,

        /// Configuration the instance was created from (JSON). Defaults to
        /// the desired configuration
        #[arg(long)]
        initial: Option<PathBuf>,

        /// Power state of the instance before the pass
        #[arg(long, default_value = "running")]
        power_state: String,

        /// Create the instance with an ephemeral OS disk
        #[arg(long)]
        ephemeral_os_disk: bool,

        /// Size offered by the current host (repeatable)
        #[arg(long = "available-size")]
        available_sizes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "armvm=info,audit=info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let engine = match &args.config {
        Some(path) => {
            let source = path.display();
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {source}"))?;
            EngineConfig::from_json(&raw)
                .with_context(|| format!("invalid engine configuration in {source}"))?
        }
        None => args.engine.clone(),
    };

    let output = match args.command {
        Command::Plan {
            desired,
            changed,
            available_sizes,
        } => plan(&args.subscription, &desired, changed, available_sizes)?,
        Command::Simulate {
            desired,
            changed,
            initial,
            power_state,
            ephemeral_os_disk,
            available_sizes,
        } => {
            let power = PowerState::from_code(&power_state);
            if power == PowerState::Unknown {
                bail!("unknown power state {power_state:?}");
            }
            let options = SimulateOptions {
                initial,
                power,
                ephemeral_os_disk,
                available_sizes,
            };
            simulate(&args.subscription, engine, &desired, changed, options).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<ConfigSnapshot> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if !value.is_object() {
        bail!("{} must contain a JSON object", path.display());
    }
    Ok(ConfigSnapshot::from_value(&value))
}

fn identity_of(subscription: &str, desired: &ConfigSnapshot) -> Result<ResourceIdentity> {
    let name = desired
        .get_non_empty_str("name")
        .context("`name` is required")?;
    let resource_group = desired
        .get_non_empty_str("resource_group_name")
        .context("`resource_group_name` is required")?;
    Ok(ResourceIdentity::new(subscription, resource_group, name))
}

fn plan(
    subscription: &str,
    desired_path: &Path,
    changed: Vec<String>,
    available_sizes: Vec<String>,
) -> Result<Value> {
    let desired = load_snapshot(desired_path)?;
    let id = identity_of(subscription, &desired)?;
    let changes = ChangeSet::new(changed);

    let host = HostFacts {
        available_sizes: (!available_sizes.is_empty()).then_some(available_sizes),
        os_disk: desired
            .get_non_empty_str("os_disk.name")
            .map(|name| id.disk(name)),
    };
    let plan = Planner::default()
        .plan(&desired, &changes, &host)
        .map_err(|v| anyhow!("invalid configuration: {v}"))?;

    info!(vm = %id.name(), changes = changes.len(), "Planned update");
    Ok(json!({
        "id": id.to_string(),
        "changes": changes.iter().collect::<Vec<_>>(),
        "plan": plan,
    }))
}

struct SimulateOptions {
    initial: Option<PathBuf>,
    power: PowerState,
    ephemeral_os_disk: bool,
    available_sizes: Vec<String>,
}

async fn simulate(
    subscription: &str,
    engine: EngineConfig,
    desired_path: &Path,
    changed: Vec<String>,
    options: SimulateOptions,
) -> Result<Value> {
    let desired = load_snapshot(desired_path)?;
    let id = identity_of(subscription, &desired)?;

    let mut initial = match &options.initial {
        Some(path) => load_snapshot(path)?,
        None => desired.clone(),
    };
    if options.ephemeral_os_disk {
        initial.set("os_disk.diff_disk_settings.option", "Local");
    }

    let changes = if changed.is_empty() {
        let defaults = Classifier::default().defaults();
        desired.changes_since(initial.values(), defaults)
    } else {
        ChangeSet::new(changed)
    };

    let cloud = SimulatedCloud::new().with_available_sizes(options.available_sizes);
    cloud
        .seed_from_desired(&id, &initial)
        .map_err(|v| anyhow!("invalid initial configuration: {v}"))?;
    if let Some(vm) = cloud.vm(&id) {
        cloud.insert_vm(&id, vm, options.power);
    }
    cloud.clear_calls();

    let cloud = Arc::new(cloud);
    let reconciler = VirtualMachineReconciler::new(
        subscription,
        cloud.clone(),
        cloud.clone(),
        LockTable::new(),
        engine,
    );

    let observed = reconciler
        .update(&id, &desired, &changes)
        .await
        .with_context(|| format!("update of {} failed", id.name()))?;

    Ok(json!({
        "id": id.to_string(),
        "changes": changes.iter().collect::<Vec<_>>(),
        "calls": cloud.calls(),
        "power_state": observed.power_state(),
        "observed": observed.attributes,
    }))
}
