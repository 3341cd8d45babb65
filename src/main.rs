//! homelab - k3s cluster bootstrap on Proxmox
//!
//! This is the main CLI entry point for homelab.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use homelab::bootstrap::{BootstrapOrchestrator, BootstrapResult, PassReport, Scheduler, StepResult};
use homelab::config::{Config, ConfigLoader};
use homelab::kube::{KubeClient, KubeClientBuilder, LonghornInstaller};
use homelab::labels::constants::LONGHORN_NAMESPACE;
use homelab::outputs::StackOutputs;
use homelab::provision::{provision_all, ProxmoxClient, TemplateBuilder, TemplateOptions, VmHandle};
use homelab::remote::{
    ConnectRetry, FileStateStore, RemoteExecutor, RetryingTransport, SshTransport, StateStore,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// State file name inside the state directory
const STATE_FILE: &str = "state.json";

/// homelab - k3s on Proxmox
#[derive(Parser)]
#[command(name = "homelab")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Provision VMs on Proxmox and bootstrap a k3s cluster with Longhorn", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Stack file (default: homelab.yaml in the current directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for state, kubeconfig and outputs
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision VMs, bootstrap k3s, fetch the kubeconfig and install Longhorn
    Up {
        /// Trust that every node's VM already exists
        #[arg(long)]
        skip_provision: bool,
    },

    /// Print the bootstrap step graph
    Plan,

    /// Print the labels derived for every node
    Labels,

    /// Converge the cluster and write its kubeconfig
    Kubeconfig,

    /// Print the outputs of the last successful `up`
    Outputs,

    /// Create the cloud-init VM template (run on a Proxmox host as root)
    Template {
        /// Template VMID (e.g. 9000)
        #[arg(long)]
        vmid: u32,
        /// Template VM name
        #[arg(long, default_value = "ubuntu-cloudinit-template")]
        name: String,
        /// Target storage for disks
        #[arg(long, default_value = "local-lvm")]
        storage: String,
        /// Proxmox bridge
        #[arg(long, default_value = "vmbr0")]
        bridge: String,
        #[arg(long, default_value = "2")]
        cores: u32,
        /// Memory in MB
        #[arg(long, default_value = "2048")]
        memory: u64,
        /// Ubuntu cloud image URL
        #[arg(long)]
        image_url: Option<String>,
        /// Local image file (skips the download)
        #[arg(long)]
        image_path: Option<PathBuf>,
        /// Where downloaded images are stored
        #[arg(long)]
        iso_dir: Option<PathBuf>,
        /// Resize scsi0, e.g. 32G
        #[arg(long)]
        disk_resize: Option<String>,
        /// cloud-init user
        #[arg(long, default_value = "ubuntu")]
        ciuser: String,
        /// Public key file baked into the template
        #[arg(long)]
        sshkeys: Option<PathBuf>,
        /// ipconfig0 value: dhcp or ip=...,gw=...
        #[arg(long, default_value = "dhcp")]
        ipconfig: String,
        /// VLAN tag for net0 (0 = none)
        #[arg(long, default_value = "0")]
        vlan: u16,
        /// Print commands without executing
        #[arg(long)]
        dry_run: bool,
    },

    /// Forget a step's applied state so the next pass re-runs it
    Forget {
        /// Step name, e.g. w1-k3s-agent
        step: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --debug
    let default_level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Template {
            vmid,
            name,
            storage,
            bridge,
            cores,
            memory,
            image_url,
            image_path,
            iso_dir,
            disk_resize,
            ciuser,
            sshkeys,
            ipconfig,
            vlan,
            dry_run,
        } => {
            let mut options = TemplateOptions::new(vmid);
            options.name = name;
            options.storage = storage;
            options.bridge = bridge;
            options.cores = cores;
            options.memory_mb = memory;
            if let Some(url) = image_url {
                options.image_url = url;
            }
            options.image_path = image_path;
            if let Some(dir) = iso_dir {
                options.iso_dir = dir;
            }
            options.disk_resize = disk_resize.filter(|s| !s.is_empty());
            options.ciuser = Some(ciuser).filter(|s| !s.is_empty());
            options.sshkeys = sshkeys;
            options.ipconfig = Some(ipconfig).filter(|s| !s.is_empty());
            options.vlan = Some(vlan).filter(|v| *v > 0);
            options.dry_run = dry_run;

            TemplateBuilder::new(options)
                .run()
                .await
                .context("Template creation failed")?;
            println!("Template {} created", vmid);
        }

        command => {
            let config = load_config(cli.config.as_deref())?;
            let state_dir = resolve_state_dir(cli.state_dir, &config);
            run_stack_command(command, &config, &state_dir).await?;
        }
    }

    Ok(())
}

async fn run_stack_command(command: Commands, config: &Config, state_dir: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Up { skip_provision } => {
            let vms = if skip_provision {
                adopt_vms(config)
            } else {
                let spec = config
                    .proxmox
                    .as_ref()
                    .context("A proxmox block is required to provision VMs (or pass --skip-provision)")?;
                let client = ProxmoxClient::new(spec, &config.ssh.user)?;
                provision_all(Arc::new(client), &config.nodes, &config.template).await?
            };

            let executor = ssh_executor(config, state_dir)?;
            let result = bootstrap(config, &vms, &executor).await?;
            print_report(&result.report);
            let cluster = result.cluster_handle()?;

            let client = KubeClientBuilder::new(&executor, state_dir).build(&cluster).await?;
            install_longhorn(config, &client, executor.store().clone()).await?;

            let outputs = StackOutputs::from_config(config);
            let path = outputs.save(state_dir)?;
            tracing::info!("Wrote outputs to {}", path.display());
            println!("{}", outputs.to_json()?);
        }

        Commands::Plan => {
            let orchestrator = BootstrapOrchestrator::new(config);
            let plan = orchestrator.plan(&adopt_vms(config))?;

            println!("primary: {} ({})", plan.primary_node, plan.primary_address);
            for id in plan.graph.topological_order() {
                let Some(step) = plan.graph.get(id) else {
                    continue;
                };
                let deps: Vec<&str> = step.step_dependencies().map(|d| d.as_str()).collect();
                println!(
                    "{:<24} {:<16} {:<16} after [{}] triggers {} script {}",
                    step.id.as_str(),
                    step.kind.as_str(),
                    step.target,
                    deps.join(", "),
                    step.triggers,
                    step.script.digest()
                );
            }
        }

        Commands::Labels => {
            let orchestrator = BootstrapOrchestrator::new(config);
            for (node, labels) in orchestrator.labels() {
                println!("{} ({}, {})", node.name, node.role, node.proxmox_node);
                for label in labels.iter() {
                    println!("  {}", label);
                }
            }
        }

        Commands::Kubeconfig => {
            let executor = ssh_executor(config, state_dir)?;
            let result = bootstrap(config, &adopt_vms(config), &executor).await?;
            let cluster = result.cluster_handle()?;
            let client = KubeClientBuilder::new(&executor, state_dir).build(&cluster).await?;
            println!("{}", client.kubeconfig().display());
        }

        Commands::Outputs => match StackOutputs::load(state_dir)? {
            Some(outputs) => println!("{}", outputs.to_json()?),
            None => bail!("No outputs in {} yet; run `homelab up`", state_dir.display()),
        },

        Commands::Forget { step } => {
            let store = open_store(state_dir)?;
            let removed = store.forget(&step)?;
            if removed.is_empty() {
                println!("No applied state for step {}", step);
            }
            for key in removed {
                println!("Forgot {}", key);
            }
        }

        Commands::Template { .. } => bail!("template does not use a stack file"),
    }

    Ok(())
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir()?;
            ConfigLoader::find_config_file(&cwd)
                .with_context(|| format!("No homelab.yaml found in {}", cwd.display()))?
        }
    };

    let config = ConfigLoader::load_file(&path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    tracing::debug!("Loaded stack {} from {}", config.stack, path.display());
    Ok(config)
}

fn resolve_state_dir(explicit: Option<PathBuf>, config: &Config) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("homelab")
            .join(&config.stack)
    })
}

fn open_store(state_dir: &Path) -> anyhow::Result<Arc<FileStateStore>> {
    Ok(Arc::new(FileStateStore::open(&state_dir.join(STATE_FILE))?))
}

fn ssh_executor(config: &Config, state_dir: &Path) -> anyhow::Result<Arc<RemoteExecutor>> {
    let ssh = SshTransport::new(&config.ssh, state_dir)?;
    let retry = ConnectRetry {
        attempts: config.ssh.connect_attempts,
        ..ConnectRetry::default()
    };
    let transport = RetryingTransport::new(Arc::new(ssh), retry);
    let store: Arc<dyn StateStore> = open_store(state_dir)?;
    Ok(Arc::new(
        RemoteExecutor::new(Arc::new(transport), store).timeout(config.command_timeout),
    ))
}

fn adopt_vms(config: &Config) -> HashMap<String, VmHandle> {
    config
        .nodes
        .iter()
        .map(|n| (n.name.clone(), VmHandle::adopted(n)))
        .collect()
}

async fn bootstrap(
    config: &Config,
    vms: &HashMap<String, VmHandle>,
    executor: &Arc<RemoteExecutor>,
) -> anyhow::Result<BootstrapResult> {
    let orchestrator = BootstrapOrchestrator::new(config);
    let plan = orchestrator.plan(vms)?;
    let scheduler = Scheduler::new(executor.clone(), config.parallelism);
    Ok(orchestrator.run(&plan, &scheduler).await)
}

async fn install_longhorn(
    config: &Config,
    client: &KubeClient,
    store: Arc<dyn StateStore>,
) -> anyhow::Result<()> {
    let report = LonghornInstaller::new(LONGHORN_NAMESPACE, &config.longhorn)
        .install(client, store, config.command_timeout, config.parallelism)
        .await?;
    print_report(&report);
    report.ensure_complete().context("Longhorn installation incomplete")?;
    Ok(())
}

fn print_report(report: &PassReport) {
    for (id, result) in report.iter() {
        match result {
            StepResult::Failed(reason) => println!("{:<10} {}: {}", result.as_str(), id, reason),
            StepResult::Skipped {
                blocked_by: Some(blocker),
            } => println!("{:<10} {} (blocked by {})", result.as_str(), id, blocker),
            _ => println!("{:<10} {}", result.as_str(), id),
        }
    }
}
