//! The `start` command - creates the machine on first use, then starts it.

use super::{coordinator, home};
use crate::GlobalArgs;
use crate::prompt::PromptConsent;
use crate::settings::Settings;
use anyhow::Context;
use clap::Args;
use minikit::{CoordinatorOptions, MachineStore, SshCommandBootstrapper};
use minikit_core::{DriverKind, MachineConfig, MountSpec, NetworkMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_CPUS: u32 = 256;
const MAX_MEMORY_MB: u32 = 1024 * 1024; // 1 TB
const MIN_MEMORY_MB: u32 = 128;

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Driver: none, hyperv, vmware, parallels or vfkit
    #[arg(long, value_parser = parse_driver)]
    driver: Option<DriverKind>,

    /// Number of CPUs (1-256)
    #[arg(long, value_parser = parse_cpus)]
    cpus: Option<u32>,

    /// Memory in MB
    #[arg(long, value_parser = parse_memory)]
    memory: Option<u32>,

    /// Disk size in MB
    #[arg(long, value_parser = parse_disk_size)]
    disk_size: Option<u64>,

    /// Network: nat, shared-vmnet or a backend-specific name
    #[arg(long)]
    network: Option<String>,

    /// Shared directory (format: host:guest), may be repeated
    #[arg(long, value_parser = parse_mount)]
    mount: Vec<MountSpec>,

    /// Boot image to create the machine from
    #[arg(long, value_parser = parse_existing_file)]
    iso: Option<PathBuf>,

    /// Leave the credential file's current context alone
    #[arg(long)]
    keep_context: bool,

    /// Answer yes to privileged prompts
    #[arg(long, short)]
    yes: bool,
}

pub async fn run(global: &GlobalArgs, args: StartArgs) -> anyhow::Result<()> {
    let home = home(global)?;
    let settings = Settings::load(&home)?;
    let store = MachineStore::new(&home);

    let mut coordinator = coordinator(global)?
        .with_consent(Arc::new(PromptConsent::new(args.yes)))
        .with_options(CoordinatorOptions {
            keep_context: args.keep_context || settings.keep_context.unwrap_or(false),
            ..CoordinatorOptions::default()
        });
    if let Some(command) = settings.bootstrap_command.clone() {
        coordinator = coordinator.with_bootstrapper(Arc::new(SshCommandBootstrapper::new(command)));
    }
    #[cfg(target_os = "macos")]
    {
        coordinator = coordinator.with_firewall(Arc::new(minikit_net::SocketFilterFirewall));
    }

    if store.exists(&global.profile) {
        tracing::debug!(machine = %global.profile, "using existing machine, creation flags ignored");
    } else {
        let config = machine_config(&store, &global.profile, &args, &settings)?;
        coordinator
            .create(config)
            .await
            .with_context(|| format!("failed to create {}", global.profile))?;
    }

    let cancel = CancellationToken::new();
    let interrupted = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping the machine");
            interrupted.cancel();
        }
    });

    let ip = coordinator
        .start(&global.profile, &cancel)
        .await
        .with_context(|| format!("failed to start {}", global.profile))?;
    println!("{} is running at {ip}", global.profile);
    Ok(())
}

/// Flags win over `config.toml`, which wins over the built-in defaults.
fn machine_config(
    store: &MachineStore,
    name: &str,
    args: &StartArgs,
    settings: &Settings,
) -> anyhow::Result<MachineConfig> {
    let driver = args
        .driver
        .or(settings.driver)
        .unwrap_or_else(default_driver);
    let mut config = store.new_config(name, driver);

    if let Some(cpus) = args.cpus.or(settings.cpus) {
        config.resources.cpus = cpus;
    }
    if let Some(memory) = args.memory.or(settings.memory) {
        config.resources.memory_mb = memory;
    }
    if let Some(disk) = args.disk_size.or(settings.disk_size) {
        config.resources.disk_mb = disk;
    }
    if let Some(network) = &args.network {
        config.network = network.parse::<NetworkMode>()?;
    } else if let Some(network) = &settings.network {
        config.network = network.clone();
    }
    if let Some(port) = settings.api_server_port {
        config.api_server_port = port;
    }
    config.mounts = args.mount.clone();

    match args.iso.clone().or_else(|| settings.iso.clone()) {
        Some(iso) => config.boot_image.path = iso,
        None if driver != DriverKind::None => {
            anyhow::bail!("--iso is required to create a {driver} machine");
        }
        None => {}
    }
    Ok(config)
}

fn default_driver() -> DriverKind {
    if cfg!(target_os = "macos") {
        DriverKind::Vfkit
    } else if cfg!(windows) {
        DriverKind::Hyperv
    } else {
        DriverKind::None
    }
}

fn parse_driver(s: &str) -> Result<DriverKind, String> {
    s.parse().map_err(|_| {
        let known: Vec<_> = DriverKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown driver '{s}', expected one of: {}", known.join(", "))
    })
}

fn parse_cpus(s: &str) -> Result<u32, String> {
    let cpus: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if cpus == 0 {
        return Err("cpus must be at least 1".to_string());
    }
    if cpus > MAX_CPUS {
        return Err(format!("cpus cannot exceed {MAX_CPUS}"));
    }
    Ok(cpus)
}

fn parse_memory(s: &str) -> Result<u32, String> {
    let memory: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if memory < MIN_MEMORY_MB {
        return Err(format!("memory must be at least {MIN_MEMORY_MB} MB"));
    }
    if memory > MAX_MEMORY_MB {
        return Err(format!("memory cannot exceed {MAX_MEMORY_MB} MB"));
    }
    Ok(memory)
}

fn parse_disk_size(s: &str) -> Result<u64, String> {
    match s.parse::<u64>() {
        Ok(0) => Err("disk size must be non-zero".to_string()),
        Ok(size) => Ok(size),
        Err(_) => Err(format!("'{s}' is not a valid number")),
    }
}

fn parse_mount(s: &str) -> Result<MountSpec, String> {
    MountSpec::parse(s).map_err(|e| e.to_string())
}

fn parse_existing_file(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("file not found: {s}"));
    }
    if !path.is_file() {
        return Err(format!("not a file: {s}"));
    }
    Ok(path)
}
