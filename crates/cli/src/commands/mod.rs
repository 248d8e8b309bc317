pub mod delete;
pub mod drivers;
pub mod start;
pub mod status;
pub mod stop;
pub mod version;

use crate::GlobalArgs;
use anyhow::Context;
use minikit::{Coordinator, MachineStore};
use minikit_kubeconfig::KubeconfigStore;
use std::path::PathBuf;

pub fn home(global: &GlobalArgs) -> anyhow::Result<PathBuf> {
    match &global.home {
        Some(home) => Ok(home.clone()),
        None => Ok(minikit::machine::default_base()?),
    }
}

/// Coordinator with the defaults every command shares; `start` layers its
/// own seams on top.
pub fn coordinator(global: &GlobalArgs) -> anyhow::Result<Coordinator> {
    let store = MachineStore::new(home(global)?);
    let kubeconfig = KubeconfigStore::from_env().context("failed to locate the credential file")?;
    Ok(Coordinator::new(store, kubeconfig))
}
