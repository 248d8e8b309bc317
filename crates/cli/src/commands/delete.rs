//! The `delete` command - removes the machine and its credential entries.

use super::coordinator;
use crate::GlobalArgs;
use anyhow::Context;

pub async fn run(global: &GlobalArgs) -> anyhow::Result<()> {
    coordinator(global)?
        .remove(&global.profile)
        .await
        .with_context(|| format!("failed to delete {}", global.profile))?;
    println!("{} deleted", global.profile);
    Ok(())
}
