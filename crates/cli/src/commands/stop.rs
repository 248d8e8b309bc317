//! The `stop` and `kill` commands.

use super::coordinator;
use crate::GlobalArgs;
use anyhow::Context;

pub async fn stop(global: &GlobalArgs) -> anyhow::Result<()> {
    coordinator(global)?
        .stop(&global.profile)
        .await
        .with_context(|| format!("failed to stop {}", global.profile))?;
    println!("{} stopped", global.profile);
    Ok(())
}

pub async fn kill(global: &GlobalArgs) -> anyhow::Result<()> {
    coordinator(global)?
        .kill(&global.profile)
        .await
        .with_context(|| format!("failed to kill {}", global.profile))?;
    println!("{} killed", global.profile);
    Ok(())
}
