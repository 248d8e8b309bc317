//! Machine queries (`status`, `ip`) and `update-context`.

use super::coordinator;
use crate::GlobalArgs;
use anyhow::Context;

pub async fn status(global: &GlobalArgs) -> anyhow::Result<()> {
    let state = coordinator(global)?.status(&global.profile).await?;
    println!("{state}");
    Ok(())
}

pub async fn ip(global: &GlobalArgs) -> anyhow::Result<()> {
    let ip = coordinator(global)?
        .ip(&global.profile)
        .await
        .with_context(|| format!("failed to get the address of {}", global.profile))?;
    println!("{ip}");
    Ok(())
}

pub async fn update_context(global: &GlobalArgs) -> anyhow::Result<()> {
    let ip = coordinator(global)?
        .update_context(&global.profile)
        .await
        .context("failed to update the credential file")?;
    println!("{} now points at {ip}", global.profile);
    Ok(())
}
