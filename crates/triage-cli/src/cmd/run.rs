use crate::output::{print_json, render_collection};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use super::RuntimeArgs;

pub fn run(config_path: &Path, args: &RuntimeArgs, collection: &str, json: bool) -> Result<()> {
    let scheduler = super::build_scheduler(config_path, args)?;
    let rt = tokio::runtime::Runtime::new()?;

    let result = rt.block_on(async {
        let result = scheduler
            .force_refresh(collection)
            .await
            .with_context(|| format!("failed to refresh '{collection}'"))?;
        if let Err(e) = scheduler.persist().await {
            tracing::error!(error = %e, "failed to save cache");
        }
        Ok::<_, anyhow::Error>(result)
    })?;

    if json {
        return print_json(&*result);
    }
    print!("{}", render_collection(&result, Utc::now()));
    Ok(())
}
