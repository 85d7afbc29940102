use crate::output::print_json;
use anyhow::Result;
use std::path::Path;

pub fn run(config_path: &Path, json: bool) -> Result<()> {
    let config = super::load_config(config_path)?;
    let filters: usize = config.rules.values().map(|r| r.filters.len()).sum();

    if json {
        return print_json(&serde_json::json!({
            "name": config.settings.name,
            "collections": config.collections.len(),
            "rules": config.rules.len(),
            "filters": filters,
            "repos": config.repos(),
        }));
    }

    println!(
        "{}: {} collections, {} rules, {} filters",
        config_path.display(),
        config.collections.len(),
        config.rules.len(),
        filters
    );
    Ok(())
}
