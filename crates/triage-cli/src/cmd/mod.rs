pub mod run;
pub mod serve;
pub mod validate;

use anyhow::{Context, Result};
use clap::Args;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use triage_core::cache::{open_cache, CacheKind};
use triage_core::config::Config;
use triage_core::engine::{Engine, DEFAULT_WORKERS};
use triage_core::provider::{GitHub, DEFAULT_API_URL};
use triage_core::scheduler::{Scheduler, SchedulerConfig};
use triage_core::triage::Triage;

// ---------------------------------------------------------------------------
// Shared runtime flags
// ---------------------------------------------------------------------------

#[derive(Args, Debug, Clone)]
pub struct RuntimeArgs {
    /// Cache backend: memory, disk or sqlite
    #[arg(long, env = "PERSIST_BACKEND", default_value = "disk")]
    pub persist_backend: CacheKind,

    /// Directory for the disk and sqlite caches (default: user cache dir)
    #[arg(long, env = "PERSIST_PATH")]
    pub persist_path: Option<PathBuf>,

    /// GitHub API token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// GitHub API root, for GitHub Enterprise
    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,

    /// Shortest interval between refreshes of a requested collection
    #[arg(long, default_value = "60s", value_parser = parse_interval)]
    pub min_refresh: Duration,

    /// Longest interval between refreshes of any collection
    #[arg(long, default_value = "60m", value_parser = parse_interval)]
    pub max_refresh: Duration,

    /// Concurrent analysis workers per batch
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Only analyse these item numbers, logging every decision about them
    #[arg(long, value_delimiter = ',')]
    pub nums: Vec<u64>,
}

fn parse_interval(raw: &str) -> std::result::Result<Duration, String> {
    triage_core::filter::parse_duration(raw).map_err(|e| e.to_string())
}

impl RuntimeArgs {
    fn cache_file(&self) -> Result<PathBuf> {
        let dir = match &self.persist_path {
            Some(p) => p.clone(),
            None => dirs::cache_dir()
                .context("no user cache directory, pass --persist-path")?
                .join("triage-party"),
        };
        Ok(dir.join(self.persist_backend.file_name()))
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_refresh: self.min_refresh,
            max_refresh: self.max_refresh,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Wire configuration, cache, provider and engine together.
pub fn build_scheduler(config_path: &Path, args: &RuntimeArgs) -> Result<Arc<Scheduler>> {
    let config = load_config(config_path)?;

    let cache_path = match args.persist_backend {
        CacheKind::Memory => PathBuf::new(),
        _ => args.cache_file()?,
    };
    let cache = open_cache(args.persist_backend, &cache_path)
        .with_context(|| format!("failed to open {} cache", args.persist_backend))?;

    if args.github_token.is_none() {
        tracing::warn!("no GitHub token given, requests are heavily rate limited");
    }
    let github = GitHub::with_base_url(&args.github_api_url, args.github_token.clone())
        .context("failed to create GitHub client")?;

    let mut engine_config = config.engine_config();
    engine_config.workers = args.workers;
    engine_config.debug_numbers = args.nums.iter().copied().collect::<HashSet<u64>>();
    let engine = Engine::new(engine_config, cache)
        .context("invalid engine settings")?
        .with_provider(Arc::new(github));

    let triage = Arc::new(Triage::new(Arc::new(engine), config));
    Ok(Arc::new(Scheduler::new(triage, args.scheduler_config())))
}
