use std::path::Path;

use anyhow::Context;
use snap_core::{ExperimentConfig, ResponseCache};

use super::super::args::{CacheArgs, CacheSub};
use crate::exit_codes::SUCCESS;

pub(crate) async fn run(args: CacheArgs) -> anyhow::Result<i32> {
    match args.cmd {
        CacheSub::Purge { config } => {
            let Some(cache) = open(&config)? else {
                return Ok(SUCCESS);
            };
            let removed = cache.purge_expired().await?;
            eprintln!("Purged {removed} expired cache entries");
        }
        CacheSub::Clear { config } => {
            let Some(cache) = open(&config)? else {
                return Ok(SUCCESS);
            };
            let removed = cache.clear().await?;
            eprintln!("Removed {removed} cache entries");
        }
    }
    Ok(SUCCESS)
}

/// The persistent cache named by `config`, if it has one.
fn open(config: &Path) -> anyhow::Result<Option<ResponseCache>> {
    let config = ExperimentConfig::load(config)
        .with_context(|| format!("loading config {}", config.display()))?;
    match (&config.cache.dir, config.cache.enabled) {
        (Some(dir), true) => Ok(Some(ResponseCache::with_dir(dir, config.cache.ttl()))),
        _ => {
            eprintln!("No persistent cache configured; nothing to do");
            Ok(None)
        }
    }
}
