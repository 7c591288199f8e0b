//! Runtime-resolved engine configuration (SPEC_FULL.md §1.3).
//!
//! The handful of values that can only be known at process start — where
//! the database lives, how often to tick, how big a batch to pull — live
//! here as an explicit struct read from the environment once in `main`,
//! mirroring the teacher's `lazy_static!`-free config style: no global
//! mutable state, just a value threaded through construction.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `DATABASE_URL`. If unset, the engine falls back to an in-process
    /// `MemoryStepStore` for local/dev use (spec.md Non-goals exclude a
    /// persistence schema, but a quick-start path is not a schema).
    pub database_url: Option<String>,

    /// `ENGINE_GROUPS`, comma-separated (e.g. `orders,default,binance`).
    /// Each named group gets its own `Dispatcher` tick loop.
    pub groups: Vec<String>,

    /// `ENGINE_TICK_INTERVAL_SECONDS`.
    pub tick_interval: Duration,

    /// `ENGINE_BATCH_SIZE`.
    pub batch_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            groups: vec!["default".to_string()],
            tick_interval: Duration::from_secs(engine_common::config::DEFAULT_TICK_INTERVAL_SECONDS),
            batch_size: engine_common::config::DEFAULT_BATCH_SIZE,
        }
    }
}

impl EngineConfig {
    /// Reads overrides from the environment, falling back to spec.md
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = Some(url);
            }
        }

        if let Ok(groups) = std::env::var("ENGINE_GROUPS") {
            let parsed: Vec<String> = groups
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                config.groups = parsed;
            }
        }

        if let Ok(secs) = std::env::var("ENGINE_TICK_INTERVAL_SECONDS") {
            if let Ok(secs) = secs.parse::<u64>() {
                config.tick_interval = Duration::from_secs(secs);
            }
        }

        if let Ok(size) = std::env::var("ENGINE_BATCH_SIZE") {
            if let Ok(size) = size.parse::<u32>() {
                config.batch_size = size.min(engine_common::config::MAX_BATCH_SIZE);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = EngineConfig::default();
        assert_eq!(config.groups, vec!["default".to_string()]);
        assert_eq!(
            config.batch_size,
            engine_common::config::DEFAULT_BATCH_SIZE
        );
        assert!(config.database_url.is_none());
    }
}
