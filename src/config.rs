use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::event_sourcing::strategy::StorageStrategyKind;

// ============================================================================
// Configuration
// ============================================================================
//
// Plain structs with sensible defaults. The binary builds an AppConfig from
// the environment:
//
//   EVENT_STORE_BACKEND            memory | scylla        (memory)
//   EVENT_STORE_BATCH_SIZE         commits per fetch      (100)
//   EVENT_STORE_POLL_INTERVAL_MS   follow-mode poll       (500)
//   EVENT_STORE_STRATEGY           commit | event         (commit)
//   EVENT_STORE_SNAPSHOT_RETENTION latest | historical    (latest)
//   SCYLLA_NODES                   comma separated        (127.0.0.1:9042)
//   SCYLLA_KEYSPACE                                       (event_store)
//   METRICS_PORT                                          (9090)
//
// ============================================================================

/// What happens to older snapshots when a new one is stored.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotRetention {
    /// Keep only the newest snapshot per aggregate.
    #[default]
    LatestOnly,
    /// Keep every snapshot; reads fall back through older ones.
    Historical,
}

impl FromStr for SnapshotRetention {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" | "latest_only" => Ok(SnapshotRetention::LatestOnly),
            "historical" | "all" => Ok(SnapshotRetention::Historical),
            other => anyhow::bail!("unknown snapshot retention '{}'", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum commits fetched per round trip
    pub batch_size: usize,
    /// Delay between polls once a follow stream has caught up
    pub poll_interval: Duration,
    pub storage_strategy: StorageStrategyKind,
    pub snapshot_retention: SnapshotRetention,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            storage_strategy: StorageStrategyKind::DocumentPerCommit,
            snapshot_retention: SnapshotRetention::LatestOnly,
        }
    }
}

impl EngineConfig {
    /// Small batches and fast polling, for tests and interactive demos
    pub fn low_latency() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Large batches and relaxed polling, for catch-up heavy consumers
    pub fn high_throughput() -> Self {
        Self {
            batch_size: 1_000,
            poll_interval: Duration::from_secs(2),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_storage_strategy(mut self, storage_strategy: StorageStrategyKind) -> Self {
        self.storage_strategy = storage_strategy;
        self
    }

    pub fn with_snapshot_retention(mut self, snapshot_retention: SnapshotRetention) -> Self {
        self.snapshot_retention = snapshot_retention;
        self
    }
}

#[derive(Clone, Debug)]
pub struct ScyllaConfig {
    pub known_nodes: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u32,
    /// Longest expected delay between a writer stamping a commit and its
    /// timeline row becoming readable. Readers rescan this far back.
    pub look_back: Duration,
}

impl Default for ScyllaConfig {
    fn default() -> Self {
        Self {
            known_nodes: vec!["127.0.0.1:9042".to_string()],
            keyspace: "event_store".to_string(),
            replication_factor: 1,
            look_back: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Memory,
    Scylla,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(Backend::Memory),
            "scylla" | "scylladb" => Ok(Backend::Scylla),
            other => anyhow::bail!("unknown backend '{}'", other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub backend: Backend,
    pub engine: EngineConfig,
    pub scylla: ScyllaConfig,
    pub metrics_port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            engine: EngineConfig::default(),
            scylla: ScyllaConfig::default(),
            metrics_port: 9090,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(backend) = lookup("EVENT_STORE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(batch_size) = lookup("EVENT_STORE_BATCH_SIZE") {
            let batch_size: usize = batch_size
                .parse()
                .map_err(|e| anyhow::anyhow!("EVENT_STORE_BATCH_SIZE: {}", e))?;
            config.engine = config.engine.with_batch_size(batch_size);
        }
        if let Some(interval) = lookup("EVENT_STORE_POLL_INTERVAL_MS") {
            let millis: u64 = interval
                .parse()
                .map_err(|e| anyhow::anyhow!("EVENT_STORE_POLL_INTERVAL_MS: {}", e))?;
            config.engine = config.engine.with_poll_interval(Duration::from_millis(millis));
        }
        if let Some(strategy) = lookup("EVENT_STORE_STRATEGY") {
            config.engine = config.engine.with_storage_strategy(strategy.parse()?);
        }
        if let Some(retention) = lookup("EVENT_STORE_SNAPSHOT_RETENTION") {
            config.engine = config.engine.with_snapshot_retention(retention.parse()?);
        }
        if let Some(nodes) = lookup("SCYLLA_NODES") {
            config.scylla.known_nodes = nodes
                .split(',')
                .map(str::trim)
                .filter(|node| !node.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(keyspace) = lookup("SCYLLA_KEYSPACE") {
            config.scylla.keyspace = keyspace;
        }
        if let Some(look_back) = lookup("SCYLLA_LOOK_BACK_MS") {
            let millis: u64 = look_back
                .parse()
                .map_err(|e| anyhow::anyhow!("SCYLLA_LOOK_BACK_MS: {}", e))?;
            config.scylla.look_back = Duration::from_millis(millis);
        }
        if let Some(port) = lookup("METRICS_PORT") {
            config.metrics_port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("METRICS_PORT: {}", e))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.engine.batch_size, 100);
        assert_eq!(config.engine.poll_interval, Duration::from_millis(500));
        assert_eq!(config.engine.storage_strategy, StorageStrategyKind::DocumentPerCommit);
        assert_eq!(config.engine.snapshot_retention, SnapshotRetention::LatestOnly);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.scylla.look_back, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = AppConfig::from_lookup(lookup(&[
            ("EVENT_STORE_BACKEND", "scylla"),
            ("EVENT_STORE_BATCH_SIZE", "25"),
            ("EVENT_STORE_POLL_INTERVAL_MS", "50"),
            ("EVENT_STORE_STRATEGY", "event"),
            ("EVENT_STORE_SNAPSHOT_RETENTION", "historical"),
            ("SCYLLA_NODES", "10.0.0.1:9042, 10.0.0.2:9042"),
            ("SCYLLA_KEYSPACE", "ledger"),
            ("SCYLLA_LOOK_BACK_MS", "2000"),
        ]))
        .unwrap();

        assert_eq!(config.backend, Backend::Scylla);
        assert_eq!(config.engine.batch_size, 25);
        assert_eq!(config.engine.poll_interval, Duration::from_millis(50));
        assert_eq!(config.engine.storage_strategy, StorageStrategyKind::DocumentPerEvent);
        assert_eq!(config.engine.snapshot_retention, SnapshotRetention::Historical);
        assert_eq!(config.scylla.known_nodes, vec!["10.0.0.1:9042", "10.0.0.2:9042"]);
        assert_eq!(config.scylla.keyspace, "ledger");
        assert_eq!(config.scylla.look_back, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("EVENT_STORE_BATCH_SIZE", "many")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("EVENT_STORE_BACKEND", "postgres")])).is_err());
    }

    #[test]
    fn test_batch_size_never_zero() {
        assert_eq!(EngineConfig::default().with_batch_size(0).batch_size, 1);
    }
}
