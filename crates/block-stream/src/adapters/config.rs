//! Configuration providers.
//!
//! - `StaticConfigProvider` - In-memory configuration for tests and embedding
//! - `JsonFileConfigProvider` - `block-nodes.json` loading with reload support

use parking_lot::RwLock;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::domain::{
    validate_block_nodes, BlockBufferConfig, BlockNodeConfiguration, BlockNodeConnectionConfig,
};
use crate::events::ConfigError;
use crate::ports::outbound::ConfigProvider;

/// File name looked up in the configuration directory.
pub const BLOCK_NODES_FILE_NAME: &str = "block-nodes.json";

// ============================================================================
// StaticConfigProvider
// ============================================================================

#[derive(Clone, Debug, Default)]
struct Snapshot {
    nodes: Vec<BlockNodeConfiguration>,
    connection: BlockNodeConnectionConfig,
    buffer: BlockBufferConfig,
}

/// Configuration held in memory. The peer list can be replaced at runtime.
#[derive(Debug, Default)]
pub struct StaticConfigProvider {
    snapshot: RwLock<Snapshot>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(nodes: Vec<BlockNodeConfiguration>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot {
                nodes: nodes.into_iter().map(BlockNodeConfiguration::normalized).collect(),
                ..Snapshot::default()
            }),
        }
    }

    #[must_use]
    pub fn with_connection_config(self, config: BlockNodeConnectionConfig) -> Self {
        self.snapshot.write().connection = config;
        self
    }

    #[must_use]
    pub fn with_buffer_config(self, config: BlockBufferConfig) -> Self {
        self.snapshot.write().buffer = config;
        self
    }

    pub fn set_block_nodes(&self, nodes: Vec<BlockNodeConfiguration>) {
        self.snapshot.write().nodes =
            nodes.into_iter().map(BlockNodeConfiguration::normalized).collect();
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn block_nodes(&self) -> Vec<BlockNodeConfiguration> {
        self.snapshot.read().nodes.clone()
    }

    fn connection_config(&self) -> BlockNodeConnectionConfig {
        self.snapshot.read().connection.clone()
    }

    fn buffer_config(&self) -> BlockBufferConfig {
        self.snapshot.read().buffer.clone()
    }
}

// ============================================================================
// JsonFileConfigProvider
// ============================================================================

/// On-disk shape of `block-nodes.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockNodesFile {
    nodes: Vec<BlockNodeConfiguration>,
    #[serde(default)]
    connection: ConnectionSettings,
    #[serde(default)]
    buffer: BufferSettings,
}

/// Optional overrides of [`BlockNodeConnectionConfig`]; durations in
/// milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct ConnectionSettings {
    stream_reset_period_ms: Option<u64>,
    pipeline_operation_timeout_ms: Option<u64>,
    connection_timeout_ms: Option<u64>,
    worker_loop_sleep_ms: Option<u64>,
    max_request_delay_ms: Option<u64>,
    request_padding_bytes: Option<usize>,
    item_padding_bytes: Option<usize>,
    max_end_of_streams_allowed: Option<usize>,
    end_of_stream_time_frame_ms: Option<u64>,
    end_of_stream_schedule_delay_ms: Option<u64>,
    high_latency_threshold_ms: Option<u64>,
    high_latency_events_before_switching: Option<u32>,
    max_backoff_delay_ms: Option<u64>,
    backoff_reset_time_frame_ms: Option<u64>,
    forced_switch_reschedule_delay_ms: Option<u64>,
    failure_reschedule_delay_ms: Option<u64>,
    quorum_threshold: Option<usize>,
}

impl ConnectionSettings {
    fn apply(self, mut config: BlockNodeConnectionConfig) -> BlockNodeConnectionConfig {
        fn ms(target: &mut Duration, value: Option<u64>) {
            if let Some(value) = value {
                *target = Duration::from_millis(value);
            }
        }
        fn set<T>(target: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *target = value;
            }
        }

        ms(&mut config.stream_reset_period, self.stream_reset_period_ms);
        ms(&mut config.pipeline_operation_timeout, self.pipeline_operation_timeout_ms);
        ms(&mut config.connection_timeout, self.connection_timeout_ms);
        ms(&mut config.worker_loop_sleep, self.worker_loop_sleep_ms);
        ms(&mut config.max_request_delay, self.max_request_delay_ms);
        set(&mut config.request_padding_bytes, self.request_padding_bytes);
        set(&mut config.item_padding_bytes, self.item_padding_bytes);
        set(&mut config.max_end_of_streams_allowed, self.max_end_of_streams_allowed);
        ms(&mut config.end_of_stream_time_frame, self.end_of_stream_time_frame_ms);
        ms(&mut config.end_of_stream_schedule_delay, self.end_of_stream_schedule_delay_ms);
        ms(&mut config.high_latency_threshold, self.high_latency_threshold_ms);
        set(
            &mut config.high_latency_events_before_switching,
            self.high_latency_events_before_switching,
        );
        ms(&mut config.max_backoff_delay, self.max_backoff_delay_ms);
        ms(&mut config.backoff_reset_time_frame, self.backoff_reset_time_frame_ms);
        ms(
            &mut config.forced_switch_reschedule_delay,
            self.forced_switch_reschedule_delay_ms,
        );
        ms(&mut config.failure_reschedule_delay, self.failure_reschedule_delay_ms);
        set(&mut config.quorum_threshold, self.quorum_threshold);
        config
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
struct BufferSettings {
    max_buffered_blocks: Option<usize>,
    action_stage_threshold: Option<f64>,
    action_grace_period_ms: Option<u64>,
    recovery_threshold: Option<f64>,
}

impl BufferSettings {
    fn apply(self, mut config: BlockBufferConfig) -> Result<BlockBufferConfig, ConfigError> {
        if let Some(max) = self.max_buffered_blocks {
            if max == 0 {
                return Err(ConfigError::Invalid(
                    "max buffered blocks must be at least 1".into(),
                ));
            }
            config.max_buffered_blocks = max;
        }
        for (name, value) in [
            ("action stage threshold", self.action_stage_threshold),
            ("recovery threshold", self.recovery_threshold),
        ] {
            if value.is_some_and(|percent| !(0.0..=100.0).contains(&percent)) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 100 percent"
                )));
            }
        }
        if let Some(threshold) = self.action_stage_threshold {
            config.action_stage_threshold = threshold;
        }
        if let Some(threshold) = self.recovery_threshold {
            config.recovery_threshold = threshold;
        }
        if let Some(ms) = self.action_grace_period_ms {
            config.action_grace_period = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

/// Reads `block-nodes.json` from a configuration directory.
///
/// The last successfully loaded snapshot is served until a reload succeeds.
#[derive(Debug)]
pub struct JsonFileConfigProvider {
    path: PathBuf,
    snapshot: RwLock<Snapshot>,
}

impl JsonFileConfigProvider {
    /// Loads `block-nodes.json` from `directory`.
    pub fn load(directory: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = directory.as_ref().join(BLOCK_NODES_FILE_NAME);
        let snapshot = Self::read(&path)?;
        info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            "Loaded block node configuration"
        );
        Ok(Self {
            path,
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file. Returns whether the peer list changed.
    ///
    /// On error the previous snapshot stays in effect.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let snapshot = match Self::read(&self.path) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(path = %self.path.display(), %error, "Keeping previous block node configuration");
                return Err(error);
            }
        };
        let mut current = self.snapshot.write();
        let changed = current.nodes != snapshot.nodes;
        *current = snapshot;
        if changed {
            info!(nodes = current.nodes.len(), "Block node list changed");
        }
        Ok(changed)
    }

    fn read(path: &Path) -> Result<Snapshot, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: BlockNodesFile = serde_json::from_str(&text)?;

        let nodes = validate_block_nodes(file.nodes)?;
        let connection = file.connection.apply(BlockNodeConnectionConfig::default());
        if connection.quorum_threshold == 0 {
            return Err(ConfigError::Invalid(
                "quorum threshold must be at least 1".into(),
            ));
        }
        let buffer = file.buffer.apply(BlockBufferConfig::default())?;

        Ok(Snapshot {
            nodes,
            connection,
            buffer,
        })
    }
}

impl ConfigProvider for JsonFileConfigProvider {
    fn block_nodes(&self) -> Vec<BlockNodeConfiguration> {
        self.snapshot.read().nodes.clone()
    }

    fn connection_config(&self) -> BlockNodeConnectionConfig {
        self.snapshot.read().connection.clone()
    }

    fn buffer_config(&self) -> BlockBufferConfig {
        self.snapshot.read().buffer.clone()
    }
}
