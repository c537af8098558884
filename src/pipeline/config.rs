//! Pipeline configuration from environment variables
//!
//! Read once at process start into a `PipelineConfig` value that is passed to
//! every component constructor. Absent or blank values take the default;
//! unparsable values log a warning and take the default.

use super::assigner::WINDOW_LENGTH_SECS;
use super::late_policy::LatePolicy;
use super::watermark::ALLOWED_LATENESS_SECS;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Output boundary backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBackend {
    Jsonl,
    Sqlite,
}

impl SinkBackend {
    pub fn extension(&self) -> &'static str {
        match self {
            SinkBackend::Jsonl => "jsonl",
            SinkBackend::Sqlite => "db",
        }
    }
}

impl FromStr for SinkBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Ok(SinkBackend::Jsonl),
            "sqlite" => Ok(SinkBackend::Sqlite),
            other => Err(format!("unknown sink backend '{}'", other)),
        }
    }
}

/// Configuration for the pipeline runtime
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Transport root directory
    pub bootstrap: String,

    pub input_topic: String,

    pub output_topic: String,

    /// Position-tracking identity; names the checkpoint file
    pub consumer_group: String,

    /// Worker partitions
    pub parallelism: usize,

    pub snapshot_interval_ms: u64,

    /// Source partitions of the input topic
    pub input_partitions: u32,

    pub snapshot_dir: String,

    pub sink_backend: SinkBackend,

    /// Bounded queue length per worker
    pub channel_buffer: usize,

    pub late_policy: LatePolicy,

    /// Take a checkpoint when stopping instead of abandoning open windows
    pub final_checkpoint_on_stop: bool,

    pub sink_max_retries: u32,
    pub sink_retry_initial_ms: u64,
    pub sink_retry_max_ms: u64,

    pub window_secs: i64,
    pub allowed_lateness_secs: i64,
}

/// Variable names read by earlier deployments of the job, still honoured
/// when the current name is unset
pub const ENV_ALIASES: &[(&str, &str)] = &[
    ("TRANSPORT_BOOTSTRAP", "KAFKA_BOOTSTRAP"),
    ("CONSUMER_GROUP", "FLINK_CONSUMER_GROUP"),
    ("PARALLELISM", "FLINK_PARALLELISM"),
    ("SNAPSHOT_INTERVAL_MS", "FLINK_CHECKPOINT_MS"),
];

fn lookup_one(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn lookup_trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup_one(lookup, name).or_else(|| {
        ENV_ALIASES
            .iter()
            .find(|(current, _)| *current == name)
            .and_then(|(_, alias)| lookup_one(lookup, alias))
    })
}

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn read_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup_trimmed(lookup, name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            log::warn!("⚠️  Invalid {}='{}', using default {:?}", name, raw, default);
            default
        }),
    }
}

fn read_positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug + PartialOrd + Default + Copy,
{
    let value = read_parsed(lookup, name, default);
    if value <= T::default() {
        log::warn!("⚠️  {} must be positive, using default {:?}", name, default);
        return default;
    }
    value
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup_trimmed(lookup, name).map(|v| v.to_ascii_lowercase()) {
        None => default,
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        Some(v) => {
            log::warn!("⚠️  Invalid {}='{}', using default {}", name, v, default);
            default
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TRANSPORT_BOOTSTRAP` or `KAFKA_BOOTSTRAP` (default: data/broker)
    /// - `TOPIC_DEX_EVENTS` (default: dex-events)
    /// - `TOPIC_DEX_ANALYTICS` (default: dex-analytics)
    /// - `CONSUMER_GROUP` or `FLINK_CONSUMER_GROUP` (default: dex-processor)
    /// - `PARALLELISM` or `FLINK_PARALLELISM` (default: 2)
    /// - `SNAPSHOT_INTERVAL_MS` or `FLINK_CHECKPOINT_MS` (default: 10000)
    /// - `INPUT_PARTITIONS` (default: 1)
    /// - `SNAPSHOT_DIR` (default: data/checkpoints)
    /// - `SINK_BACKEND` (default: jsonl)
    /// - `CHANNEL_BUFFER` (default: 10000)
    /// - `LATE_EVENT_POLICY` (default: drop)
    /// - `LATE_REOPEN_RETENTION_SECS` (default: 300)
    /// - `FINAL_CHECKPOINT_ON_STOP` (default: false)
    /// - `SINK_MAX_RETRIES` (default: 5)
    /// - `SINK_RETRY_INITIAL_MS` (default: 100)
    /// - `SINK_RETRY_MAX_MS` (default: 5000)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same parser over an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let retention = read_parsed(&lookup, "LATE_REOPEN_RETENTION_SECS", WINDOW_LENGTH_SECS);
        let late_policy = match lookup_trimmed(&lookup, "LATE_EVENT_POLICY") {
            None => LatePolicy::Drop,
            Some(mode) => LatePolicy::parse(&mode, retention).unwrap_or_else(|| {
                log::warn!("⚠️  Invalid LATE_EVENT_POLICY='{}', using drop", mode);
                LatePolicy::Drop
            }),
        };

        Self {
            bootstrap: read_string(&lookup, "TRANSPORT_BOOTSTRAP", "data/broker"),
            input_topic: read_string(&lookup, "TOPIC_DEX_EVENTS", "dex-events"),
            output_topic: read_string(&lookup, "TOPIC_DEX_ANALYTICS", "dex-analytics"),
            consumer_group: read_string(&lookup, "CONSUMER_GROUP", "dex-processor"),
            parallelism: read_positive(&lookup, "PARALLELISM", 2_usize),
            snapshot_interval_ms: read_positive(&lookup, "SNAPSHOT_INTERVAL_MS", 10_000_u64),
            input_partitions: read_positive(&lookup, "INPUT_PARTITIONS", 1_u32),
            snapshot_dir: read_string(&lookup, "SNAPSHOT_DIR", "data/checkpoints"),
            sink_backend: read_parsed(&lookup, "SINK_BACKEND", SinkBackend::Jsonl),
            channel_buffer: read_positive(&lookup, "CHANNEL_BUFFER", 10_000_usize),
            late_policy,
            final_checkpoint_on_stop: read_bool(&lookup, "FINAL_CHECKPOINT_ON_STOP", false),
            sink_max_retries: read_parsed(&lookup, "SINK_MAX_RETRIES", 5_u32),
            sink_retry_initial_ms: read_positive(&lookup, "SINK_RETRY_INITIAL_MS", 100_u64),
            sink_retry_max_ms: read_positive(&lookup, "SINK_RETRY_MAX_MS", 5_000_u64),
            window_secs: WINDOW_LENGTH_SECS,
            allowed_lateness_secs: ALLOWED_LATENESS_SECS,
        }
    }

    /// Directory holding `partition-<n>.jsonl` input files
    pub fn input_dir(&self) -> PathBuf {
        PathBuf::from(&self.bootstrap).join(&self.input_topic)
    }

    /// Output file for the configured sink backend
    pub fn sink_path(&self) -> PathBuf {
        PathBuf::from(&self.bootstrap)
            .join(format!("{}.{}", self.output_topic, self.sink_backend.extension()))
    }

    pub fn source_partitions(&self) -> Vec<u32> {
        (0..self.input_partitions).collect()
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Configuration:");
        log::info!("   ├─ Bootstrap: {}", self.bootstrap);
        log::info!("   ├─ Input topic: {} ({} partitions)", self.input_topic, self.input_partitions);
        log::info!("   ├─ Output topic: {} ({:?})", self.output_topic, self.sink_backend);
        log::info!("   ├─ Consumer group: {}", self.consumer_group);
        log::info!("   ├─ Parallelism: {}", self.parallelism);
        log::info!("   ├─ Snapshot interval: {}ms -> {}", self.snapshot_interval_ms, self.snapshot_dir);
        log::info!("   ├─ Channel buffer: {}", self.channel_buffer);
        log::info!("   ├─ Window: {}s, allowed lateness {}s", self.window_secs, self.allowed_lateness_secs);
        log::info!("   ├─ Late events: {}", self.late_policy);
        log::info!("   ├─ Final checkpoint on stop: {}", self.final_checkpoint_on_stop);
        log::info!(
            "   └─ Sink retry: {} attempts, {}ms..{}ms",
            self.sink_max_retries,
            self.sink_retry_initial_ms,
            self.sink_retry_max_ms
        );
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.bootstrap, "data/broker");
        assert_eq!(config.input_topic, "dex-events");
        assert_eq!(config.output_topic, "dex-analytics");
        assert_eq!(config.consumer_group, "dex-processor");
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.snapshot_interval_ms, 10_000);
        assert_eq!(config.input_partitions, 1);
        assert_eq!(config.sink_backend, SinkBackend::Jsonl);
        assert_eq!(config.late_policy, LatePolicy::Drop);
        assert!(!config.final_checkpoint_on_stop);
        assert_eq!(config.window_secs, 300);
        assert_eq!(config.allowed_lateness_secs, 30);
    }

    #[test]
    fn test_custom_config() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TRANSPORT_BOOTSTRAP", "/tmp/broker"),
            ("TOPIC_DEX_EVENTS", "swaps"),
            ("PARALLELISM", "8"),
            ("SNAPSHOT_INTERVAL_MS", "2500"),
            ("SINK_BACKEND", "SQLite"),
            ("LATE_EVENT_POLICY", "reopen"),
            ("LATE_REOPEN_RETENTION_SECS", "600"),
            ("FINAL_CHECKPOINT_ON_STOP", "true"),
        ]));

        assert_eq!(config.parallelism, 8);
        assert_eq!(config.snapshot_interval_ms, 2_500);
        assert_eq!(config.sink_backend, SinkBackend::Sqlite);
        assert_eq!(config.late_policy, LatePolicy::Reopen { retention_secs: 600 });
        assert!(config.final_checkpoint_on_stop);
        assert_eq!(config.input_dir(), PathBuf::from("/tmp/broker/swaps"));
        assert_eq!(config.sink_path(), PathBuf::from("/tmp/broker/dex-analytics.db"));
    }

    #[test]
    fn test_blank_and_invalid_values_fall_back() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("TOPIC_DEX_EVENTS", "   "),
            ("PARALLELISM", "0"),
            ("SNAPSHOT_INTERVAL_MS", "soon"),
            ("SINK_BACKEND", "kafka"),
            ("LATE_EVENT_POLICY", "maybe"),
            ("FINAL_CHECKPOINT_ON_STOP", "perhaps"),
        ]));

        assert_eq!(config.input_topic, "dex-events");
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.snapshot_interval_ms, 10_000);
        assert_eq!(config.sink_backend, SinkBackend::Jsonl);
        assert_eq!(config.late_policy, LatePolicy::Drop);
        assert!(!config.final_checkpoint_on_stop);
    }

    #[test]
    fn test_legacy_variable_names_are_honoured() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("KAFKA_BOOTSTRAP", "/srv/broker"),
            ("FLINK_CONSUMER_GROUP", "analytics-v1"),
            ("FLINK_PARALLELISM", "6"),
            ("FLINK_CHECKPOINT_MS", "30000"),
        ]));

        assert_eq!(config.bootstrap, "/srv/broker");
        assert_eq!(config.consumer_group, "analytics-v1");
        assert_eq!(config.parallelism, 6);
        assert_eq!(config.snapshot_interval_ms, 30_000);
    }

    #[test]
    fn test_current_name_wins_over_legacy_name() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("PARALLELISM", "4"),
            ("FLINK_PARALLELISM", "6"),
            ("CONSUMER_GROUP", "  "),
            ("FLINK_CONSUMER_GROUP", "analytics-v1"),
        ]));

        assert_eq!(config.parallelism, 4);
        // Blank current value falls through to the legacy one
        assert_eq!(config.consumer_group, "analytics-v1");
    }

    #[test]
    fn test_source_partitions() {
        let config = PipelineConfig::from_lookup(lookup(&[("INPUT_PARTITIONS", "3")]));
        assert_eq!(config.source_partitions(), vec![0, 1, 2]);
        assert_eq!(config.sink_path(), PathBuf::from("data/broker/dex-analytics.jsonl"));
    }
}
