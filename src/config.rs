//! Node and job configuration.
//!
//! Both configs deserialize with `serde` and fill missing fields with
//! defaults. [`InstanceConfig::from_env`] and [`JobConfig::from_env`]
//! apply `FLOWCORE_*` environment overrides on top of the defaults.

use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::ExecutionError;

/// Number of partitions keys are hashed into.
pub const DEFAULT_PARTITION_COUNT: usize = 271;

/// Delivery guarantee of a job across a restart.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingGuarantee {
    /// No snapshots are taken.
    None,
    /// Barriers are not aligned. Items after a barrier can be
    /// processed before the snapshot, and replayed after a restart.
    AtLeastOnce,
    #[default]
    ExactlyOnce,
}

impl FromStr for ProcessingGuarantee {
    type Err = ExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "at_least_once" | "at-least-once" => Ok(Self::AtLeastOnce),
            "exactly_once" | "exactly-once" => Ok(Self::ExactlyOnce),
            other => Err(ExecutionError::Config(format!(
                "unknown processing guarantee {other:?}"
            ))),
        }
    }
}

/// Settings of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Worker threads shared by cooperative tasklets.
    pub cooperative_thread_count: usize,
    /// Capacity of every local queue between two tasklets.
    pub queue_size: usize,
    /// How many snapshot entries a processor can write before the
    /// tasklet flushes them to the store.
    pub snapshot_bucket_capacity: usize,
    /// Longest a worker sleeps when none of its tasklets made
    /// progress.
    pub max_park_micros: u64,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            cooperative_thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_size: 1024,
            snapshot_bucket_capacity: 256,
            max_park_micros: 1000,
        }
    }
}

impl InstanceConfig {
    /// Defaults with `FLOWCORE_COOPERATIVE_THREAD_COUNT`,
    /// `FLOWCORE_QUEUE_SIZE`, `FLOWCORE_SNAPSHOT_BUCKET_CAPACITY` and
    /// `FLOWCORE_MAX_PARK_MICROS` applied.
    pub fn from_env() -> Result<Self, ExecutionError> {
        let mut config = Self::default();
        if let Some(n) = env_var("FLOWCORE_COOPERATIVE_THREAD_COUNT")? {
            config.cooperative_thread_count = n;
        }
        if let Some(n) = env_var("FLOWCORE_QUEUE_SIZE")? {
            config.queue_size = n;
        }
        if let Some(n) = env_var("FLOWCORE_SNAPSHOT_BUCKET_CAPACITY")? {
            config.snapshot_bucket_capacity = n;
        }
        if let Some(n) = env_var("FLOWCORE_MAX_PARK_MICROS")? {
            config.max_park_micros = n;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExecutionError> {
        if self.cooperative_thread_count == 0 {
            return Err(ExecutionError::Config(
                "cooperative_thread_count must be at least 1".into(),
            ));
        }
        if self.queue_size == 0 || self.snapshot_bucket_capacity == 0 {
            return Err(ExecutionError::Config(
                "queue and bucket capacities must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Settings of one job, shared by all its executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub snapshot_interval_millis: u64,
    pub processing_guarantee: ProcessingGuarantee,
    pub partition_count: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_millis: 10_000,
            processing_guarantee: ProcessingGuarantee::default(),
            partition_count: DEFAULT_PARTITION_COUNT,
        }
    }
}

impl JobConfig {
    /// Defaults with `FLOWCORE_SNAPSHOT_INTERVAL_MILLIS`,
    /// `FLOWCORE_PROCESSING_GUARANTEE` and `FLOWCORE_PARTITION_COUNT`
    /// applied.
    pub fn from_env() -> Result<Self, ExecutionError> {
        let mut config = Self::default();
        if let Some(n) = env_var("FLOWCORE_SNAPSHOT_INTERVAL_MILLIS")? {
            config.snapshot_interval_millis = n;
        }
        if let Some(guarantee) = env_var("FLOWCORE_PROCESSING_GUARANTEE")? {
            config.processing_guarantee = guarantee;
        }
        if let Some(n) = env_var("FLOWCORE_PARTITION_COUNT")? {
            config.partition_count = n;
        }
        if config.partition_count == 0 {
            return Err(ExecutionError::Config(
                "partition_count must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.processing_guarantee != ProcessingGuarantee::None
    }
}

pub(crate) fn env_var<T>(name: &str) -> Result<Option<T>, ExecutionError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err| ExecutionError::Config(format!("unable to parse {name}={raw:?}: {err}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(ExecutionError::Config(format!("{name}: {err}"))),
    }
}

#[test]
fn missing_fields_use_defaults() {
    let config: JobConfig =
        serde_json::from_str(r#"{"processing_guarantee": "AtLeastOnce"}"#).unwrap();
    assert_eq!(config.processing_guarantee, ProcessingGuarantee::AtLeastOnce);
    assert_eq!(config.partition_count, DEFAULT_PARTITION_COUNT);
    assert!(config.snapshots_enabled());

    let config: InstanceConfig = serde_json::from_str(r#"{"queue_size": 8}"#).unwrap();
    assert_eq!(config.queue_size, 8);
    assert!(config.validate().is_ok());
}

#[test]
fn guarantee_parses() {
    assert_eq!(
        "exactly-once".parse::<ProcessingGuarantee>().unwrap(),
        ProcessingGuarantee::ExactlyOnce
    );
    assert!(matches!(
        "twice".parse::<ProcessingGuarantee>(),
        Err(ExecutionError::Config(_))
    ));
}

#[test]
fn zero_threads_is_rejected() {
    let config = InstanceConfig {
        cooperative_thread_count: 0,
        ..InstanceConfig::default()
    };
    assert!(config.validate().is_err());
}
