//! Configuration module for the stereo companion daemon
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::{
    AudioConfig, Config, ConfigError, GroupsConfig, IntegrityConfig, MetricsConfig, PlannerConfig,
    StabilityConfig, StorageConfig,
};
