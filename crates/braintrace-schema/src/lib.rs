//! Bootstrap configuration for BrainTrace backing services.
//!
//! This crate defines the schema layer: TOML config parsing (`BootstrapConfig`),
//! the validated representation the orchestrator consumes (`NormalizedConfig`,
//! `Dependency`, `ReadinessTarget`, `SpawnCommand`), the startup criticality
//! and severity vocabulary, and the built-in default dependency set.

pub mod config;
pub mod normalize;
pub mod preset;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, BootstrapConfig, ConfigError, DependencySection,
    DetectionSection, ReadinessSection, SpawnSection,
};
pub use normalize::{
    validate_dependency_name, Dependency, DetectionSettings, NormalizedConfig, ReadinessTarget,
    SpawnCommand,
};
pub use preset::{default_config, DEFAULT_CONFIG};
pub use types::{Criticality, Severity};
