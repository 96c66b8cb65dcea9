//! Configuration: typed schema, defaults, env overrides and atomic saves.
//!
//! CLI flag plumbing and the on-disk YAML/TOML file format itself are out of
//! scope; this module owns the *typed* configuration the rest of the crate
//! is built on.

pub mod loader;
pub mod schema;

pub use loader::{apply_env_overrides, load_config, load_default_config, save_config};
pub use schema::{
    AgentConfig, AppConfig, BackendConfig, CacheConfig, LoggingConfig, MemoryConfig,
    PermissionConfig, PermissionMode,
};
