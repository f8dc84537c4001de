//! Job configuration.
//!
//! Provides `JobConfig` (top-level settings), one sub-config per subsystem,
//! `JobPaths` for the default job-file location, and TOML persistence via
//! `JobConfig::load_from` / `JobConfig::save_to`.

pub mod paths;
pub mod settings;

pub use paths::JobPaths;
pub use settings::{
    ConfigError, DecoderChoice, EndpointConfig, JobConfig, OutputConfig, SamplingConfig,
    SchedulerConfig, StoreConfig, ThrottleConfig,
};
