//! Default location of the job file, resolved with the `dirs` crate.
//!
//!   Windows: %APPDATA%\batch-captioner\job.toml
//!   macOS:   ~/Library/Application Support/batch-captioner/job.toml
//!   Linux:   ~/.config/batch-captioner/job.toml

use std::path::PathBuf;

/// Resolved directory/file paths for the job configuration.
#[derive(Debug, Clone)]
pub struct JobPaths {
    pub config_dir: PathBuf,
    /// Full path to `job.toml`.
    pub config_file: PathBuf,
}

impl JobPaths {
    const APP_NAME: &'static str = "batch-captioner";

    /// Falls back to the current directory if the platform has no config dir.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);
        let config_file = config_dir.join("job.toml");

        Self {
            config_dir,
            config_file,
        }
    }
}

impl Default for JobPaths {
    fn default() -> Self {
        Self::new()
    }
}
