//! Merge rules: defaults, override order, conflict handling.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
///
/// Only keys that other layers commonly override are seeded here; everything else falls back to
/// the serde defaults on the config structs.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("limits.max_files", 10)?
        .set_default("limits.max_file_size", 25 * 1024 * 1024)?
        .set_default("checkpoints.max_auto", 200)?
        .set_default("checkpoints.max_manual", 50)?
        .set_default("retry.max_attempts", 3)?
        .set_default("egress.allowed_hosts", vec!["api.openai.com"])
}
