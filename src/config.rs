//! Engine configuration.
//!
//! Loaded from YAML (every field optional) and overridable from the
//! environment:
//!
//! ```yaml
//! max_recursion_depth: 50
//! capture_backtraces: false
//! lenient_exit_coercion: true
//! max_value_depth: 512
//! ```

use crate::coerce::{CoerceOptions, DEFAULT_MAX_VALUE_DEPTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_MAX_RECURSION_DEPTH: &str = "SWITCHBACK_MAX_RECURSION_DEPTH";
pub const ENV_CAPTURE_BACKTRACES: &str = "SWITCHBACK_CAPTURE_BACKTRACES";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deepest nesting of machine instances before `E_MAX_RECURSION`.
    pub max_recursion_depth: usize,

    /// Force a backtrace into every omen, regardless of `RUST_BACKTRACE`.
    pub capture_backtraces: bool,

    /// Substitute base values for exit payloads that do not match their exemplar.
    pub lenient_exit_coercion: bool,

    /// Nesting ceiling for generic values.
    pub max_value_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: 50,
            capture_backtraces: false,
            lenient_exit_coercion: true,
            max_value_depth: DEFAULT_MAX_VALUE_DEPTH,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(depth) = std::env::var(ENV_MAX_RECURSION_DEPTH)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            self.max_recursion_depth = depth;
        }
        if let Some(capture) = std::env::var(ENV_CAPTURE_BACKTRACES)
            .ok()
            .and_then(|s| parse_flag(&s))
        {
            self.capture_backtraces = capture;
        }
        self
    }

    pub fn input_coercion(&self) -> CoerceOptions {
        CoerceOptions::strict().with_max_value_depth(self.max_value_depth)
    }

    pub fn exit_coercion(&self) -> CoerceOptions {
        CoerceOptions {
            allow_base_fallback: self.lenient_exit_coercion,
            max_value_depth: self.max_value_depth,
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
