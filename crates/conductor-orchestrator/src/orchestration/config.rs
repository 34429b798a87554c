// Orchestration configuration
//
// Safety rails for runs, tool dispatch limits, context externalization and
// fan-out session limits. Every field has a default and can be overridden per
// instance or loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestrationError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Run Controller safety rails
    pub run: RunConfig,
    /// Tool dispatch limits
    pub tools: ToolDispatchConfig,
    /// Context externalization
    pub context: ContextConfig,
    /// Fan-out and comparison sessions
    pub fan_out: FanOutConfig,
}

impl ConductorConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load_from_toml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            OrchestrationError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml_str(&content)
    }

    /// Load configuration from TOML string
    ///
    /// Accepts either a bare document or one nested under a `[conductor]` section.
    ///
    /// # Errors
    /// Returns error if TOML cannot be parsed
    pub fn from_toml_str(toml_content: &str) -> Result<Self> {
        let toml: toml::Value = toml::from_str(toml_content)
            .map_err(|e| OrchestrationError::Config(format!("Failed to parse TOML: {}", e)))?;

        let config_value = match toml.get("conductor") {
            Some(section) => section.clone(),
            None => toml,
        };

        config_value.try_into().map_err(|e: toml::de::Error| {
            OrchestrationError::Config(format!("Failed to deserialize configuration: {}", e))
        })
    }

    /// Save configuration to a TOML file under a `[conductor]` section
    ///
    /// # Errors
    /// Returns error if file cannot be written
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        #[derive(Serialize)]
        struct ConfigWrapper<'a> {
            conductor: &'a ConductorConfig,
        }

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml_string = toml::to_string_pretty(&ConfigWrapper { conductor: self })
            .map_err(|e| OrchestrationError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| OrchestrationError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.conductor/conductor.toml`
    ///
    /// # Errors
    /// Returns error if `HOME` is not set
    pub fn default_config_path() -> Result<PathBuf> {
        let home = std::env::var("HOME")
            .map_err(|_| OrchestrationError::Config("HOME environment variable not set".into()))?;
        Ok(PathBuf::from(home).join(".conductor").join("conductor.toml"))
    }

    /// Replace the run section
    #[must_use]
    pub fn with_run(mut self, run: RunConfig) -> Self {
        self.run = run;
        self
    }

    /// Replace the tool dispatch section
    #[must_use]
    pub fn with_tools(mut self, tools: ToolDispatchConfig) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the context section
    #[must_use]
    pub fn with_context(mut self, context: ContextConfig) -> Self {
        self.context = context;
        self
    }

    /// Replace the fan-out section
    #[must_use]
    pub fn with_fan_out(mut self, fan_out: FanOutConfig) -> Self {
        self.fan_out = fan_out;
        self
    }
}

/// Safety rails for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum loop iterations
    pub max_steps: usize,
    /// Cumulative input+output token budget
    pub max_tokens: u64,
    /// Wall-clock limit for the entire run
    pub run_timeout_seconds: u64,
    /// Append a rolling progress summary from step 2 onward
    pub progress_recitation: bool,
    /// Send full error text back to the model instead of a truncated form
    pub preserve_full_errors: bool,
    /// Length of the truncated error form
    pub truncated_error_chars: usize,
    /// Fail before the first step when no tool is available
    pub require_tools: bool,
    /// Sampling temperature passed to the backend
    pub temperature: Option<f32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_tokens: 50_000,
            run_timeout_seconds: 120,
            progress_recitation: true,
            preserve_full_errors: true,
            truncated_error_chars: 500,
            require_tools: true,
            temperature: None,
        }
    }
}

impl RunConfig {
    /// Total run timeout
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }

    /// Set max steps
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Set the token budget
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the run timeout
    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Enable or disable progress recitation
    #[must_use]
    pub fn with_progress_recitation(mut self, enabled: bool) -> Self {
        self.progress_recitation = enabled;
        self
    }

    /// Enable or disable full error preservation
    #[must_use]
    pub fn with_preserve_full_errors(mut self, enabled: bool) -> Self {
        self.preserve_full_errors = enabled;
        self
    }

    /// Require at least one tool before starting
    #[must_use]
    pub fn with_require_tools(mut self, required: bool) -> Self {
        self.require_tools = required;
        self
    }
}

/// Tool dispatch limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolDispatchConfig {
    /// Per-call timeout in milliseconds
    pub timeout_millis: u64,
    /// Successful results longer than this are truncated
    pub max_result_chars: usize,
}

impl Default for ToolDispatchConfig {
    fn default() -> Self {
        Self { timeout_millis: 15_000, max_result_chars: 30_000 }
    }
}

impl ToolDispatchConfig {
    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the result size cap
    #[must_use]
    pub fn with_max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = max;
        self
    }
}

/// Context externalization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Results longer than this are written to storage
    pub threshold_chars: usize,
    /// Directory externalized content is written under
    pub storage_root: PathBuf,
    /// Length of the inline preview
    pub preview_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            threshold_chars: 2_000,
            storage_root: std::env::temp_dir().join("conductor-context"),
            preview_chars: 500,
        }
    }
}

impl ContextConfig {
    /// Set the storage root
    #[must_use]
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = root.into();
        self
    }

    /// Set the externalization threshold
    #[must_use]
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold_chars = threshold;
        self
    }
}

/// Fan-out and comparison session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Maximum concurrently active sessions
    pub max_concurrent_sessions: usize,
    /// Start delay increment between runs sharing a backend selector
    pub stagger_millis: u64,
    /// Subtask title limit inside the fenced preamble
    pub max_title_chars: usize,
    /// Subtask description limit inside the fenced preamble
    pub max_description_chars: usize,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 2,
            stagger_millis: 500,
            max_title_chars: 200,
            max_description_chars: 2_000,
        }
    }
}

impl FanOutConfig {
    /// Stagger increment
    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_millis)
    }

    /// Set the session cap
    #[must_use]
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Set the stagger increment
    #[must_use]
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger_millis = u64::try_from(stagger.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
