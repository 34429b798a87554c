//! Recorded transcripts and the collaborators built from them.
//!
//! A transcript is a JSON document of scripted backend responses:
//!
//! ```json
//! {
//!   "responses": { "mock/demo": [ { "text": "done" } ] },
//!   "plain": [ "synthesized answer" ],
//!   "unsupported": [ "mock/plain-only" ]
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use conductor_abstraction::{BackendSelector, ModelResponse};
use conductor_models::ScriptedBackend;
use conductor_orchestrator::orchestration::tool::object_schema;
use conductor_orchestrator::{
    BuiltinTool, ConductorConfig, ContextExternalizer, ToolArguments, ToolDispatchRegistry, ToolHandler,
    ToolOutput,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Selector used when none is given on the command line
pub const DEFAULT_SELECTOR: &str = "mock/demo";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Transcript {
    /// Responses per `provider/model`, returned in order
    pub responses: HashMap<String, Vec<ModelResponse>>,
    /// Answers for plain (tool-less) calls such as synthesis
    pub plain: Vec<String>,
    /// Selectors that report no structured tool call support
    pub unsupported: Vec<String>,
}

impl Transcript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read transcript {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse transcript {}", path.display()))
    }

    /// Build a backend that replays this transcript
    pub fn into_backend(self) -> Result<ScriptedBackend> {
        let mut backend = ScriptedBackend::new().with_estimated_usage();
        for (selector, responses) in self.responses {
            backend = backend.with_responses(&parse_selector(&selector)?, responses);
        }
        for selector in self.unsupported {
            backend = backend.without_tool_support(&parse_selector(&selector)?);
        }
        Ok(self.plain.into_iter().fold(backend, ScriptedBackend::with_plain_response))
    }
}

pub fn parse_selector(value: &str) -> Result<BackendSelector> {
    value.parse().with_context(|| format!("Invalid backend selector '{value}'"))
}

/// Load the configuration file if one was given or exists at the default path
pub fn load_config(path: Option<PathBuf>) -> Result<ConductorConfig> {
    let path = match path {
        Some(path) => path,
        None => match ConductorConfig::default_config_path() {
            Ok(default) if default.exists() => default,
            _ => return Ok(ConductorConfig::default()),
        },
    };
    ConductorConfig::load_from_toml(&path).with_context(|| format!("Failed to load config {}", path.display()))
}

struct ReadFileHandler;

#[async_trait]
impl ToolHandler for ReadFileHandler {
    async fn execute(&self, args: &ToolArguments) -> conductor_orchestrator::Result<ToolOutput> {
        let Some(path) = args.get_string("path") else {
            return Ok(ToolOutput::error("Missing required argument 'path'"));
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(ToolOutput::text(content)),
            Err(e) => Ok(ToolOutput::error(format!("Failed to read {path}: {e}"))),
        }
    }
}

/// Built-in tools available to replayed runs
pub fn registry(config: &ConductorConfig) -> Arc<ToolDispatchRegistry> {
    let read_file = BuiltinTool::new(
        "read_file",
        "Read a text file from the local filesystem",
        object_schema(&[("path", "string", "Path of the file to read", true)]),
        Arc::new(ReadFileHandler),
    );
    Arc::new(ToolDispatchRegistry::new(config.tools.clone()).with_builtin(read_file))
}

pub fn externalizer(config: &ConductorConfig) -> Arc<ContextExternalizer> {
    Arc::new(ContextExternalizer::new(config.context.clone()))
}
