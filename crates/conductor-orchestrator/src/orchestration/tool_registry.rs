//! Tool dispatch registry
//!
//! Unifies statically registered built-in tools with tools discovered from an
//! external tool provider behind one name-indexed surface. The external map is
//! re-pulled by [`ToolDispatchRegistry::refresh`] and published as an immutable
//! snapshot, so a run that captured a [`ToolSnapshot`] never observes a later
//! refresh.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

use super::config::ToolDispatchConfig;
use super::execution::{execute_tool_call, execute_tool_calls};
use super::tool::{BuiltinTool, ToolCall, ToolDefinition, ToolResult};
use crate::error::Result;

/// A tool advertised by an external provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalToolInfo {
    /// Provider (server/connection) identity
    pub provider_id: String,
    /// Tool name as the provider knows it
    pub tool_name: String,
    /// Optional description
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of accepted arguments
    #[serde(default)]
    pub input_schema: Value,
}

/// Outcome of an external invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalInvocation {
    /// Tool produced a payload
    Output(Value),
    /// Tool reported its own logical error
    Error(String),
}

/// External tool provider collaborator (e.g. a pool of MCP connections)
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// List every tool currently offered by connected providers
    async fn list_external_tools(&self) -> Result<Vec<ExternalToolInfo>>;

    /// Invoke one external tool
    async fn invoke(
        &self,
        provider_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<ExternalInvocation>;
}

/// Advertised name mapped to its provider route
#[derive(Debug, Clone)]
pub(crate) struct ExternalRoute {
    pub(crate) provider_id: String,
    pub(crate) tool_name: String,
    pub(crate) definition: ToolDefinition,
}

/// How a call name resolved
pub(crate) enum ResolvedTool<'a> {
    Builtin(&'a BuiltinTool),
    External(&'a ExternalRoute),
}

/// Immutable view of the registry used for one run
#[derive(Clone)]
pub struct ToolSnapshot {
    builtins: Arc<Vec<BuiltinTool>>,
    external: Arc<Vec<ExternalRoute>>,
    provider: Option<Arc<dyn ToolProvider>>,
    config: ToolDispatchConfig,
}

impl ToolSnapshot {
    /// Definitions to advertise to the model, built-ins first
    pub fn list_available(&self) -> Vec<ToolDefinition> {
        self.builtins
            .iter()
            .map(|tool| tool.definition.clone())
            .chain(self.external.iter().map(|route| route.definition.clone()))
            .collect()
    }

    /// Advertised names, built-ins first
    pub fn names(&self) -> Vec<String> {
        self.builtins
            .iter()
            .map(|tool| tool.name().to_string())
            .chain(self.external.iter().map(|route| route.definition.name.clone()))
            .collect()
    }

    /// Whether no tool is available at all
    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty() && self.external.is_empty()
    }

    /// Number of available tools
    pub fn len(&self) -> usize {
        self.builtins.len() + self.external.len()
    }

    /// Execute one call with timeout and result capping
    pub async fn execute_one(&self, call: &ToolCall) -> ToolResult {
        execute_tool_call(self, call).await
    }

    /// Execute calls concurrently; results follow input order
    pub async fn execute_many(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        execute_tool_calls(self, calls).await
    }

    pub(crate) fn config(&self) -> &ToolDispatchConfig {
        &self.config
    }

    pub(crate) fn provider(&self) -> Option<&Arc<dyn ToolProvider>> {
        self.provider.as_ref()
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<ResolvedTool<'_>> {
        if let Some(tool) = self.builtins.iter().find(|t| t.name() == name) {
            return Some(ResolvedTool::Builtin(tool));
        }
        self.external
            .iter()
            .find(|route| route.definition.name == name)
            .map(ResolvedTool::External)
    }
}

impl std::fmt::Debug for ToolSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSnapshot")
            .field("tools", &self.names())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Registry combining built-in and external tools
pub struct ToolDispatchRegistry {
    builtins: Arc<Vec<BuiltinTool>>,
    provider: Option<Arc<dyn ToolProvider>>,
    external: RwLock<Arc<Vec<ExternalRoute>>>,
    config: ToolDispatchConfig,
}

impl ToolDispatchRegistry {
    /// Create an empty registry
    pub fn new(config: ToolDispatchConfig) -> Self {
        Self {
            builtins: Arc::new(Vec::new()),
            provider: None,
            external: RwLock::new(Arc::new(Vec::new())),
            config,
        }
    }

    /// Attach the external tool provider
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Register a built-in tool, replacing any built-in with the same name
    pub fn register(&mut self, tool: BuiltinTool) {
        let builtins = Arc::make_mut(&mut self.builtins);
        if let Some(existing) = builtins.iter_mut().find(|t| t.name() == tool.name()) {
            debug!(tool = %tool.name(), "Replacing built-in tool");
            *existing = tool;
        } else {
            builtins.push(tool);
        }
    }

    /// Register a built-in tool (builder form)
    #[must_use]
    pub fn with_builtin(mut self, tool: BuiltinTool) -> Self {
        self.register(tool);
        self
    }

    /// Re-pull the external tool map from the provider
    ///
    /// Returns the number of external tools now available. A provider failure
    /// leaves no external tools rather than a stale map.
    pub async fn refresh(&self) -> usize {
        let Some(provider) = self.provider.as_ref() else {
            return 0;
        };

        let discovered = match provider.list_external_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(error = %e, "Failed to list external tools; continuing without them");
                Vec::new()
            }
        };

        let routes = self.build_routes(discovered);
        let count = routes.len();
        *self.external.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(routes);
        info!(external_tools = count, builtin_tools = self.builtins.len(), "Tool registry refreshed");
        count
    }

    /// Capture the current view for a run
    pub fn snapshot(&self) -> ToolSnapshot {
        ToolSnapshot {
            builtins: Arc::clone(&self.builtins),
            external: Arc::clone(&*self.external.read().unwrap_or_else(PoisonError::into_inner)),
            provider: self.provider.clone(),
            config: self.config.clone(),
        }
    }

    /// Definitions to advertise, built-ins first
    pub fn list_available(&self) -> Vec<ToolDefinition> {
        self.snapshot().list_available()
    }

    /// Execute one call against the current view
    pub async fn execute_one(&self, call: &ToolCall) -> ToolResult {
        self.snapshot().execute_one(call).await
    }

    /// Execute calls concurrently against the current view
    pub async fn execute_many(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        self.snapshot().execute_many(calls).await
    }

    fn build_routes(&self, discovered: Vec<ExternalToolInfo>) -> Vec<ExternalRoute> {
        let mut taken: HashSet<String> =
            self.builtins.iter().map(|tool| tool.name().to_string()).collect();
        let mut routes = Vec::with_capacity(discovered.len());

        for info in discovered {
            let mut name = info.tool_name.clone();
            if taken.contains(&name) {
                name = format!("{}__{}", info.provider_id, info.tool_name);
                if taken.contains(&name) {
                    warn!(
                        provider = %info.provider_id,
                        tool = %info.tool_name,
                        "Duplicate external tool skipped"
                    );
                    continue;
                }
                debug!(tool = %info.tool_name, advertised = %name, "External tool name qualified");
            }
            taken.insert(name.clone());

            let description = info
                .description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| format!("Tool '{}' from {}", info.tool_name, info.provider_id));
            let input_schema = if info.input_schema.is_null() {
                serde_json::json!({ "type": "object", "properties": {} })
            } else {
                info.input_schema
            };

            routes.push(ExternalRoute {
                provider_id: info.provider_id,
                tool_name: info.tool_name,
                definition: ToolDefinition::new(name, description, input_schema),
            });
        }

        routes
    }
}

impl std::fmt::Debug for ToolDispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatchRegistry")
            .field("builtins", &self.builtins.len())
            .field("has_provider", &self.provider.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
