//! Live tool instances, resource claims, and validated dispatch

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::{DispatchPriority, ToolAdapter, ToolCallRequest, ToolCallResult, ToolFactory};
use crate::config::ModuleConfig;
use crate::registry::{FactoryRegistry, ModuleKind};
use crate::error::panic_message;
use crate::{Error, Result};

struct LiveTool {
    adapter: Arc<dyn ToolAdapter>,
    resources: Vec<String>,
}

/// Owns tool factories, live adapters, and the resource claim table
pub struct ToolRegistry {
    factories: FactoryRegistry<dyn ToolFactory>,
    live: RwLock<HashMap<String, LiveTool>>,
    /// Resource id → holding instance. Held for the whole of `create`.
    claims: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("factories", &self.factories)
            .finish_non_exhaustive()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: FactoryRegistry::new(ModuleKind::Tool),
            live: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool factory under a type name
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if the type name is taken
    pub fn register(&mut self, name: &str, factory: Arc<dyn ToolFactory>) -> Result<()> {
        self.factories.register(name, factory)
    }

    /// Registered factory type names
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        self.factories.names()
    }

    /// Check a tool configuration without building anything
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` or `ConfigValidation`
    pub fn check(&self, module_type: &str, config: &ModuleConfig) -> Result<()> {
        let factory = self.factories.get(module_type)?;
        factory.validate_config(config)?;
        factory.resources(config).map(|_| ())
    }

    /// Construct a tool instance and claim its resources
    ///
    /// Checking, building and claiming happen under one lock, so two
    /// constructions can never claim the same resource. On failure nothing
    /// is claimed and `create` may be called again.
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule`, `ConfigValidation`, `DuplicateName`,
    /// `ResourceConflict`, or `Construction`
    pub async fn create(
        &self,
        module_type: &str,
        instance: &str,
        config: &ModuleConfig,
    ) -> Result<Arc<dyn ToolAdapter>> {
        let factory = self.factories.get(module_type)?;
        factory.validate_config(config)?;
        let resources = factory.resources(config)?;

        let mut claims = self.claims.lock().await;

        if self.live.read().await.contains_key(instance) {
            return Err(Error::DuplicateName(format!("tool instance {instance}")));
        }

        for resource in &resources {
            if let Some(holder) = claims.get(resource) {
                return Err(Error::ResourceConflict {
                    resource: resource.clone(),
                    holder: holder.clone(),
                });
            }
        }

        let adapter = factory
            .build(instance, config)
            .map_err(|e| e.into_construction(instance))?;

        for resource in &resources {
            claims.insert(resource.clone(), instance.to_string());
        }
        self.live.write().await.insert(
            instance.to_string(),
            LiveTool {
                adapter: Arc::clone(&adapter),
                resources: resources.clone(),
            },
        );

        tracing::info!(
            tool = instance,
            module_type,
            resources = ?resources,
            "tool created"
        );
        Ok(adapter)
    }

    /// Look up a live tool
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ToolAdapter>> {
        self.live
            .read()
            .await
            .get(name)
            .map(|t| Arc::clone(&t.adapter))
    }

    /// Names of live tools, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.live.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch priority of a live tool
    pub async fn priority_of(&self, name: &str) -> Option<DispatchPriority> {
        self.live
            .read()
            .await
            .get(name)
            .map(|t| t.adapter.priority())
    }

    /// Function definitions of every live tool, sorted by name
    pub async fn definitions(&self) -> Vec<Value> {
        let live = self.live.read().await;
        let mut names: Vec<&String> = live.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|n| live.get(n))
            .map(|t| t.adapter.definition())
            .collect()
    }

    /// Snapshot of the claim table
    pub async fn claims(&self) -> HashMap<String, String> {
        self.claims.lock().await.clone()
    }

    /// Validate and execute one tool call
    ///
    /// Never returns an error: every failure becomes a failed result, a
    /// panicking adapter included.
    pub async fn dispatch(&self, request: &ToolCallRequest) -> ToolCallResult {
        let Some(adapter) = self.get(&request.tool_name).await else {
            tracing::warn!(tool = %request.tool_name, "call to unknown tool");
            return ToolCallResult::failure(
                request,
                &Error::UnknownModule(format!("tool {}", request.tool_name)),
            );
        };

        let params = match adapter.schema().validate(&request.merged_parameters()) {
            Ok(params) => params,
            Err(e) => {
                tracing::info!(tool = %request.tool_name, error = %e, "rejected tool parameters");
                return ToolCallResult::failure(request, &e);
            }
        };

        let timeout = adapter.timeout();
        let started = std::time::Instant::now();
        let execution = AssertUnwindSafe(adapter.execute(&params))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|payload| {
                    Err(Error::ToolExecution(format!(
                        "{} panicked: {}",
                        request.tool_name,
                        panic_message(payload.as_ref())
                    )))
                })
            });
        let outcome = tokio::time::timeout(timeout, execution).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Ok(Ok(output)) => {
                tracing::info!(
                    tool = %request.tool_name,
                    action = ?params.action(),
                    command = ?params.command(),
                    elapsed_ms,
                    "tool call succeeded"
                );
                ToolCallResult::success(request, output)
            }
            Ok(Err(e)) => {
                tracing::warn!(tool = %request.tool_name, error = %e, elapsed_ms, "tool call failed");
                ToolCallResult::failure(request, &e)
            }
            Err(_) => {
                let e = Error::ToolTimeout {
                    tool: request.tool_name.clone(),
                    timeout,
                };
                tracing::warn!(tool = %request.tool_name, ?timeout, "tool call timed out");
                ToolCallResult::failure(request, &e)
            }
        }
    }

    /// Shut down one tool and release its claims
    ///
    /// Returns whether the tool was live.
    pub async fn teardown(&self, name: &str) -> bool {
        let mut claims = self.claims.lock().await;
        let Some(tool) = self.live.write().await.remove(name) else {
            return false;
        };

        tool.adapter.shutdown().await;
        for resource in &tool.resources {
            claims.remove(resource);
        }
        tracing::info!(tool = name, "tool torn down");
        true
    }

    /// Shut down every tool and release all claims
    pub async fn teardown_all(&self) {
        for name in self.names().await {
            self.teardown(&name).await;
        }
    }
}
