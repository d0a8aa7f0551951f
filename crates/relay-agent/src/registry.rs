//! Tool registry: tools keyed by name, with their capability and compiled
//! argument schema

use std::collections::HashMap;
use std::sync::Arc;

use relay_ai::ToolSchema;
use serde_json::Value;

use crate::tool::{Interactive, PermissionAware, Tool, to_schema};

/// The extra protocol a tool speaks on top of [`Tool`]
#[derive(Clone)]
pub enum Capability {
    Plain,
    PermissionAware(Arc<dyn PermissionAware>),
    Interactive(Arc<dyn Interactive>),
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plain => "Plain",
            Self::PermissionAware(_) => "PermissionAware",
            Self::Interactive(_) => "Interactive",
        })
    }
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub capability: Capability,
    validator: Option<Arc<jsonschema::Validator>>,
}

impl RegisteredTool {
    fn new(tool: Arc<dyn Tool>, capability: Capability) -> Self {
        let validator = match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) => {
                tracing::warn!("Invalid schema for tool {}: {}", tool.name(), e);
                None
            }
        };
        Self {
            tool,
            capability,
            validator,
        }
    }

    /// Validate arguments against the tool's parameter schema. A tool whose
    /// schema failed to compile accepts anything.
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(arguments)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "Invalid arguments for {}: {}",
                self.tool.name(),
                errors.join("; ")
            ))
        }
    }

    pub fn name(&self) -> &str {
        self.tool.name()
    }
}

/// Registry passed to the controller at construction time
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.insert(Arc::new(tool), Capability::Plain);
    }

    pub fn register_permission_aware<T: Tool + PermissionAware + 'static>(&mut self, tool: T) {
        let tool = Arc::new(tool);
        let capability = Capability::PermissionAware(tool.clone());
        self.insert(tool, capability);
    }

    pub fn register_interactive<T: Tool + Interactive + 'static>(&mut self, tool: T) {
        let tool = Arc::new(tool);
        let capability = Capability::Interactive(tool.clone());
        self.insert(tool, capability);
    }

    fn insert(&mut self, tool: Arc<dyn Tool>, capability: Capability) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            tracing::warn!("Replacing already registered tool {}", name);
        } else {
            self.order.push(name.clone());
        }
        self.tools.insert(name, RegisteredTool::new(tool, capability));
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Tool names in registration order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Schemas sent with every model request, in registration order
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|t| to_schema(t.tool.as_ref()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolResult;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct PathTool;

    #[async_trait]
    impl Tool for PathTool {
        fn name(&self) -> &str {
            "path_tool"
        }
        fn description(&self) -> &str {
            "takes a path"
        }
        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        async fn execute(&self, _id: &str, _args: Value, _cancel: CancellationToken) -> ToolResult {
            ToolResult::text("ok")
        }
    }

    #[test]
    fn test_validation_reports_schema_errors() {
        let mut registry = ToolRegistry::new();
        registry.register(PathTool);
        let tool = registry.get("path_tool").unwrap();
        tool.validate(&json!({"path": "a"})).unwrap();

        let err = tool.validate(&json!({"path": 3})).unwrap_err();
        assert!(err.starts_with("Invalid arguments for path_tool"), "{}", err);
        assert!(err.contains("/path"), "{}", err);

        assert!(tool.validate(&json!({})).is_err());
    }

    #[test]
    fn test_schemas_in_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(PathTool);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), ["path_tool".to_string()]);
        assert!(matches!(
            registry.get("path_tool").unwrap().capability,
            Capability::Plain
        ));
        assert_eq!(registry.schemas()[0].name, "path_tool");
        assert!(registry.get("missing").is_none());
    }
}
