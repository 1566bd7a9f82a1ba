//! The global tool index.
//!
//! Built once from every server's discovery result and never patched
//! afterwards; a name served twice fails the whole build.

use cortex_core::error::{RegistryError, SchemaError};
use cortex_core::ToolDescriptor;
use serde_json::Value;
use std::collections::HashMap;

use crate::schema;

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Index every discovered descriptor. Any duplicate name, whether across
    /// servers or within one, is a conflict and no registry is produced.
    pub fn build<I>(discovered: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = ToolDescriptor>,
    {
        let mut tools: HashMap<String, ToolDescriptor> = HashMap::new();
        for descriptor in discovered {
            if let Some(existing) = tools.get(&descriptor.name) {
                return Err(RegistryError::Conflict {
                    tool: descriptor.name,
                    first_server: existing.server_id.clone(),
                    second_server: descriptor.server_id,
                });
            }
            tools.insert(descriptor.name.clone(), descriptor);
        }
        Ok(Self { tools })
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, RegistryError> {
        self.tools
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn validate_arguments(
        &self,
        descriptor: &ToolDescriptor,
        arguments: &Value,
    ) -> Result<(), SchemaError> {
        schema::validate(&descriptor.input_schema, arguments)
    }

    /// Every descriptor, sorted by name.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self.tools.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Tool names served by one server, sorted.
    pub fn tools_for(&self, server_id: &str) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .tools
            .values()
            .filter(|d| d.server_id == server_id)
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        names
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
    use serde_json::json;

    fn tool(name: &str, server: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            server_id: server.into(),
            input_schema: json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }),
            description: String::new(),
        }
    }

    #[test]
    fn disjoint_servers_resolve_every_name() {
        let registry = ToolRegistry::build(vec![
            tool("add", "math"),
            tool("multiply", "math"),
            tool("search_documents", "docs"),
            tool("send_email", "gmail"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.resolve("add").unwrap().server_id, "math");
        assert_eq!(registry.resolve("search_documents").unwrap().server_id, "docs");
        assert_eq!(registry.resolve("send_email").unwrap().server_id, "gmail");
        assert_eq!(
            registry.resolve("unknown_fn").unwrap_err(),
            RegistryError::NotFound("unknown_fn".into())
        );
        assert_eq!(registry.tools_for("math"), vec!["add", "multiply"]);
    }

    #[test]
    fn duplicate_across_servers_fails_the_build() {
        let err = ToolRegistry::build(vec![
            tool("add", "math"),
            tool("search", "docs"),
            tool("search", "web"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                tool: "search".into(),
                first_server: "docs".into(),
                second_server: "web".into(),
            }
        );
        assert!(err.to_string().starts_with("registry_build_conflict"));
    }

    #[test]
    fn duplicate_within_a_server_fails_the_build() {
        let err = ToolRegistry::build(vec![tool("add", "math"), tool("add", "math")]).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { ref first_server, ref second_server, .. }
            if first_server == "math" && second_server == "math"));
    }

    #[test]
    fn validate_arguments_uses_the_descriptor_schema() {
        let registry = ToolRegistry::build(vec![tool("add", "math")]).unwrap();
        let add = registry.resolve("add").unwrap();
        assert!(registry.validate_arguments(add, &json!({"a": 2, "b": 3})).is_ok());
        assert_eq!(
            registry.validate_arguments(add, &json!({"a": 2})).unwrap_err(),
            SchemaError::MissingRequired("b".into())
        );
    }

    #[test]
    fn descriptors_are_sorted() {
        let registry = ToolRegistry::build(vec![tool("b", "s"), tool("a", "s")]).unwrap();
        let names: Vec<String> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(ToolRegistry::default().is_empty());
    }
}
