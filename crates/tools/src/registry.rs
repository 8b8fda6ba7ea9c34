//! Tool registry: builtin tools plus per-user tools registered by the
//! MCP bridge. Per-user tools are keyed on `(user_id, name)`; registering
//! the same key again replaces the definition.

use std::collections::HashMap;
use std::sync::Arc;

use cortex_domain::error::{Error, Result};
use cortex_domain::tool::ToolDefinition;
use parking_lot::RwLock;
use serde_json::Value;

/// Executable behavior behind a builtin tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, arguments: &Value) -> Result<String>;
}

struct BuiltinTool {
    def: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    builtins: RwLock<HashMap<String, BuiltinTool>>,
    /// (user_id, tool name) -> definition.
    user_tools: RwLock<HashMap<(String, String), ToolDefinition>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            builtins: RwLock::new(HashMap::new()),
            user_tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_builtin(&self, def: ToolDefinition, handler: Arc<dyn ToolHandler>) {
        let mut builtins = self.builtins.write();
        builtins.insert(def.name.clone(), BuiltinTool { def, handler });
    }

    /// Register (or replace) a per-user tool, e.g. from a bridge client.
    pub fn register_user_tool(&self, user_id: &str, def: ToolDefinition) {
        let mut user_tools = self.user_tools.write();
        user_tools.insert((user_id.to_owned(), def.name.clone()), def);
    }

    pub fn unregister_all_user_tools(&self, user_id: &str) -> usize {
        let mut user_tools = self.user_tools.write();
        let before = user_tools.len();
        user_tools.retain(|(uid, _), _| uid != user_id);
        before - user_tools.len()
    }

    /// The full catalog visible to a user: builtins plus their own tools,
    /// name-sorted for stable prompt rendering.
    pub fn available_for_user(&self, user_id: &str) -> Vec<ToolDefinition> {
        let mut out: Vec<ToolDefinition> = self
            .builtins
            .read()
            .values()
            .map(|t| t.def.clone())
            .collect();
        out.extend(
            self.user_tools
                .read()
                .iter()
                .filter(|((uid, _), _)| uid == user_id)
                .map(|(_, def)| def.clone()),
        );
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// User tools grouped by their `category` field (the bridge summary
    /// surface).
    pub fn user_tool_groups(&self, user_id: &str) -> HashMap<String, Vec<String>> {
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        for ((uid, name), def) in self.user_tools.read().iter() {
            if uid == user_id {
                groups.entry(def.category.clone()).or_default().push(name.clone());
            }
        }
        for names in groups.values_mut() {
            names.sort();
        }
        groups
    }

    /// Execute a builtin tool by name.
    pub async fn execute_builtin(&self, name: &str, arguments: &Value) -> Result<String> {
        let handler = {
            let builtins = self.builtins.read();
            builtins
                .get(name)
                .map(|t| t.handler.clone())
                .ok_or_else(|| Error::NotFound(format!("tool {name}")))?
        };
        handler.execute(arguments).await
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.read().contains_key(name)
    }

    /// Whether the named tool belongs to this user's bridge registrations.
    pub fn is_user_tool(&self, user_id: &str, name: &str) -> bool {
        self.user_tools
            .read()
            .contains_key(&(user_id.to_owned(), name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_domain::tool::ToolSource;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn execute(&self, arguments: &Value) -> Result<String> {
            Ok(arguments.to_string())
        }
    }

    fn def(name: &str, source: ToolSource, category: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: serde_json::json!({"type": "object"}),
            source,
            user_id: None,
            category: category.into(),
        }
    }

    #[tokio::test]
    async fn builtin_roundtrip() {
        let reg = ToolRegistry::new();
        reg.register_builtin(def("echo", ToolSource::Builtin, "util"), Arc::new(EchoHandler));
        assert!(reg.is_builtin("echo"));
        let out = reg
            .execute_builtin("echo", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(out, "{\"x\":1}");
        assert!(reg.execute_builtin("missing", &Value::Null).await.is_err());
    }

    #[test]
    fn user_tools_are_scoped_and_replaceable() {
        let reg = ToolRegistry::new();
        reg.register_user_tool("u1", def("notes", ToolSource::McpLocal, "productivity"));
        reg.register_user_tool("u1", def("notes", ToolSource::McpRemote, "productivity"));
        reg.register_user_tool("u2", def("notes", ToolSource::McpLocal, "productivity"));

        let u1 = reg.available_for_user("u1");
        assert_eq!(u1.len(), 1);
        assert_eq!(u1[0].source, ToolSource::McpRemote);
        assert!(reg.is_user_tool("u2", "notes"));
        assert!(!reg.is_user_tool("u3", "notes"));
    }

    #[test]
    fn unregister_all_clears_one_user_only() {
        let reg = ToolRegistry::new();
        reg.register_user_tool("u1", def("a", ToolSource::McpLocal, "x"));
        reg.register_user_tool("u1", def("b", ToolSource::McpLocal, "x"));
        reg.register_user_tool("u2", def("c", ToolSource::McpLocal, "x"));
        assert_eq!(reg.unregister_all_user_tools("u1"), 2);
        assert!(reg.available_for_user("u1").is_empty());
        assert_eq!(reg.available_for_user("u2").len(), 1);
    }

    #[test]
    fn catalog_is_name_sorted() {
        let reg = ToolRegistry::new();
        reg.register_builtin(def("zeta", ToolSource::Builtin, "util"), Arc::new(EchoHandler));
        reg.register_builtin(def("alpha", ToolSource::Builtin, "util"), Arc::new(EchoHandler));
        let names: Vec<String> = reg
            .available_for_user("u1")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn groups_by_category() {
        let reg = ToolRegistry::new();
        reg.register_user_tool("u1", def("calendar_read", ToolSource::McpRemote, "calendar"));
        reg.register_user_tool("u1", def("calendar_write", ToolSource::McpRemote, "calendar"));
        reg.register_user_tool("u1", def("send_mail", ToolSource::McpRemote, "mail"));
        let groups = reg.user_tool_groups("u1");
        assert_eq!(groups["calendar"], vec!["calendar_read", "calendar_write"]);
        assert_eq!(groups["mail"], vec!["send_mail"]);
    }
}
