// ABOUTME: Immutable message catalog injected into transport components
//
// Human-readable failure text is looked up by (component, key) in a catalog
// value handed to each component at construction. Templates use positional
// `{0}`, `{1}` placeholders. Overrides come from the `[messages]` config table
// as `"component.key" = "template"`.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;

use thiserror::Error;

/// Stable identifier of a component owning catalog entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    /// Resource pool
    Pool,
    /// Fan-out sender
    Fanout,
    /// Heartbeat broadcaster
    Heartbeat,
    /// Admission gate
    Gate,
}

impl Component {
    /// Config-facing prefix of this component's keys
    pub const fn key(self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Fanout => "fanout",
            Self::Heartbeat => "heartbeat",
            Self::Gate => "gate",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "pool" => Some(Self::Pool),
            "fanout" => Some(Self::Fanout),
            "heartbeat" => Some(Self::Heartbeat),
            "gate" => Some(Self::Gate),
            _ => None,
        }
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Errors applying catalog overrides
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    /// Override key is not of the form `component.key`
    #[error("Malformed message key '{0}', expected 'component.key'")]
    MalformedKey(String),

    /// Override names a component that does not exist
    #[error("Unknown message component '{0}'")]
    UnknownComponent(String),
}

const BUILTIN: &[(Component, &str, &str)] = &[
    (Component::Pool, "exhausted", "No pooled resource became available within {0} ms"),
    (Component::Pool, "closed", "Resource pool is closed"),
    (Component::Pool, "createFailed", "Failed to create pooled resource: {0}"),
    (Component::Pool, "probeFailed", "Keepalive probe failed for resource {0}: {1}"),
    (Component::Fanout, "resourceUnavailable", "Unable to retrieve a sender within {0} ms"),
    (Component::Fanout, "retrieveFailed", "Sender could not be retrieved from the pool: {0}"),
    (Component::Fanout, "keepaliveFailed", "Keepalive after send failed: {0}"),
    (Component::Heartbeat, "openFailed", "Unable to open heartbeat socket for group {0}"),
    (Component::Heartbeat, "sendFailed", "Unable to send heartbeat to {0}"),
    (Component::Heartbeat, "notInitialized", "Heartbeat broadcaster has not been initialized"),
    (Component::Heartbeat, "closed", "Heartbeat broadcaster is closed"),
    (Component::Gate, "atCapacity", "Admission denied: all {0} permits in use"),
    (Component::Gate, "cancelled", "Admission denied: wait was cancelled"),
    (Component::Gate, "closed", "Admission denied: gate is closed"),
];

/// Immutable lookup of message templates by component and key
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    messages: HashMap<(Component, String), String>,
}

impl MessageCatalog {
    /// Catalog holding the built-in English templates
    pub fn builtin() -> Self {
        let messages = BUILTIN
            .iter()
            .map(|(component, key, template)| ((*component, (*key).to_string()), (*template).to_string()))
            .collect();
        Self { messages }
    }

    /// Built-in catalog with `component.key` overrides applied
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Result<Self, CatalogError> {
        let mut catalog = Self::builtin();
        for (full_key, template) in overrides {
            let (component, key) = full_key
                .split_once('.')
                .filter(|(c, k)| !c.is_empty() && !k.is_empty())
                .ok_or_else(|| CatalogError::MalformedKey(full_key.clone()))?;
            let component = Component::parse(component)
                .ok_or_else(|| CatalogError::UnknownComponent(component.to_string()))?;
            catalog.messages.insert((component, key.to_string()), template.clone());
        }
        Ok(catalog)
    }

    /// Shared handle for injection into components
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Raw template, or the key itself when absent
    pub fn get<'a>(&'a self, component: Component, key: &'a str) -> &'a str {
        self.messages
            .get(&(component, key.to_string()))
            .map_or(key, String::as_str)
    }

    /// Template with `{n}` placeholders replaced by `args[n]`
    pub fn format(&self, component: Component, key: &str, args: &[&dyn Display]) -> String {
        let mut out = self.get(component, key).to_string();
        for (i, arg) in args.iter().enumerate() {
            out = out.replace(&format!("{{{i}}}"), &arg.to_string());
        }
        out
    }
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup_and_format() {
        let catalog = MessageCatalog::builtin();
        assert_eq!(
            catalog.format(Component::Fanout, "resourceUnavailable", &[&50]),
            "Unable to retrieve a sender within 50 ms"
        );
        assert_eq!(catalog.get(Component::Pool, "closed"), "Resource pool is closed");
    }

    #[test]
    fn test_missing_key_falls_back_to_key() {
        let catalog = MessageCatalog::builtin();
        assert_eq!(catalog.get(Component::Gate, "nope"), "nope");
    }

    #[test]
    fn test_same_key_differs_by_component() {
        let catalog = MessageCatalog::builtin();
        assert_ne!(
            catalog.get(Component::Pool, "closed"),
            catalog.get(Component::Gate, "closed")
        );
    }

    #[test]
    fn test_overrides_replace_templates() {
        let mut overrides = HashMap::new();
        overrides.insert("gate.atCapacity".to_string(), "busy ({0})".to_string());
        let catalog = MessageCatalog::with_overrides(&overrides).unwrap();
        assert_eq!(catalog.format(Component::Gate, "atCapacity", &[&4]), "busy (4)");
    }

    #[test]
    fn test_override_errors() {
        let mut overrides = HashMap::new();
        overrides.insert("gate".to_string(), "x".to_string());
        assert_eq!(
            MessageCatalog::with_overrides(&overrides).unwrap_err(),
            CatalogError::MalformedKey("gate".to_string())
        );

        let mut overrides = HashMap::new();
        overrides.insert("valve.denied".to_string(), "x".to_string());
        assert_eq!(
            MessageCatalog::with_overrides(&overrides).unwrap_err(),
            CatalogError::UnknownComponent("valve".to_string())
        );
    }
}
