//! The `Change` abstraction and the registry that builds changes from tag names.
//!
//! A change knows how to render its forward statements and, when it can,
//! the statements that undo it. Changelog loaders never construct concrete
//! change types directly: they look the tag name up in a [`ChangeRegistry`]
//! that was assembled at startup and handed to them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Result, TidemarkError};

/// One executable unit of SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// A single abstract change inside a change set.
pub trait Change: Send + Sync + fmt::Debug {
    /// Tag name this change is registered under (e.g. `createTable`).
    fn kind(&self) -> &'static str;

    /// Serialized authored content. Feeds the checksum, so it must be stable
    /// for identical input and must change whenever the authored content does.
    fn payload(&self) -> Value;

    /// Short human-readable summary for the ledger's description column.
    fn describe(&self) -> String {
        self.kind().to_string()
    }

    /// Structural problems with the definition. Empty when valid.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }

    /// Statements that apply the change.
    fn forward(&self) -> Vec<Statement>;

    /// Statements that undo the change, or `None` when no inverse exists.
    fn invert(&self) -> Option<Vec<Statement>> {
        None
    }

    /// Tag to stamp on the ledger row written for the owning change set.
    fn tag(&self) -> Option<&str> {
        None
    }
}

/// Builds a change from its serialized attributes.
pub type ChangeFactory = fn(&Value) -> Result<Arc<dyn Change>>;

/// Deserialize `value` into `C` and box it as a change. Used as a [`ChangeFactory`].
pub fn build<C>(value: &Value) -> Result<Arc<dyn Change>>
where
    C: Change + DeserializeOwned + 'static,
{
    let change: C = serde_json::from_value(value.clone())
        .map_err(|e| TidemarkError::ChangelogParseError(e.to_string()))?;
    Ok(Arc::new(change))
}

/// Factories keyed by change tag name.
#[derive(Clone, Default)]
pub struct ChangeRegistry {
    factories: BTreeMap<String, ChangeFactory>,
}

impl ChangeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in change kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::changes::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(&mut self, kind: &str, factory: ChangeFactory) -> &mut Self {
        self.factories.insert(kind.to_string(), factory);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a change of the given kind from its attributes.
    pub fn create(&self, kind: &str, attributes: &Value) -> Result<Arc<dyn Change>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| TidemarkError::UnknownChangeType {
                kind: kind.to_string(),
                available: self.kinds().join(", "),
            })?;
        factory(attributes).map_err(|e| match e {
            TidemarkError::ChangelogParseError(msg) => {
                TidemarkError::ChangelogParseError(format!("{}: {}", kind, msg))
            }
            other => other,
        })
    }
}

impl fmt::Debug for ChangeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Noop {
        label: String,
    }

    impl Change for Noop {
        fn kind(&self) -> &'static str {
            "noop"
        }
        fn payload(&self) -> Value {
            json!({ "label": self.label })
        }
        fn forward(&self) -> Vec<Statement> {
            vec![Statement::new(format!("SELECT '{}'", self.label))]
        }
    }

    #[test]
    fn test_register_custom_kind() {
        let mut registry = ChangeRegistry::new();
        registry.register("noop", build::<Noop>);
        let change = registry.create("noop", &json!({"label": "x"})).unwrap();
        assert_eq!(change.kind(), "noop");
        assert_eq!(change.forward()[0].sql(), "SELECT 'x'");
        assert!(change.invert().is_none());
    }

    #[test]
    fn test_unknown_kind_lists_available() {
        let registry = ChangeRegistry::with_builtins();
        let err = registry.create("frobnicate", &json!({})).unwrap_err();
        match err {
            TidemarkError::UnknownChangeType { kind, available } => {
                assert_eq!(kind, "frobnicate");
                assert!(available.contains("createTable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_bad_attributes_name_the_kind() {
        let registry = ChangeRegistry::with_builtins();
        let err = registry.create("createTable", &json!({"columns": 3})).unwrap_err();
        assert!(err.to_string().contains("createTable"));
    }
}
