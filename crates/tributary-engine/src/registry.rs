//! Plugin traits, dynamic dispatch wrappers, and the plugin registry.
//!
//! Transform nodes run a [`Transform`] plugin per row; aggregation nodes run
//! a [`BatchTransform`] plugin per flushed batch. The registry is built once
//! and handed to the orchestrator explicitly.

use std::collections::HashMap;

use async_trait::async_trait;

use tributary_types::{Result, RowData, TributaryError};

use crate::graph::NodeInfo;

// ---------------------------------------------------------------------------
// Plugin traits
// ---------------------------------------------------------------------------

/// Result of running a row transform.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Row(RowData),
    /// The row is dropped with an audited reason.
    Rejected { reason: String },
}

#[async_trait]
pub trait Transform: Send + Sync {
    /// Plugin name referenced by `NodeSettings::plugin`.
    fn name(&self) -> &str;

    async fn process(&self, row: &RowData, node: &NodeInfo) -> Result<TransformOutcome>;
}

#[async_trait]
pub trait BatchTransform: Send + Sync {
    fn name(&self) -> &str;

    /// Reduce a flushed batch (in arrival order) to one output row.
    async fn process_batch(&self, rows: &[RowData], node: &NodeInfo) -> Result<RowData>;
}

// ---------------------------------------------------------------------------
// Dyn wrappers
// ---------------------------------------------------------------------------

pub struct DynTransform(Box<dyn Transform>);

impl DynTransform {
    pub fn new(transform: impl Transform + 'static) -> Self {
        Self(Box::new(transform))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn process(&self, row: &RowData, node: &NodeInfo) -> Result<TransformOutcome> {
        self.0.process(row, node).await
    }
}

pub struct DynBatchTransform(Box<dyn BatchTransform>);

impl DynBatchTransform {
    pub fn new(transform: impl BatchTransform + 'static) -> Self {
        Self(Box::new(transform))
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub async fn process_batch(&self, rows: &[RowData], node: &NodeInfo) -> Result<RowData> {
        self.0.process_batch(rows, node).await
    }
}

// ---------------------------------------------------------------------------
// PluginRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PluginRegistry {
    transforms: HashMap<String, DynTransform>,
    batch_transforms: HashMap<String, DynBatchTransform>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transform(&mut self, transform: impl Transform + 'static) {
        let name = transform.name().to_string();
        self.transforms.insert(name, DynTransform::new(transform));
    }

    pub fn register_batch_transform(&mut self, transform: impl BatchTransform + 'static) {
        let name = transform.name().to_string();
        self.batch_transforms.insert(name, DynBatchTransform::new(transform));
    }

    pub fn transform(&self, name: &str) -> Option<&DynTransform> {
        self.transforms.get(name)
    }

    pub fn batch_transform(&self, name: &str) -> Option<&DynBatchTransform> {
        self.batch_transforms.get(name)
    }

    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }

    pub fn has_batch_transform(&self, name: &str) -> bool {
        self.batch_transforms.contains_key(name)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut transforms: Vec<_> = self.transforms.keys().collect();
        transforms.sort();
        let mut batch: Vec<_> = self.batch_transforms.keys().collect();
        batch.sort();
        f.debug_struct("PluginRegistry")
            .field("transforms", &transforms)
            .field("batch_transforms", &batch)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in plugins
// ---------------------------------------------------------------------------

/// Returns the row unchanged.
pub struct Passthrough;

#[async_trait]
impl Transform for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn process(&self, row: &RowData, _node: &NodeInfo) -> Result<TransformOutcome> {
        Ok(TransformOutcome::Row(row.clone()))
    }
}

/// Sets every field of `config.fields` on the row.
pub struct AddFields;

#[async_trait]
impl Transform for AddFields {
    fn name(&self) -> &str {
        "add_fields"
    }

    async fn process(&self, row: &RowData, node: &NodeInfo) -> Result<TransformOutcome> {
        let Some(fields) = node.config.get("fields").and_then(|f| f.as_object()) else {
            return Err(TributaryError::TransformError {
                plugin: self.name().into(),
                node: node.node_id.clone(),
                message: "config.fields must be an object".into(),
            });
        };
        let mut out = row.clone();
        for (field, value) in fields {
            out = out.with_field(field.clone(), value.clone());
        }
        Ok(TransformOutcome::Row(out))
    }
}

/// Rejects rows missing any field listed in `config.fields`.
pub struct RequireFields;

#[async_trait]
impl Transform for RequireFields {
    fn name(&self) -> &str {
        "require_fields"
    }

    async fn process(&self, row: &RowData, node: &NodeInfo) -> Result<TransformOutcome> {
        let Some(fields) = node.config.get("fields").and_then(|f| f.as_array()) else {
            return Err(TributaryError::TransformError {
                plugin: self.name().into(),
                node: node.node_id.clone(),
                message: "config.fields must be an array of field names".into(),
            });
        };
        let missing: Vec<&str> = fields
            .iter()
            .filter_map(|f| f.as_str())
            .filter(|f| row.get(f).is_none())
            .collect();
        if missing.is_empty() {
            Ok(TransformOutcome::Row(row.clone()))
        } else {
            Ok(TransformOutcome::Rejected {
                reason: format!("missing required fields: {}", missing.join(", ")),
            })
        }
    }
}

/// Collects a batch into `{"count": n, "rows": [...]}`.
pub struct Collect;

#[async_trait]
impl BatchTransform for Collect {
    fn name(&self) -> &str {
        "collect"
    }

    async fn process_batch(&self, rows: &[RowData], _node: &NodeInfo) -> Result<RowData> {
        let mut values = serde_json::Map::new();
        values.insert("count".into(), serde_json::Value::from(rows.len()));
        values.insert(
            "rows".into(),
            serde_json::Value::Array(rows.iter().map(RowData::to_value).collect()),
        );
        Ok(RowData::new(values))
    }
}

/// Create a registry with every built-in plugin registered.
pub fn default_registry() -> PluginRegistry {
    let mut reg = PluginRegistry::new();
    reg.register_transform(Passthrough);
    reg.register_transform(AddFields);
    reg.register_transform(RequireFields);
    reg.register_batch_transform(Collect);
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeType;
    use serde_json::json;

    fn node(plugin: &str, config: serde_json::Value) -> NodeInfo {
        NodeInfo {
            node_id: "n".into(),
            node_type: NodeType::Transform,
            plugin_name: plugin.into(),
            config,
        }
    }

    fn row(value: serde_json::Value) -> RowData {
        RowData::from_value(value).unwrap()
    }

    #[test]
    fn default_registry_has_builtins() {
        let reg = default_registry();
        assert!(reg.has_transform("passthrough"));
        assert!(reg.has_transform("add_fields"));
        assert!(reg.has_transform("require_fields"));
        assert!(reg.has_batch_transform("collect"));
        assert!(!reg.has_transform("collect"));
        assert_eq!(reg.transform("add_fields").unwrap().name(), "add_fields");
    }

    #[tokio::test]
    async fn add_fields_sets_configured_values() {
        let reg = default_registry();
        let out = reg
            .transform("add_fields")
            .unwrap()
            .process(&row(json!({"id": 1})), &node("add_fields", json!({"fields": {"score": 7}})))
            .await
            .unwrap();
        assert_eq!(out, TransformOutcome::Row(row(json!({"id": 1, "score": 7}))));
    }

    #[tokio::test]
    async fn add_fields_requires_object_config() {
        let err = AddFields
            .process(&row(json!({})), &node("add_fields", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, TributaryError::TransformError { .. }));
    }

    #[tokio::test]
    async fn require_fields_rejects_incomplete_rows() {
        let n = node("require_fields", json!({"fields": ["id", "name"]}));
        let ok = RequireFields.process(&row(json!({"id": 1, "name": "x"})), &n).await.unwrap();
        assert!(matches!(ok, TransformOutcome::Row(_)));
        let rejected = RequireFields.process(&row(json!({"id": 1})), &n).await.unwrap();
        assert_eq!(
            rejected,
            TransformOutcome::Rejected {
                reason: "missing required fields: name".into()
            }
        );
    }

    #[tokio::test]
    async fn collect_keeps_arrival_order() {
        let rows = vec![row(json!({"i": 1})), row(json!({"i": 2}))];
        let out = Collect.process_batch(&rows, &node("collect", json!({}))).await.unwrap();
        assert_eq!(out.to_value(), json!({"count": 2, "rows": [{"i": 1}, {"i": 2}]}));
    }
}
