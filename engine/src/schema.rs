//! Model schemas and the schema registry.
//!
//! Schemas define the structure of models and enable validation of
//! payloads before they are written. The registry is built once at startup
//! and also knows the order in which models must be synced so that parents
//! arrive before their children.

use crate::{error::Result, Error, ModelName, Record, RecordId, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// System model persisting outbox entries.
pub const PENDING_MUTATION_MODEL: &str = "PendingMutation";

/// System model persisting per-model sync watermarks.
pub const LAST_SYNC_METADATA_MODEL: &str = "LastSyncMetadata";

/// Separator used to join composite primary key values.
pub const COMPOSITE_KEY_SEPARATOR: char = '#';

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Definition of a field in a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None | Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for a single model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSchema {
    pub name: ModelName,
    pub fields: Vec<FieldDef>,
    /// Primary key fields in key order
    pub primary_key: Vec<String>,
    /// Models that must be synced before this one
    pub parents: Vec<ModelName>,
}

impl ModelSchema {
    /// Create a model keyed by its `id` field.
    pub fn new(name: impl Into<ModelName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            primary_key: vec!["id".to_string()],
            parents: Vec::new(),
        }
    }

    /// Use a (possibly composite) custom primary key.
    pub fn with_primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Declare a parent model.
    pub fn with_parent(mut self, parent: impl Into<ModelName>) -> Self {
        self.parents.push(parent.into());
        self
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Derive the primary key string from a payload.
    pub fn record_id(&self, payload: &serde_json::Value) -> Result<RecordId> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for field in &self.primary_key {
            let part = match payload.get(field) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
                Some(serde_json::Value::Number(n)) => n.to_string(),
                Some(serde_json::Value::Bool(b)) => b.to_string(),
                _ => {
                    return Err(Error::MissingPrimaryKey {
                        model: self.name.clone(),
                        field: field.clone(),
                    })
                }
            };
            parts.push(part);
        }
        Ok(parts.join(&COMPOSITE_KEY_SEPARATOR.to_string()))
    }

    /// Validate a payload and wrap it in a new local record.
    pub fn record(&self, payload: serde_json::Value) -> Result<Record> {
        self.validate_payload(&payload)?;
        let id = self.record_id(&payload)?;
        Ok(Record::new(self.name.clone(), id, payload))
    }
}

/// Registry of every model known to the datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistry {
    pub version: SchemaVersion,
    /// Models in registration order, system models first
    models: Vec<ModelSchema>,
    index: HashMap<ModelName, usize>,
}

impl SchemaRegistry {
    /// Create a registry holding only the system models.
    pub fn new(version: SchemaVersion) -> Self {
        let mut registry = Self {
            version,
            models: Vec::new(),
            index: HashMap::new(),
        };
        registry.insert(ModelSchema::new(
            PENDING_MUTATION_MODEL,
            vec![
                FieldDef::required("id", FieldType::String),
                FieldDef::required("mutation", FieldType::Json),
            ],
        ));
        registry.insert(ModelSchema::new(
            LAST_SYNC_METADATA_MODEL,
            vec![
                FieldDef::required("id", FieldType::String),
                FieldDef::required("model", FieldType::String),
                FieldDef::optional("lastSyncTime", FieldType::Timestamp),
                FieldDef::optional("lastSyncType", FieldType::String),
            ],
        ));
        registry
    }

    /// Builder-style method to register a user model.
    pub fn with_model(mut self, schema: ModelSchema) -> Self {
        self.insert(schema);
        self
    }

    fn insert(&mut self, schema: ModelSchema) {
        match self.index.get(&schema.name) {
            Some(&position) => self.models[position] = schema,
            None => {
                self.index.insert(schema.name.clone(), self.models.len());
                self.models.push(schema);
            }
        }
    }

    /// Get a model schema by name.
    pub fn get(&self, name: &str) -> Option<&ModelSchema> {
        self.index.get(name).map(|&i| &self.models[i])
    }

    /// Get a model schema or fail with `ModelNotFound`.
    pub fn require(&self, name: &str) -> Result<&ModelSchema> {
        self.get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_system_model(name: &str) -> bool {
        name == PENDING_MUTATION_MODEL || name == LAST_SYNC_METADATA_MODEL
    }

    /// All models, system models included.
    pub fn models(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.iter()
    }

    /// User models in registration order.
    pub fn user_models(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models
            .iter()
            .filter(|m| !Self::is_system_model(&m.name))
    }

    /// User model names with parents ordered before their children.
    ///
    /// Ties keep registration order. Fails on unknown parents or cycles.
    pub fn topological_order(&self) -> Result<Vec<ModelName>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Visiting,
            Done,
        }

        let users: Vec<&ModelSchema> = self.user_models().collect();
        let position: HashMap<&str, usize> = users
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; users.len()];
        let mut order = Vec::with_capacity(users.len());

        fn visit(
            i: usize,
            users: &[&ModelSchema],
            position: &HashMap<&str, usize>,
            marks: &mut [Mark],
            order: &mut Vec<ModelName>,
        ) -> Result<()> {
            match marks[i] {
                Mark::Done => return Ok(()),
                Mark::Visiting => return Err(Error::SchemaCycle(users[i].name.clone())),
                Mark::Unvisited => {}
            }
            marks[i] = Mark::Visiting;
            for parent in &users[i].parents {
                let &p = position
                    .get(parent.as_str())
                    .ok_or_else(|| Error::UnknownParent {
                        model: users[i].name.clone(),
                        parent: parent.clone(),
                    })?;
                visit(p, users, position, marks, order)?;
            }
            marks[i] = Mark::Done;
            order.push(users[i].name.clone());
            Ok(())
        }

        for i in 0..users.len() {
            visit(i, &users, &position, &mut marks, &mut order)?;
        }
        Ok(order)
    }

    /// Check that the registry is internally consistent.
    pub fn validate(&self) -> Result<()> {
        for model in self.user_models() {
            if model.primary_key.is_empty() {
                return Err(Error::MissingPrimaryKey {
                    model: model.name.clone(),
                    field: String::new(),
                });
            }
        }
        self.topological_order().map(|_| ())
    }

    /// Validate a record's payload against its model.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        let schema = self.require(&record.model)?;
        if record.deleted {
            return Ok(());
        }
        schema.validate_payload(&record.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn blog_registry() -> SchemaRegistry {
        SchemaRegistry::new(1)
            .with_model(
                ModelSchema::new(
                    "Comment",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("content", FieldType::String),
                    ],
                )
                .with_parent("Post"),
            )
            .with_model(
                ModelSchema::new(
                    "Post",
                    vec![
                        FieldDef::required("id", FieldType::String),
                        FieldDef::required("title", FieldType::String),
                        FieldDef::optional("rating", FieldType::Int),
                    ],
                )
                .with_parent("Blog"),
            )
            .with_model(ModelSchema::new(
                "Blog",
                vec![FieldDef::required("id", FieldType::String)],
            ))
    }

    #[test]
    fn validate_valid_payload() {
        let registry = blog_registry();
        let post = registry.get("Post").unwrap();

        assert!(post
            .validate_payload(&json!({"id": "p1", "title": "Hello"}))
            .is_ok());
        assert!(post
            .validate_payload(&json!({"id": "p1", "title": "Hello", "rating": 5}))
            .is_ok());
    }

    #[test]
    fn validate_missing_and_null_required_field() {
        let registry = blog_registry();
        let post = registry.get("Post").unwrap();

        let result = post.validate_payload(&json!({"id": "p1"}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));

        let result = post.validate_payload(&json!({"id": "p1", "title": null}));
        assert!(matches!(result, Err(Error::MissingRequiredField(f)) if f == "title"));
    }

    #[test]
    fn validate_wrong_type() {
        let registry = blog_registry();
        let post = registry.get("Post").unwrap();

        let result = post.validate_payload(&json!({"id": "p1", "title": "t", "rating": "five"}));
        assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "rating"));
    }

    #[test]
    fn system_models_always_registered() {
        let registry = SchemaRegistry::new(3);

        assert!(registry.contains(PENDING_MUTATION_MODEL));
        assert!(registry.contains(LAST_SYNC_METADATA_MODEL));
        assert_eq!(registry.user_models().count(), 0);
        assert!(matches!(
            registry.require("Post"),
            Err(Error::ModelNotFound(m)) if m == "Post"
        ));
    }

    #[test]
    fn topological_order_puts_parents_first() {
        let registry = blog_registry();
        let order = registry.topological_order().unwrap();

        assert_eq!(order, vec!["Blog", "Post", "Comment"]);
    }

    #[test]
    fn topological_order_rejects_unknown_parent() {
        let registry = SchemaRegistry::new(1).with_model(
            ModelSchema::new("Comment", vec![]).with_parent("Post"),
        );

        assert!(matches!(
            registry.topological_order(),
            Err(Error::UnknownParent { parent, .. }) if parent == "Post"
        ));
    }

    #[test]
    fn topological_order_rejects_cycle() {
        let registry = SchemaRegistry::new(1)
            .with_model(ModelSchema::new("A", vec![]).with_parent("B"))
            .with_model(ModelSchema::new("B", vec![]).with_parent("A"));

        assert!(matches!(registry.validate(), Err(Error::SchemaCycle(_))));
    }

    #[test]
    fn composite_primary_key() {
        let schema = ModelSchema::new(
            "Membership",
            vec![
                FieldDef::required("team", FieldType::String),
                FieldDef::required("seat", FieldType::Int),
            ],
        )
        .with_primary_key(["team", "seat"]);

        let record = schema.record(json!({"team": "red", "seat": 7})).unwrap();
        assert_eq!(record.id, "red#7");

        let result = schema.record_id(&json!({"team": "red"}));
        assert!(matches!(result, Err(Error::MissingPrimaryKey { field, .. }) if field == "seat"));
    }

    #[test]
    fn field_type_display() {
        assert_eq!(FieldType::String.to_string(), "String");
        assert_eq!(FieldType::Int.to_string(), "Int");
        assert_eq!(FieldType::Json.to_string(), "Json");
    }

    #[test]
    fn json_field_accepts_any() {
        let schema = ModelSchema::new("Event", vec![FieldDef::required("data", FieldType::Json)]);

        assert!(schema.validate_payload(&json!({"data": "string"})).is_ok());
        assert!(schema.validate_payload(&json!({"data": [1, 2, 3]})).is_ok());
        assert!(schema
            .validate_payload(&json!({"data": {"nested": "object"}}))
            .is_ok());
    }
}
